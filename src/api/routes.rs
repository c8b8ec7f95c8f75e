//! REST endpoints for surveys, campaigns, sessions, and gateway callbacks.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::Authenticated;
use crate::api::error::ApiError;
use crate::channels::{ChannelEvent, ChannelEventKind, PendingDeliveries};
use crate::orchestrator::{Orchestrator, ScheduleRequest};
use crate::session::state::SessionStatus;
use crate::survey::model::SurveyDraft;

const DEFAULT_LIST_LIMIT: usize = 100;

/// Shared state for the control API.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    /// Deliveries awaiting gateway callbacks.
    pub pending: Arc<PendingDeliveries>,
    pub bearer_token: Option<SecretString>,
}

/// Build the control API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/surveys", get(list_surveys).post(create_survey))
        .route(
            "/api/surveys/{id}",
            get(get_survey).put(update_survey).delete(delete_survey),
        )
        .route("/api/campaigns", get(list_campaigns).post(create_campaign))
        .route("/api/campaigns/{id}", get(campaign_status))
        .route("/api/sessions", get(list_sessions).post(schedule_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/sessions/{id}/pause", post(pause_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/retry", post(retry_session))
        .route("/api/dispatch", post(dispatch_now))
        .route("/api/channel-events", post(channel_event))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let channels: Vec<String> = state
        .orchestrator
        .channels()
        .kinds()
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(serde_json::json!({
        "status": "ok",
        "service": "callflow",
        "live_attempts": state.orchestrator.live_count().await,
        "channels": channels,
    }))
}

// ── Surveys ─────────────────────────────────────────────────────────────

async fn list_surveys(
    _auth: Authenticated,
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.surveys().list().await?))
}

async fn create_survey(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Json(draft): Json<SurveyDraft>,
) -> Result<impl IntoResponse, ApiError> {
    let survey = state.orchestrator.surveys().create(draft).await?;
    Ok((StatusCode::CREATED, Json(survey)))
}

async fn get_survey(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .orchestrator
        .surveys()
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Survey {id} not found")))
}

async fn update_survey(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(draft): Json<SurveyDraft>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.surveys().update(id, draft).await?))
}

async fn delete_survey(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.orchestrator.surveys().delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Survey {id} not found")))
    }
}

// ── Campaigns ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateCampaign {
    name: String,
    survey_id: Uuid,
}

async fn list_campaigns(
    _auth: Authenticated,
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.list_campaigns().await?))
}

async fn create_campaign(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Json(body): Json<CreateCampaign>,
) -> Result<impl IntoResponse, ApiError> {
    let campaign = state
        .orchestrator
        .create_campaign(&body.name, body.survey_id)
        .await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn campaign_status(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (campaign, stats) = state.orchestrator.campaign_status(id).await?;
    Ok(Json(serde_json::json!({
        "campaign": campaign,
        "stats": stats,
    })))
}

// ── Sessions ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SessionQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_sessions(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Query(query): Query<SessionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SessionStatus>)
        .transpose()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    Ok(Json(state.orchestrator.list_sessions(status, limit).await?))
}

async fn schedule_session(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.orchestrator.schedule_session(request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.get_session(id).await?))
}

async fn cancel_session(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.cancel_session(id).await?))
}

async fn pause_session(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.pause_session(id).await?))
}

async fn resume_session(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.resume_session(id).await?))
}

async fn retry_session(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.retry_session_now(id).await?))
}

async fn dispatch_now(
    _auth: Authenticated,
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.run_dispatch_pass().await?))
}

// ── Gateway callbacks ───────────────────────────────────────────────────

/// Event reported by a transport gateway for one delivery.
#[derive(Debug, Deserialize)]
struct ChannelEventBody {
    delivery_id: String,
    event: String,
    #[serde(default)]
    value: Option<String>,
}

async fn channel_event(
    _auth: Authenticated,
    State(state): State<ApiState>,
    Json(body): Json<ChannelEventBody>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = ChannelEventKind::from_wire(&body.event, body.value)
        .map_err(|e| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, e))?;
    tracing::debug!(delivery_id = %body.delivery_id, kind = ?kind, "Gateway event received");
    state
        .pending
        .route(ChannelEvent::new(body.delivery_id, kind))
        .await?;
    Ok(StatusCode::ACCEPTED)
}
