//! Mapping from crate errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::{ChannelError, DatabaseError, Error, SessionError};

/// An error body `{"error": "..."}` with its status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Graph(_) | Error::Flow(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Database(DatabaseError::Conflict { .. }) => StatusCode::CONFLICT,
        Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Channel(ChannelError::NotConfigured { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Channel(ChannelError::UnknownDelivery(_)) => StatusCode::NOT_FOUND,
        Error::Channel(_) => StatusCode::BAD_GATEWAY,
        Error::Session(e) => match e {
            SessionError::NotFound { .. }
            | SessionError::SurveyNotFound { .. }
            | SessionError::CampaignNotFound { .. } => StatusCode::NOT_FOUND,
            SessionError::SurveyNotDispatchable { .. }
            | SessionError::CampaignSurveyMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::InvalidTransition { .. }
            | SessionError::RetryExhausted { .. }
            | SessionError::StaleAnswer { .. }
            | SessionError::NotAcceptingAnswers { .. } => StatusCode::CONFLICT,
        },
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<ChannelError> for ApiError {
    fn from(err: ChannelError) -> Self {
        Error::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
