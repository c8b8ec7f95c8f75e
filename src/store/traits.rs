//! `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::session::campaign::Campaign;
use crate::session::model::CallSession;
use crate::session::state::SessionStatus;
use crate::survey::model::Survey;

/// Backend-agnostic database trait covering surveys, campaigns, and sessions.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Surveys ─────────────────────────────────────────────────────

    /// Insert a new survey and record its first revision.
    async fn insert_survey(&self, survey: &Survey) -> Result<(), DatabaseError>;

    /// Overwrite the current survey row and record `survey.revision` as a new
    /// snapshot. Fails with `Conflict` unless the stored row is at
    /// `survey.revision - 1`.
    async fn update_survey(&self, survey: &Survey) -> Result<(), DatabaseError>;

    /// Current (latest) version of a survey.
    async fn get_survey(&self, id: Uuid) -> Result<Option<Survey>, DatabaseError>;

    async fn list_surveys(&self) -> Result<Vec<Survey>, DatabaseError>;

    /// Delete the current survey row. Revision snapshots are kept for
    /// sessions that still reference them.
    async fn delete_survey(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// An immutable snapshot of one accepted revision.
    async fn get_survey_revision(
        &self,
        id: Uuid,
        revision: u32,
    ) -> Result<Option<Survey>, DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError>;

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &CallSession) -> Result<(), DatabaseError>;

    /// Persist every mutable field of a session.
    async fn save_session(&self, session: &CallSession) -> Result<(), DatabaseError>;

    async fn get_session(&self, id: Uuid) -> Result<Option<CallSession>, DatabaseError>;

    /// `scheduled` sessions with `scheduled_time <= now`, oldest first, then by priority.
    async fn list_due_sessions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallSession>, DatabaseError>;

    async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<CallSession>, DatabaseError>;

    async fn list_sessions_by_campaign(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CallSession>, DatabaseError>;

    /// Most recently created sessions, up to `limit`.
    async fn list_recent_sessions(&self, limit: usize) -> Result<Vec<CallSession>, DatabaseError>;
}
