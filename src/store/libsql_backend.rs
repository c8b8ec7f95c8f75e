//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Structured members
//! (questions, answers, transitions) are stored as JSON text columns.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::session::campaign::Campaign;
use crate::session::model::{CallSession, Contact, ContactTimezone, Priority};
use crate::session::state::SessionStatus;
use crate::store::migrations;
use crate::store::traits::Database;
use crate::survey::model::{SchedulingConstraints, Survey};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and simulations).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_sessions(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<CallSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            sessions.push(row_to_session(&row)?);
        }
        Ok(sessions)
    }

    async fn query_surveys(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Survey>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut surveys = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            surveys.push(row_to_survey(&row)?);
        }
        Ok(surveys)
    }

    async fn insert_revision(&self, survey: &Survey) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO survey_revisions (survey_id, revision, snapshot, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    survey.id.to_string(),
                    survey.revision as i64,
                    to_json(&survey)?,
                    ts(&survey.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_revision: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so text comparison orders correctly.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(v) => libsql::Value::Text(v),
        None => libsql::Value::Null,
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn parse_uuid(column: &str, raw: &str) -> Result<Uuid, DatabaseError> {
    raw.parse()
        .map_err(|e| DatabaseError::Serialization(format!("{column}: {e}")))
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row parse: {e}"))
}

const SURVEY_COLUMNS: &str = "id, title, description, intro_message, outro_message, voice, max_duration, max_retries, business_hours_only, avoid_weekends, respect_contact_timezone, status, questions, revision, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, survey_id, survey_revision, campaign_id, phone_number, contact_name, contact_timezone, channel, priority, status, attempt_count, scheduled_time, current_question_id, flow_complete, answers, last_failure_reason, notes, started_at, ended_at, transitions, created_at, updated_at";

/// Column order matches SURVEY_COLUMNS.
fn row_to_survey(row: &libsql::Row) -> Result<Survey, DatabaseError> {
    let id_str: String = row.get(0).map_err(row_err)?;
    let voice_str: String = row.get(5).map_err(row_err)?;
    let status_str: String = row.get(11).map_err(row_err)?;
    let questions_str: String = row.get(12).map_err(row_err)?;
    let created_str: String = row.get(14).map_err(row_err)?;
    let updated_str: String = row.get(15).map_err(row_err)?;

    Ok(Survey {
        id: parse_uuid("surveys.id", &id_str)?,
        title: row.get(1).map_err(row_err)?,
        description: row.get(2).map_err(row_err)?,
        intro_message: row.get(3).map_err(row_err)?,
        outro_message: row.get(4).map_err(row_err)?,
        voice: from_json("surveys.voice", &voice_str)?,
        max_duration: row.get::<i64>(6).map_err(row_err)? as u32,
        max_retries: row.get::<i64>(7).map_err(row_err)? as u32,
        scheduling: SchedulingConstraints {
            business_hours_only: row.get::<i64>(8).map_err(row_err)? != 0,
            avoid_weekends: row.get::<i64>(9).map_err(row_err)? != 0,
            respect_contact_timezone: row.get::<i64>(10).map_err(row_err)? != 0,
        },
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        questions: from_json("surveys.questions", &questions_str)?,
        revision: row.get::<i64>(13).map_err(row_err)? as u32,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order matches SESSION_COLUMNS.
fn row_to_session(row: &libsql::Row) -> Result<CallSession, DatabaseError> {
    let id_str: String = row.get(0).map_err(row_err)?;
    let survey_id_str: String = row.get(1).map_err(row_err)?;
    let campaign_str: Option<String> = row.get(3).ok();
    let timezone_str: Option<String> = row.get(6).ok();
    let channel_str: String = row.get(7).map_err(row_err)?;
    let status_str: String = row.get(9).map_err(row_err)?;
    let scheduled_str: String = row.get(11).map_err(row_err)?;
    let answers_str: String = row.get(14).map_err(row_err)?;
    let started_str: Option<String> = row.get(17).ok();
    let ended_str: Option<String> = row.get(18).ok();
    let transitions_str: String = row.get(19).map_err(row_err)?;
    let created_str: String = row.get(20).map_err(row_err)?;
    let updated_str: String = row.get(21).map_err(row_err)?;

    let timezone = timezone_str
        .map(|tz| tz.parse::<ContactTimezone>())
        .transpose()
        .map_err(DatabaseError::Serialization)?;

    Ok(CallSession {
        id: parse_uuid("call_sessions.id", &id_str)?,
        survey_id: parse_uuid("call_sessions.survey_id", &survey_id_str)?,
        survey_revision: row.get::<i64>(2).map_err(row_err)? as u32,
        campaign_id: campaign_str
            .map(|c| parse_uuid("call_sessions.campaign_id", &c))
            .transpose()?,
        contact: Contact {
            phone_number: row.get(4).map_err(row_err)?,
            name: row.get(5).ok(),
            timezone,
        },
        channel: channel_str.parse().map_err(DatabaseError::Serialization)?,
        priority: Priority::from_rank(row.get::<i64>(8).unwrap_or(1)),
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        attempt_count: row.get::<i64>(10).map_err(row_err)? as u32,
        scheduled_time: parse_datetime(&scheduled_str),
        current_question_id: row.get(12).ok(),
        flow_complete: row.get::<i64>(13).unwrap_or(0) != 0,
        answers: from_json("call_sessions.answers", &answers_str)?,
        last_failure_reason: row.get(15).ok(),
        notes: row.get(16).ok(),
        started_at: parse_optional_datetime(&started_str),
        ended_at: parse_optional_datetime(&ended_str),
        transitions: from_json("call_sessions.transitions", &transitions_str)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, DatabaseError> {
    let id_str: String = row.get(0).map_err(row_err)?;
    let survey_id_str: String = row.get(2).map_err(row_err)?;
    let created_str: String = row.get(3).map_err(row_err)?;
    Ok(Campaign {
        id: parse_uuid("campaigns.id", &id_str)?,
        name: row.get(1).map_err(row_err)?,
        survey_id: parse_uuid("campaigns.survey_id", &survey_id_str)?,
        created_at: parse_datetime(&created_str),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Surveys ─────────────────────────────────────────────────────

    async fn insert_survey(&self, survey: &Survey) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO surveys ({SURVEY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    survey.id.to_string(),
                    survey.title.clone(),
                    survey.description.clone(),
                    survey.intro_message.clone(),
                    survey.outro_message.clone(),
                    to_json(&survey.voice)?,
                    survey.max_duration as i64,
                    survey.max_retries as i64,
                    survey.scheduling.business_hours_only as i64,
                    survey.scheduling.avoid_weekends as i64,
                    survey.scheduling.respect_contact_timezone as i64,
                    survey.status.to_string(),
                    to_json(&survey.questions)?,
                    survey.revision as i64,
                    ts(&survey.created_at),
                    ts(&survey.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_survey: {e}")))?;

        self.insert_revision(survey).await?;
        debug!(survey_id = %survey.id, revision = survey.revision, "Survey inserted");
        Ok(())
    }

    async fn update_survey(&self, survey: &Survey) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE surveys SET title=?1, description=?2, intro_message=?3, outro_message=?4,
                    voice=?5, max_duration=?6, max_retries=?7, business_hours_only=?8,
                    avoid_weekends=?9, respect_contact_timezone=?10, status=?11, questions=?12,
                    revision=?13, updated_at=?14
                 WHERE id=?15 AND revision=?16",
                params![
                    survey.title.clone(),
                    survey.description.clone(),
                    survey.intro_message.clone(),
                    survey.outro_message.clone(),
                    to_json(&survey.voice)?,
                    survey.max_duration as i64,
                    survey.max_retries as i64,
                    survey.scheduling.business_hours_only as i64,
                    survey.scheduling.avoid_weekends as i64,
                    survey.scheduling.respect_contact_timezone as i64,
                    survey.status.to_string(),
                    to_json(&survey.questions)?,
                    survey.revision as i64,
                    ts(&survey.updated_at),
                    survey.id.to_string(),
                    i64::from(survey.revision) - 1,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_survey: {e}")))?;

        if count == 0 {
            let id = survey.id.to_string();
            return Err(match self.get_survey(survey.id).await? {
                Some(current) => DatabaseError::Conflict {
                    entity: "survey".into(),
                    id,
                    message: format!(
                        "revision {} is current, cannot write revision {}",
                        current.revision, survey.revision
                    ),
                },
                None => DatabaseError::NotFound {
                    entity: "survey".into(),
                    id,
                },
            });
        }

        self.insert_revision(survey).await?;
        debug!(survey_id = %survey.id, revision = survey.revision, "Survey updated");
        Ok(())
    }

    async fn get_survey(&self, id: Uuid) -> Result<Option<Survey>, DatabaseError> {
        let mut surveys = self
            .query_surveys(
                "get_survey",
                &format!("SELECT {SURVEY_COLUMNS} FROM surveys WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(surveys.pop())
    }

    async fn list_surveys(&self) -> Result<Vec<Survey>, DatabaseError> {
        self.query_surveys(
            "list_surveys",
            &format!("SELECT {SURVEY_COLUMNS} FROM surveys ORDER BY created_at ASC"),
            (),
        )
        .await
    }

    async fn delete_survey(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM surveys WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_survey: {e}")))?;
        Ok(count > 0)
    }

    async fn get_survey_revision(
        &self,
        id: Uuid,
        revision: u32,
    ) -> Result<Option<Survey>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT snapshot FROM survey_revisions WHERE survey_id = ?1 AND revision = ?2",
                params![id.to_string(), revision as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_survey_revision: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let snapshot: String = row.get(0).map_err(row_err)?;
                Ok(Some(from_json("survey_revisions.snapshot", &snapshot)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_survey_revision: {e}"))),
        }
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO campaigns (id, name, survey_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    campaign.id.to_string(),
                    campaign.name.clone(),
                    campaign.survey_id.to_string(),
                    ts(&campaign.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_campaign: {e}")))?;
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, survey_id, created_at FROM campaigns WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_campaign: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_campaign(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_campaign: {e}"))),
        }
    }

    async fn list_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, survey_id, created_at FROM campaigns ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaigns: {e}")))?;

        let mut campaigns = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_campaigns: {e}")))?
        {
            campaigns.push(row_to_campaign(&row)?);
        }
        Ok(campaigns)
    }

    // ── Sessions ────────────────────────────────────────────────────

    async fn insert_session(&self, session: &CallSession) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO call_sessions ({SESSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                             ?16, ?17, ?18, ?19, ?20, ?21, ?22)"
                ),
                params![
                    session.id.to_string(),
                    session.survey_id.to_string(),
                    session.survey_revision as i64,
                    opt_text(session.campaign_id.map(|c| c.to_string())),
                    session.contact.phone_number.clone(),
                    opt_text(session.contact.name.clone()),
                    opt_text(session.contact.timezone.map(String::from)),
                    session.channel.to_string(),
                    session.priority.rank(),
                    session.status.to_string(),
                    session.attempt_count as i64,
                    ts(&session.scheduled_time),
                    opt_text(session.current_question_id.clone()),
                    session.flow_complete as i64,
                    to_json(&session.answers)?,
                    opt_text(session.last_failure_reason.clone()),
                    opt_text(session.notes.clone()),
                    opt_text(session.started_at.as_ref().map(ts)),
                    opt_text(session.ended_at.as_ref().map(ts)),
                    to_json(&session.transitions)?,
                    ts(&session.created_at),
                    ts(&session.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_session: {e}")))?;

        debug!(session_id = %session.id, "Session inserted");
        Ok(())
    }

    async fn save_session(&self, session: &CallSession) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE call_sessions SET status=?1, attempt_count=?2, scheduled_time=?3,
                    current_question_id=?4, flow_complete=?5, answers=?6, last_failure_reason=?7,
                    notes=?8, started_at=?9, ended_at=?10, transitions=?11, priority=?12,
                    updated_at=?13
                 WHERE id=?14",
                params![
                    session.status.to_string(),
                    session.attempt_count as i64,
                    ts(&session.scheduled_time),
                    opt_text(session.current_question_id.clone()),
                    session.flow_complete as i64,
                    to_json(&session.answers)?,
                    opt_text(session.last_failure_reason.clone()),
                    opt_text(session.notes.clone()),
                    opt_text(session.started_at.as_ref().map(ts)),
                    opt_text(session.ended_at.as_ref().map(ts)),
                    to_json(&session.transitions)?,
                    session.priority.rank(),
                    ts(&session.updated_at),
                    session.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_session: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "call_session".into(),
                id: session.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<CallSession>, DatabaseError> {
        let mut sessions = self
            .query_sessions(
                "get_session",
                &format!("SELECT {SESSION_COLUMNS} FROM call_sessions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(sessions.pop())
    }

    async fn list_due_sessions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CallSession>, DatabaseError> {
        self.query_sessions(
            "list_due_sessions",
            &format!(
                "SELECT {SESSION_COLUMNS} FROM call_sessions
                 WHERE status = 'scheduled' AND scheduled_time <= ?1
                 ORDER BY scheduled_time ASC, priority ASC, created_at ASC
                 LIMIT ?2"
            ),
            params![ts(&now), limit as i64],
        )
        .await
    }

    async fn list_sessions_by_status(
        &self,
        status: SessionStatus,
    ) -> Result<Vec<CallSession>, DatabaseError> {
        self.query_sessions(
            "list_sessions_by_status",
            &format!(
                "SELECT {SESSION_COLUMNS} FROM call_sessions WHERE status = ?1
                 ORDER BY scheduled_time ASC"
            ),
            params![status.to_string()],
        )
        .await
    }

    async fn list_sessions_by_campaign(
        &self,
        campaign_id: Uuid,
    ) -> Result<Vec<CallSession>, DatabaseError> {
        self.query_sessions(
            "list_sessions_by_campaign",
            &format!(
                "SELECT {SESSION_COLUMNS} FROM call_sessions WHERE campaign_id = ?1
                 ORDER BY created_at ASC"
            ),
            params![campaign_id.to_string()],
        )
        .await
    }

    async fn list_recent_sessions(&self, limit: usize) -> Result<Vec<CallSession>, DatabaseError> {
        self.query_sessions(
            "list_recent_sessions",
            &format!(
                "SELECT {SESSION_COLUMNS} FROM call_sessions ORDER BY created_at DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
        .await
    }
}
