//! Schema versions for the libSQL store.
//!
//! `schema_version` records every applied step. Steps run in order, each in
//! its own transaction together with its version row.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; never edit a released step.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS surveys (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                intro_message TEXT NOT NULL DEFAULT '',
                outro_message TEXT NOT NULL DEFAULT '',
                voice TEXT NOT NULL DEFAULT '{}',
                max_duration INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                business_hours_only INTEGER NOT NULL DEFAULT 1,
                avoid_weekends INTEGER NOT NULL DEFAULT 1,
                respect_contact_timezone INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'draft',
                questions TEXT NOT NULL DEFAULT '[]',
                revision INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_surveys_status ON surveys(status);

            CREATE TABLE IF NOT EXISTS survey_revisions (
                survey_id TEXT NOT NULL,
                revision INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (survey_id, revision)
            );

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                survey_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS call_sessions (
                id TEXT PRIMARY KEY,
                survey_id TEXT NOT NULL,
                survey_revision INTEGER NOT NULL,
                campaign_id TEXT,
                phone_number TEXT NOT NULL,
                contact_name TEXT,
                contact_timezone TEXT,
                channel TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'scheduled',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                scheduled_time TEXT NOT NULL,
                current_question_id TEXT,
                flow_complete INTEGER NOT NULL DEFAULT 0,
                answers TEXT NOT NULL DEFAULT '[]',
                last_failure_reason TEXT,
                notes TEXT,
                started_at TEXT,
                ended_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_due
                ON call_sessions(status, scheduled_time, priority);
            CREATE INDEX IF NOT EXISTS idx_sessions_campaign ON call_sessions(campaign_id);
        "#,
    },
    Migration {
        version: 2,
        name: "session_transitions",
        sql: r#"
            ALTER TABLE call_sessions ADD COLUMN transitions TEXT NOT NULL DEFAULT '[]';
        "#,
    },
];

fn failed(context: impl std::fmt::Display, e: libsql::Error) -> DatabaseError {
    DatabaseError::Migration(format!("{context}: {e}"))
}

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| failed("creating schema_version", e))?;

    let applied = schema_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);
    for step in pending {
        apply(conn, step).await?;
    }
    Ok(())
}

async fn apply(conn: &Connection, step: &Migration) -> Result<(), DatabaseError> {
    tracing::info!(version = step.version, name = step.name, "Upgrading schema");
    let context = || format!("schema step {} ({})", step.version, step.name);

    let tx = conn.transaction().await.map_err(|e| failed(context(), e))?;
    tx.execute_batch(step.sql)
        .await
        .map_err(|e| failed(context(), e))?;
    tx.execute(
        "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
        libsql::params![step.version, step.name],
    )
    .await
    .map_err(|e| failed(context(), e))?;
    tx.commit().await.map_err(|e| failed(context(), e))
}

/// Highest applied version; 0 for a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| failed("reading schema_version", e))?;
    let Some(row) = rows
        .next()
        .await
        .map_err(|e| failed("reading schema_version", e))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| failed("reading schema_version", e))
}
