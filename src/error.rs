//! Error types for callflow.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Survey validation failed: {0}")]
    Graph(#[from] GraphValidationError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflicting write to {entity} {id}: {message}")]
    Conflict {
        entity: String,
        id: String,
        message: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Transport-level errors raised by channel adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Delivery on channel {channel} failed: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("No adapter configured for channel {channel}")]
    NotConfigured { channel: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// Survey authoring defects. These block persistence and never reach the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphValidationError {
    #[error("Question id '{id}' is used more than once")]
    DuplicateQuestionId { id: String },

    #[error("Question '{question_id}' routes '{condition}' to unknown question '{target}'")]
    UnknownTarget {
        question_id: String,
        condition: String,
        target: String,
    },

    #[error("Multiple choice question '{question_id}' has no options")]
    MissingOptions { question_id: String },

    #[error("Question '{question_id}' ({question_type}) has invalid condition key '{condition}'")]
    InvalidConditionKey {
        question_id: String,
        question_type: String,
        condition: String,
    },

    #[error("Questions unreachable from the first question: {}", question_ids.join(", "))]
    Unreachable { question_ids: Vec<String> },
}

/// Errors raised while navigating a survey flow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("Survey has no questions")]
    EmptySurvey,

    #[error("Question '{0}' does not exist in this survey")]
    UnknownQuestion(String),

    #[error("Invalid answer for question '{question_id}': {reason}")]
    InvalidAnswer { question_id: String, reason: String },

    #[error("Required question '{question_id}' was not answered")]
    MissingRequiredAnswer { question_id: String },
}

impl FlowError {
    /// Whether the worker should re-prompt the same question.
    pub fn is_reprompt(&self) -> bool {
        matches!(
            self,
            FlowError::InvalidAnswer { .. } | FlowError::MissingRequiredAnswer { .. }
        )
    }
}

/// CallSession lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: Uuid },

    #[error("Survey {id} not found")]
    SurveyNotFound { id: Uuid },

    #[error("Survey {survey_id} is {status} and cannot be targeted by new sessions")]
    SurveyNotDispatchable { survey_id: Uuid, status: String },

    #[error("Session {id} is {from}, cannot transition to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Session {id} has used all {attempts} attempts")]
    RetryExhausted { id: Uuid, attempts: u32 },

    #[error("Session {id} expected an answer for '{expected}', got one for '{got}'")]
    StaleAnswer {
        id: Uuid,
        expected: String,
        got: String,
    },

    #[error("Session {id} is {status} and not accepting answers")]
    NotAcceptingAnswers { id: Uuid, status: String },

    #[error("Campaign {id} not found")]
    CampaignNotFound { id: Uuid },

    #[error("Campaign {campaign_id} runs survey {expected}, not {got}")]
    CampaignSurveyMismatch {
        campaign_id: Uuid,
        expected: Uuid,
        got: Uuid,
    },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
