//! Survey data model — questionnaires, questions, and authoring input.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of answer a question expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    OpenEnded,
    /// Integer rating from 1 to 5.
    Numeric,
    YesNo,
    MultipleChoice,
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenEnded => "open_ended",
            Self::Numeric => "numeric",
            Self::YesNo => "yes_no",
            Self::MultipleChoice => "multiple_choice",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a survey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurveyStatus {
    #[default]
    Draft,
    Active,
    Archived,
}

impl SurveyStatus {
    /// Whether new sessions may target a survey in this status.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for SurveyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SurveyStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown survey status: {other}")),
        }
    }
}

/// Voice / style parameters handed to channel adapters untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStyle {
    pub voice_type: String,
    pub voice_speed: String,
}

impl Default for VoiceStyle {
    fn default() -> Self {
        Self {
            voice_type: "neutral_female".to_string(),
            voice_speed: "normal".to_string(),
        }
    }
}

/// When the orchestrator may contact someone for this survey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingConstraints {
    /// Only dispatch between 09:00 and 17:00 local time.
    pub business_hours_only: bool,
    /// Never dispatch on Saturday or Sunday local time.
    pub avoid_weekends: bool,
    /// "Local" means the contact's timezone rather than the orchestrator's.
    pub respect_contact_timezone: bool,
}

impl Default for SchedulingConstraints {
    fn default() -> Self {
        Self {
            business_hours_only: true,
            avoid_weekends: true,
            respect_contact_timezone: true,
        }
    }
}

/// One node in the flow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    /// Text shown on written channels and in reports.
    pub text: String,
    /// Text spoken or sent when prompting.
    #[serde(alias = "voice_prompt")]
    pub prompt: String,
    #[serde(rename = "type", alias = "question_type")]
    pub question_type: QuestionType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
    /// Condition key → target question id.
    #[serde(default)]
    pub follow_up_logic: BTreeMap<String, String>,
}

fn default_required() -> bool {
    true
}

impl Question {
    pub fn new(id: impl Into<String>, text: impl Into<String>, question_type: QuestionType) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            prompt: text.clone(),
            text,
            question_type,
            required: true,
            options: Vec::new(),
            follow_up_logic: BTreeMap::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_route(mut self, condition: impl Into<String>, target: impl Into<String>) -> Self {
        self.follow_up_logic.insert(condition.into(), target.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Hint prepended to a re-prompt after an unusable answer.
    pub fn help_text(&self) -> String {
        match self.question_type {
            QuestionType::Numeric => "Please answer with a number from 1 to 5.".to_string(),
            QuestionType::YesNo => "Please answer yes or no.".to_string(),
            QuestionType::MultipleChoice => {
                let listed = self
                    .options
                    .iter()
                    .enumerate()
                    .map(|(i, o)| format!("{}. {}", i + 1, o))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Please choose one of: {listed}.")
            }
            QuestionType::OpenEnded => "Please share a short answer.".to_string(),
        }
    }
}

/// A named questionnaire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub intro_message: String,
    pub outro_message: String,
    pub voice: VoiceStyle,
    /// Ceiling for one attempt, in seconds.
    pub max_duration: u32,
    pub max_retries: u32,
    pub scheduling: SchedulingConstraints,
    pub status: SurveyStatus,
    pub questions: Vec<Question>,
    /// Bumped on every accepted edit. Sessions pin the revision they started with.
    pub revision: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Survey {
    /// Build a survey from authoring input with a fresh id at revision 1.
    pub fn from_draft(draft: SurveyDraft) -> Self {
        let now = Utc::now();
        let mut survey = Self {
            id: Uuid::new_v4(),
            title: String::new(),
            description: String::new(),
            intro_message: String::new(),
            outro_message: String::new(),
            voice: VoiceStyle::default(),
            max_duration: 0,
            max_retries: 0,
            scheduling: SchedulingConstraints::default(),
            status: SurveyStatus::Draft,
            questions: Vec::new(),
            revision: 1,
            created_at: now,
            updated_at: now,
        };
        survey.apply_draft(draft);
        survey
    }

    /// Overwrite the authored fields, keeping identity and timestamps.
    pub fn apply_draft(&mut self, draft: SurveyDraft) {
        self.title = draft.title;
        self.description = draft.description;
        self.intro_message = draft.intro_message;
        self.outro_message = draft.outro_message;
        self.voice = draft.voice;
        self.max_duration = draft.max_duration;
        self.max_retries = draft.max_retries;
        self.scheduling = SchedulingConstraints {
            business_hours_only: draft.business_hours_only,
            avoid_weekends: draft.avoid_weekends,
            respect_contact_timezone: draft.respect_contact_timezone,
        };
        self.status = draft.status;
        self.questions = draft.questions;
    }

    /// Total delivery attempts a session against this survey may use.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Authoring input for creating or replacing a survey.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurveyDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub intro_message: String,
    #[serde(default)]
    pub outro_message: String,
    #[serde(default)]
    pub voice: VoiceStyle,
    #[serde(default = "default_max_duration")]
    pub max_duration: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true", alias = "call_during_business_hours")]
    pub business_hours_only: bool,
    #[serde(default = "default_true")]
    pub avoid_weekends: bool,
    #[serde(default = "default_true", alias = "respect_timezone")]
    pub respect_contact_timezone: bool,
    #[serde(default)]
    pub status: SurveyStatus,
    #[serde(default)]
    pub questions: Vec<Question>,
}

fn default_max_duration() -> u32 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl SurveyDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            intro_message: String::new(),
            outro_message: String::new(),
            voice: VoiceStyle::default(),
            max_duration: default_max_duration(),
            max_retries: default_max_retries(),
            business_hours_only: true,
            avoid_weekends: true,
            respect_contact_timezone: true,
            status: SurveyStatus::Draft,
            questions: Vec::new(),
        }
    }

    pub fn question(mut self, question: Question) -> Self {
        self.questions.push(question);
        self
    }

    pub fn active(mut self) -> Self {
        self.status = SurveyStatus::Active;
        self
    }

    /// Lift all scheduling restrictions.
    pub fn anytime(mut self) -> Self {
        self.business_hours_only = false;
        self.avoid_weekends = false;
        self.respect_contact_timezone = false;
        self
    }
}
