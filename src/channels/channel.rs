//! Channel adapter contract and the event vocabulary adapters report back.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ChannelError;
use crate::session::model::Contact;
use crate::survey::model::{Question, QuestionType, Survey, VoiceStyle};

/// Where an adapter posts events for a live attempt.
pub type EventSender = mpsc::Sender<ChannelEvent>;

/// What a prompt is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Intro,
    Question,
    /// The same question again, prefixed with help text.
    Reprompt,
    Outro,
}

/// One unit of content handed to an adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub session_id: Uuid,
    pub kind: PromptKind,
    pub question_id: Option<String>,
    pub text: String,
    pub question_type: Option<QuestionType>,
    pub options: Vec<String>,
    pub voice: VoiceStyle,
}

impl Prompt {
    pub fn intro(session_id: Uuid, survey: &Survey) -> Self {
        Self::message(session_id, PromptKind::Intro, &survey.intro_message, survey)
    }

    pub fn outro(session_id: Uuid, survey: &Survey) -> Self {
        Self::message(session_id, PromptKind::Outro, &survey.outro_message, survey)
    }

    pub fn question(session_id: Uuid, question: &Question, voice: &VoiceStyle) -> Self {
        Self {
            session_id,
            kind: PromptKind::Question,
            question_id: Some(question.id.clone()),
            text: question.prompt.clone(),
            question_type: Some(question.question_type),
            options: question.options.clone(),
            voice: voice.clone(),
        }
    }

    pub fn reprompt(session_id: Uuid, question: &Question, voice: &VoiceStyle) -> Self {
        Self {
            kind: PromptKind::Reprompt,
            text: format!("{} {}", question.help_text(), question.prompt),
            ..Self::question(session_id, question, voice)
        }
    }

    /// Whether the worker waits for an answer after delivering this.
    pub fn expects_answer(&self) -> bool {
        matches!(self.kind, PromptKind::Question | PromptKind::Reprompt)
    }

    fn message(session_id: Uuid, kind: PromptKind, text: &str, survey: &Survey) -> Self {
        Self {
            session_id,
            kind,
            question_id: None,
            text: text.to_string(),
            question_type: None,
            options: Vec::new(),
            voice: survey.voice.clone(),
        }
    }
}

/// Returned by `deliver`; identifies the delivery in events and `cancel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub delivery_id: String,
    /// Name of the adapter that accepted the delivery.
    pub adapter: String,
}

/// Event vocabulary an adapter emits for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventKind {
    Ringing,
    Answered,
    /// Raw transcript or keypad code.
    AnswerCaptured(String),
    NoAnswer,
    Busy,
    /// Transport failure with a reason code.
    Failed(String),
    /// The channel session has ended.
    Completed,
}

impl ChannelEventKind {
    /// Parse the wire form used by gateways: an event name plus optional value.
    pub fn from_wire(event: &str, value: Option<String>) -> Result<Self, String> {
        match event {
            "ringing" => Ok(Self::Ringing),
            "answered" => Ok(Self::Answered),
            "answer_captured" => Ok(Self::AnswerCaptured(value.unwrap_or_default())),
            "no_answer" => Ok(Self::NoAnswer),
            "busy" => Ok(Self::Busy),
            "failed" => Ok(Self::Failed(value.unwrap_or_else(|| "unknown".to_string()))),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown channel event: {other}")),
        }
    }

    /// Whether the delivery is over once this arrives.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoAnswer | Self::Busy | Self::Failed(_) | Self::Completed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub delivery_id: String,
    pub kind: ChannelEventKind,
}

impl ChannelEvent {
    pub fn new(delivery_id: impl Into<String>, kind: ChannelEventKind) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            kind,
        }
    }
}

/// Transport behind one or more channel kinds (voice, WhatsApp, SMS).
///
/// Adapters never call into the orchestrator. They post `ChannelEvent`s on the
/// sender handed to `deliver` and the attempt worker consumes them.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Adapter name for logging.
    fn name(&self) -> &str;

    /// Begin delivering one prompt.
    async fn deliver(
        &self,
        contact: &Contact,
        prompt: &Prompt,
        events: EventSender,
    ) -> Result<DeliveryHandle, ChannelError>;

    /// Best-effort abort of a delivery.
    async fn cancel(&self, handle: &DeliveryHandle) -> Result<(), ChannelError>;

    /// Drop any bookkeeping for a delivery that needs no more events. Unlike
    /// `cancel` this never reaches the transport.
    async fn release(&self, _handle: &DeliveryHandle) {}

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::model::SurveyDraft;

    #[test]
    fn wire_events_parse() {
        assert_eq!(
            ChannelEventKind::from_wire("answer_captured", Some("4".into())).unwrap(),
            ChannelEventKind::AnswerCaptured("4".into())
        );
        assert_eq!(
            ChannelEventKind::from_wire("failed", None).unwrap(),
            ChannelEventKind::Failed("unknown".into())
        );
        assert!(ChannelEventKind::from_wire("voicemail", None).is_err());
        assert!(ChannelEventKind::Busy.is_terminal());
        assert!(!ChannelEventKind::Answered.is_terminal());
    }

    #[test]
    fn reprompt_carries_help_text() {
        let q = Question::new("q1", "Rate us", QuestionType::Numeric);
        let p = Prompt::reprompt(Uuid::new_v4(), &q, &VoiceStyle::default());
        assert_eq!(p.kind, PromptKind::Reprompt);
        assert_eq!(p.text, "Please answer with a number from 1 to 5. Rate us");
        assert!(p.expects_answer());
    }

    #[test]
    fn intro_expects_nothing() {
        let mut draft = SurveyDraft::new("s");
        draft.intro_message = "Hi, this is a short survey.".into();
        let survey = Survey::from_draft(draft);
        let p = Prompt::intro(Uuid::new_v4(), &survey);
        assert!(!p.expects_answer());
        assert_eq!(p.text, "Hi, this is a short survey.");
    }
}
