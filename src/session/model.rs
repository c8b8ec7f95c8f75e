//! CallSession record and the contact / channel types it carries.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;
use crate::session::state::{SessionStatus, StateTransition, push_transition};
use crate::survey::model::Survey;

/// Delivery transport preferred for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Voice,
    WhatsApp,
    Sms,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::WhatsApp => "whatsapp",
            Self::Sms => "sms",
        }
    }

    pub const ALL: [ChannelKind; 3] = [Self::Voice, Self::WhatsApp, Self::Sms];
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voice" => Ok(Self::Voice),
            "whatsapp" => Ok(Self::WhatsApp),
            "sms" => Ok(Self::Sms),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// Dispatch tie-breaker among sessions due at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort rank, lower dispatches first.
    pub fn rank(&self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => Self::High,
            2 => Self::Low,
            _ => Self::Normal,
        }
    }
}

/// A contact's timezone as a fixed UTC offset.
///
/// Accepts `UTC`, `Z`, `UTC-5`, `UTC+05:30`, `-05:00`, `+0530`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContactTimezone(FixedOffset);

impl ContactTimezone {
    pub fn offset(&self) -> FixedOffset {
        self.0
    }

    pub fn from_offset(offset: FixedOffset) -> Self {
        Self(offset)
    }
}

impl FromStr for ContactTimezone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid timezone offset: {s}");
        let trimmed = s.trim();
        let rest = trimmed
            .strip_prefix("UTC")
            .or_else(|| trimmed.strip_prefix("GMT"))
            .unwrap_or(trimmed);

        if rest.is_empty() || rest == "Z" {
            return FixedOffset::east_opt(0).map(Self).ok_or_else(bad);
        }

        let (sign, digits) = match rest.split_at_checked(1) {
            Some(("+", d)) => (1, d),
            Some(("-", d)) => (-1, d),
            _ => return Err(bad()),
        };

        let (hours, minutes) = if let Some((h, m)) = digits.split_once(':') {
            (h, m)
        } else if digits.len() == 4 {
            digits.split_at(2)
        } else {
            (digits, "0")
        };

        let hours: u8 = hours.parse().map_err(|_| bad())?;
        let minutes: u8 = minutes.parse().map_err(|_| bad())?;
        if hours > 14 || minutes > 59 {
            return Err(bad());
        }

        FixedOffset::east_opt(sign * (i32::from(hours) * 3600 + i32::from(minutes) * 60))
            .map(Self)
            .ok_or_else(bad)
    }
}

impl TryFrom<String> for ContactTimezone {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContactTimezone> for String {
    fn from(tz: ContactTimezone) -> Self {
        tz.0.to_string()
    }
}

impl std::fmt::Display for ContactTimezone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who is being surveyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub phone_number: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timezone: Option<ContactTimezone>,
}

impl Contact {
    pub fn new(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            name: None,
            timezone: None,
        }
    }

    pub fn with_timezone(mut self, timezone: ContactTimezone) -> Self {
        self.timezone = Some(timezone);
        self
    }
}

/// One accepted answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedAnswer {
    pub question_id: String,
    /// Raw text or keypad code as reported by the channel.
    pub value: String,
    pub captured_at: DateTime<Utc>,
}

/// Why an attempt ended without completing the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoAnswer,
    Busy,
    /// Adapter-reported failure with its reason code.
    ChannelFailed(String),
    /// `max_duration` elapsed mid-flow.
    Timeout,
    /// The channel session ended before the flow did.
    HungUp,
    /// Re-prompts ran out for the named question.
    UnresolvedAnswer(String),
    /// The adapter could not start delivery at all.
    DeliveryFailed(String),
    /// The process stopped while the attempt was live.
    Interrupted,
}

impl FailureReason {
    /// Human-readable reason code recorded on the session.
    pub fn code(&self) -> String {
        match self {
            Self::NoAnswer => "no_answer".to_string(),
            Self::Busy => "busy".to_string(),
            Self::ChannelFailed(code) => format!("channel_failed:{code}"),
            Self::Timeout => "timeout".to_string(),
            Self::HungUp => "hung_up".to_string(),
            Self::UnresolvedAnswer(question_id) => format!("unresolved_answer:{question_id}"),
            Self::DeliveryFailed(reason) => format!("delivery_failed:{reason}"),
            Self::Interrupted => "interrupted".to_string(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code())
    }
}

/// One contact's delivery sequence (across retries) of one survey revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: Uuid,
    pub survey_id: Uuid,
    /// Pinned survey revision; the flow always runs against this snapshot.
    pub survey_revision: u32,
    pub campaign_id: Option<Uuid>,
    pub contact: Contact,
    pub channel: ChannelKind,
    pub priority: Priority,
    pub status: SessionStatus,
    /// Dispatches so far, including the live one.
    pub attempt_count: u32,
    pub scheduled_time: DateTime<Utc>,
    pub current_question_id: Option<String>,
    /// Set once the flow has nowhere left to go.
    pub flow_complete: bool,
    pub answers: Vec<CapturedAnswer>,
    pub last_failure_reason: Option<String>,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallSession {
    /// A fresh `scheduled` session pinned to the survey's current revision.
    pub fn new(
        survey: &Survey,
        contact: Contact,
        channel: ChannelKind,
        scheduled_time: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            survey_id: survey.id,
            survey_revision: survey.revision,
            campaign_id: None,
            contact,
            channel,
            priority: Priority::Normal,
            status: SessionStatus::Scheduled,
            attempt_count: 0,
            scheduled_time,
            current_question_id: None,
            flow_complete: false,
            answers: Vec::new(),
            last_failure_reason: None,
            notes: None,
            started_at: None,
            ended_at: None,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, recording the transition.
    pub fn transition_to(
        &mut self,
        to: SessionStatus,
        reason: Option<String>,
    ) -> Result<(), SessionError> {
        if !self.status.can_transition_to(to) {
            return Err(SessionError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        push_transition(
            &mut self.transitions,
            StateTransition {
                from: self.status,
                to,
                timestamp: now,
                reason,
            },
        );
        self.status = to;
        self.updated_at = now;

        match to {
            SessionStatus::InProgress if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled => {
                self.ended_at = Some(now);
            }
            _ => {}
        }

        Ok(())
    }

    /// Most recent accepted answer for a question.
    pub fn answer_for(&self, question_id: &str) -> Option<&CapturedAnswer> {
        self.answers.iter().rev().find(|a| a.question_id == question_id)
    }

    pub fn record_answer(&mut self, question_id: impl Into<String>, value: impl Into<String>) {
        let now = Utc::now();
        self.answers.push(CapturedAnswer {
            question_id: question_id.into(),
            value: value.into(),
            captured_at: now,
        });
        self.updated_at = now;
    }

    /// Whether another dispatch is allowed under `max_attempts`.
    pub fn has_attempts_left(&self, max_attempts: u32) -> bool {
        self.attempt_count < max_attempts
    }

    /// A session on its first attempt that has not yet reached any question.
    pub fn is_fresh_start(&self) -> bool {
        self.attempt_count <= 1 && self.current_question_id.is_none() && self.answers.is_empty()
    }

    /// Seconds between first dispatch and the terminal transition.
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start).num_seconds().max(0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::model::SurveyDraft;

    fn session() -> CallSession {
        let survey = Survey::from_draft(SurveyDraft::new("t").active());
        CallSession::new(&survey, Contact::new("+15550100"), ChannelKind::Voice, Utc::now())
    }

    #[test]
    fn timezone_formats() {
        let cases = [
            ("UTC-5", -5 * 3600),
            ("-05:00", -5 * 3600),
            ("+0530", 5 * 3600 + 30 * 60),
            ("UTC+05:30", 5 * 3600 + 30 * 60),
            ("UTC", 0),
            ("Z", 0),
        ];
        for (raw, secs) in cases {
            let tz: ContactTimezone = raw.parse().unwrap();
            assert_eq!(tz.offset().local_minus_utc(), secs, "{raw}");
        }
        assert!("UTC+99".parse::<ContactTimezone>().is_err());
        assert!("America/New_York".parse::<ContactTimezone>().is_err());
    }

    #[test]
    fn timezone_serializes_as_offset_string() {
        let contact = Contact::new("+1").with_timezone("UTC-5".parse().unwrap());
        let json = serde_json::to_value(&contact).unwrap();
        assert_eq!(json["timezone"], "-05:00");
        let back: Contact = serde_json::from_value(json).unwrap();
        assert_eq!(back, contact);
    }

    #[test]
    fn channel_kind_strings() {
        assert_eq!(serde_json::to_string(&ChannelKind::WhatsApp).unwrap(), "\"whatsapp\"");
        assert_eq!("sms".parse::<ChannelKind>().unwrap(), ChannelKind::Sms);
    }

    #[test]
    fn lifecycle_timestamps() {
        let mut s = session();
        s.transition_to(SessionStatus::InProgress, None).unwrap();
        assert!(s.started_at.is_some());
        assert!(s.ended_at.is_none());
        s.transition_to(SessionStatus::Completed, Some("flow complete".into()))
            .unwrap();
        assert!(s.ended_at.is_some());
        assert!(s.duration_seconds().is_some());
        assert_eq!(s.transitions.len(), 2);
    }

    #[test]
    fn invalid_transition_is_rejected_without_side_effects() {
        let mut s = session();
        let err = s.transition_to(SessionStatus::Completed, None).unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
        assert_eq!(s.status, SessionStatus::Scheduled);
        assert!(s.transitions.is_empty());
    }

    #[test]
    fn latest_answer_wins() {
        let mut s = session();
        s.record_answer("q1", "2");
        s.record_answer("q1", "4");
        assert_eq!(s.answer_for("q1").unwrap().value, "4");
        assert!(s.answer_for("q2").is_none());
    }

    #[test]
    fn failure_codes() {
        assert_eq!(FailureReason::ChannelFailed("carrier".into()).code(), "channel_failed:carrier");
        assert_eq!(FailureReason::UnresolvedAnswer("q2".into()).code(), "unresolved_answer:q2");
        assert_eq!(FailureReason::NoAnswer.to_string(), "no_answer");
    }
}
