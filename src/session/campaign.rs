//! Campaigns — reporting groups of sessions sharing a survey.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::model::CallSession;
use crate::session::state::SessionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub survey_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: impl Into<String>, survey_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            survey_id,
            created_at: Utc::now(),
        }
    }
}

/// Session counts and timing for one campaign.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub total: usize,
    pub scheduled: usize,
    pub in_progress: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// completed / (completed + failed + cancelled), 0 when nothing has ended.
    pub completion_rate: f64,
    pub average_duration_seconds: Option<f64>,
    pub total_duration_seconds: i64,
}

impl CampaignStats {
    pub fn from_sessions<'a>(sessions: impl IntoIterator<Item = &'a CallSession>) -> Self {
        let mut stats = Self::default();
        let mut timed = 0usize;

        for session in sessions {
            stats.total += 1;
            match session.status {
                SessionStatus::Scheduled => stats.scheduled += 1,
                SessionStatus::InProgress => stats.in_progress += 1,
                SessionStatus::Paused => stats.paused += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Cancelled => stats.cancelled += 1,
            }
            if session.status == SessionStatus::Completed {
                if let Some(secs) = session.duration_seconds() {
                    stats.total_duration_seconds += secs;
                    timed += 1;
                }
            }
        }

        let ended = stats.completed + stats.failed + stats.cancelled;
        if ended > 0 {
            stats.completion_rate = stats.completed as f64 / ended as f64;
        }
        if timed > 0 {
            stats.average_duration_seconds = Some(stats.total_duration_seconds as f64 / timed as f64);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::{ChannelKind, Contact};
    use crate::survey::model::{Survey, SurveyDraft};
    use chrono::Duration;

    fn session_with(survey: &Survey, status: SessionStatus, secs: Option<i64>) -> CallSession {
        let mut s = CallSession::new(survey, Contact::new("+1"), ChannelKind::Voice, Utc::now());
        s.status = status;
        if let Some(secs) = secs {
            let start = Utc::now();
            s.started_at = Some(start);
            s.ended_at = Some(start + Duration::seconds(secs));
        }
        s
    }

    #[test]
    fn stats_count_and_rate() {
        let survey = Survey::from_draft(SurveyDraft::new("s").active());
        let sessions = vec![
            session_with(&survey, SessionStatus::Completed, Some(60)),
            session_with(&survey, SessionStatus::Completed, Some(120)),
            session_with(&survey, SessionStatus::Failed, Some(10)),
            session_with(&survey, SessionStatus::Cancelled, None),
            session_with(&survey, SessionStatus::Scheduled, None),
        ];
        let stats = CampaignStats::from_sessions(&sessions);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.scheduled, 1);
        assert!((stats.completion_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.total_duration_seconds, 180);
        assert_eq!(stats.average_duration_seconds, Some(90.0));
    }

    #[test]
    fn empty_campaign() {
        let none: Vec<CallSession> = Vec::new();
        let stats = CampaignStats::from_sessions(&none);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.completion_rate, 0.0);
        assert!(stats.average_duration_seconds.is_none());
    }
}
