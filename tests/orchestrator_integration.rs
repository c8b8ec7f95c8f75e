//! End-to-end orchestrator behaviour against the scripted channel.
//!
//! Each test builds an in-memory store, registers a `ScriptedChannel` for
//! every channel kind, and drives dispatch passes by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::timeout;

use callflow::channels::{
    ChannelAdapter, ChannelEvent, ChannelEventKind, ChannelManager, DeliveryHandle, EventSender,
    Prompt, PromptKind, ScriptStep, ScriptedChannel,
};
use callflow::error::ChannelError;
use callflow::config::{BackoffConfig, OrchestratorConfig};
use callflow::orchestrator::{DeferReason, Orchestrator, ScheduleRequest};
use callflow::session::{CallSession, ChannelKind, Contact, SessionStatus};
use callflow::store::{Database, LibSqlBackend};
use callflow::survey::{Question, QuestionType, SurveyDraft, SurveyRegistry};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    orchestrator: Orchestrator,
    channel: Arc<ScriptedChannel>,
}

async fn harness(channel: ScriptedChannel, config: OrchestratorConfig) -> Harness {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let surveys = Arc::new(SurveyRegistry::new(Arc::clone(&store)));
    let channel = Arc::new(channel);
    let mut channels = ChannelManager::new();
    channels.register_all(channel.clone());
    Harness {
        orchestrator: Orchestrator::new(config, store, surveys, channels),
        channel,
    }
}

/// Short answer timeout and no backoff, so retries are due immediately.
fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        answer_timeout: Duration::from_millis(100),
        backoff: BackoffConfig {
            initial: Duration::ZERO,
            max: Duration::ZERO,
            multiplier: 2,
        },
        ..OrchestratorConfig::default()
    }
}

fn three_questions() -> SurveyDraft {
    SurveyDraft::new("Delivery feedback")
        .question(Question::new("q1", "How was the delivery?", QuestionType::Numeric))
        .question(Question::new("q2", "Was the driver polite?", QuestionType::YesNo))
        .question(Question::new("q3", "Anything else?", QuestionType::OpenEnded))
        .anytime()
        .active()
}

async fn schedule(h: &Harness, draft: SurveyDraft, phone: &str) -> CallSession {
    let survey = h.orchestrator.surveys().create(draft).await.unwrap();
    h.orchestrator
        .schedule_session(ScheduleRequest::new(
            survey.id,
            Contact::new(phone),
            ChannelKind::Voice,
        ))
        .await
        .unwrap()
}

async fn dispatch_and_settle(h: &Harness) {
    h.orchestrator.run_dispatch_pass().await.unwrap();
    h.orchestrator.wait_idle().await;
}

/// Wait until the worker has put its first prompt on the channel.
async fn wait_for_delivery(h: &Harness, phone: &str) {
    while h.channel.questions_asked(phone).await.is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Retry accounting ────────────────────────────────────────────────

#[tokio::test]
async fn zero_retries_means_exactly_one_attempt() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        h.channel.script("+1", [ScriptStep::Busy]).await;
        let mut draft = three_questions();
        draft.max_retries = 0;
        let session = schedule(&h, draft, "+1").await;

        dispatch_and_settle(&h).await;
        // Further passes find nothing to do.
        let report = h.orchestrator.run_dispatch_pass().await.unwrap();
        assert!(report.is_empty());

        let failed = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.attempt_count, 1);
        assert_eq!(failed.last_failure_reason.as_deref(), Some("retry_exhausted:busy"));
        assert_eq!(h.channel.questions_asked("+1").await, vec!["q1"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn attempts_never_exceed_max_retries_plus_one() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedChannel::new(), fast_config()).await;
        h.channel
            .script(
                "+1",
                [
                    ScriptStep::NoAnswer,
                    ScriptStep::Fail("carrier_error".into()),
                    ScriptStep::Busy,
                    ScriptStep::NoAnswer,
                ],
            )
            .await;
        let mut draft = three_questions();
        draft.max_retries = 2;
        let session = schedule(&h, draft, "+1").await;

        for _ in 0..5 {
            dispatch_and_settle(&h).await;
        }

        let failed = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.attempt_count, 3);
        assert_eq!(failed.last_failure_reason.as_deref(), Some("retry_exhausted:busy"));
        assert_eq!(h.channel.questions_asked("+1").await.len(), 3);

        let err = h.orchestrator.retry_session_now(session.id).await.unwrap_err();
        assert!(err.to_string().contains("attempts"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retried_attempt_resumes_at_first_unanswered_question() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        h.channel
            .script(
                "+1",
                [
                    ScriptStep::Answer("4".into()),
                    ScriptStep::Answer("yes".into()),
                    ScriptStep::HangUp,
                ],
            )
            .await;
        let mut draft = three_questions();
        draft.intro_message = "Hi, this is a short survey from Acme.".into();
        draft.outro_message = "Thanks for your time.".into();
        let session = schedule(&h, draft, "+1").await;

        dispatch_and_settle(&h).await;
        let interrupted = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(interrupted.status, SessionStatus::Scheduled);
        assert_eq!(interrupted.last_failure_reason.as_deref(), Some("hung_up"));
        assert_eq!(interrupted.answers.len(), 2);
        assert_eq!(interrupted.current_question_id.as_deref(), Some("q3"));

        dispatch_and_settle(&h).await;
        let done = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.attempt_count, 2);
        let answered: Vec<&str> = done.answers.iter().map(|a| a.question_id.as_str()).collect();
        assert_eq!(answered, vec!["q1", "q2", "q3"]);

        // q1 and q2 are never asked again; the intro only opens the first attempt.
        assert_eq!(h.channel.questions_asked("+1").await, vec!["q1", "q2", "q3", "q3"]);
        assert_eq!(h.channel.prompts_of_kind("+1", PromptKind::Intro).await, 1);
        assert_eq!(h.channel.prompts_of_kind("+1", PromptKind::Outro).await, 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn max_duration_timeout_counts_as_failure_and_keeps_answers() {
    timeout(TEST_TIMEOUT, async {
        let config = OrchestratorConfig {
            answer_timeout: Duration::from_secs(30),
            ..fast_config()
        };
        let h = harness(ScriptedChannel::new(), config).await;
        h.channel.script("+1", [ScriptStep::Answer("5".into())]).await;
        let mut draft = three_questions();
        draft.max_duration = 1;
        draft.max_retries = 0;
        let session = schedule(&h, draft, "+1").await;

        dispatch_and_settle(&h).await;

        let failed = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(failed.last_failure_reason.as_deref(), Some("retry_exhausted:timeout"));
        assert_eq!(failed.answers.len(), 1);
        assert_eq!(failed.answers[0].value, "5");
        assert_eq!(h.channel.cancelled().await.len(), 1);
    })
    .await
    .expect("test timed out");
}

// ── Cancellation and pause ──────────────────────────────────────────

#[tokio::test]
async fn cancellation_is_idempotent() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        let pending = schedule(&h, three_questions(), "+1").await;

        let first = h.orchestrator.cancel_session(pending.id).await.unwrap();
        assert_eq!(first.status, SessionStatus::Cancelled);
        let stored = h.orchestrator.get_session(pending.id).await.unwrap();
        let second = h.orchestrator.cancel_session(pending.id).await.unwrap();
        assert_eq!(second, stored);
        assert_eq!(second.transitions.len(), 1);

        let completed = schedule(&h, three_questions(), "+2").await;
        dispatch_and_settle(&h).await;
        let done = h.orchestrator.get_session(completed.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);

        let after = h.orchestrator.cancel_session(completed.id).await.unwrap();
        assert_eq!(after, done);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancelling_a_live_attempt_stops_the_worker() {
    timeout(TEST_TIMEOUT, async {
        let config = OrchestratorConfig {
            answer_timeout: Duration::from_secs(30),
            ..fast_config()
        };
        let h = harness(ScriptedChannel::new(), config).await;
        let session = schedule(&h, three_questions(), "+1").await;

        h.orchestrator.run_dispatch_pass().await.unwrap();
        assert_eq!(h.orchestrator.live_count().await, 1);
        wait_for_delivery(&h, "+1").await;

        let cancelled = h.orchestrator.cancel_session(session.id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        h.orchestrator.wait_idle().await;

        let after = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(after.status, SessionStatus::Cancelled);
        assert_eq!(after.attempt_count, 1);
        assert!(after.ended_at.is_some());
        assert_eq!(h.channel.cancelled().await.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pausing_a_live_attempt_holds_its_retry() {
    timeout(TEST_TIMEOUT, async {
        let channel = ScriptedChannel::new().with_reply_delay(Duration::from_millis(200));
        let h = harness(channel, fast_config()).await;
        h.channel.script("+1", [ScriptStep::Busy]).await;
        let session = schedule(&h, three_questions(), "+1").await;

        h.orchestrator.run_dispatch_pass().await.unwrap();
        let paused = h.orchestrator.pause_session(session.id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        h.orchestrator.wait_idle().await;

        let held = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(held.status, SessionStatus::Paused);
        assert_eq!(held.last_failure_reason.as_deref(), Some("busy"));
        assert!(h.orchestrator.run_dispatch_pass().await.unwrap().is_empty());

        let resumed = h.orchestrator.resume_session(session.id).await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Scheduled);
        assert_eq!(resumed.attempt_count, 1);
    })
    .await
    .expect("test timed out");
}

// ── Admission control ───────────────────────────────────────────────

#[tokio::test]
async fn concurrency_bound_defers_newest_sessions() {
    timeout(TEST_TIMEOUT, async {
        let config = OrchestratorConfig {
            max_concurrent_calls: 2,
            ..fast_config()
        };
        let channel = ScriptedChannel::auto_answering().with_reply_delay(Duration::from_millis(50));
        let h = harness(channel, config).await;
        let survey = h.orchestrator.surveys().create(three_questions()).await.unwrap();

        let now = Utc::now();
        let mut ids = Vec::new();
        for (i, minutes_ago) in [3, 2, 1].into_iter().enumerate() {
            let request = ScheduleRequest::new(
                survey.id,
                Contact::new(format!("+{i}")),
                ChannelKind::Sms,
            )
            .at(now - chrono::Duration::minutes(minutes_ago));
            ids.push(h.orchestrator.schedule_session(request).await.unwrap().id);
        }

        let report = h.orchestrator.run_dispatch_pass().await.unwrap();
        assert_eq!(report.dispatched, vec![ids[0], ids[1]]);
        assert_eq!(report.deferred, vec![(ids[2], DeferReason::ConcurrencyLimit)]);
        assert_eq!(h.orchestrator.live_count().await, 2);

        let waiting = h.orchestrator.get_session(ids[2]).await.unwrap();
        assert_eq!(waiting.status, SessionStatus::Scheduled);
        assert_eq!(waiting.attempt_count, 0);

        h.orchestrator.wait_idle().await;
        dispatch_and_settle(&h).await;
        for id in ids {
            let session = h.orchestrator.get_session(id).await.unwrap();
            assert_eq!(session.status, SessionStatus::Completed);
        }
    })
    .await
    .expect("test timed out");
}

// ── Snapshot isolation and campaigns ────────────────────────────────

#[tokio::test]
async fn sessions_run_against_the_revision_they_were_scheduled_with() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        let survey = h
            .orchestrator
            .surveys()
            .create(
                SurveyDraft::new("Onboarding")
                    .question(Question::new("q1", "Easy to sign up?", QuestionType::YesNo))
                    .anytime()
                    .active(),
            )
            .await
            .unwrap();
        let before = h
            .orchestrator
            .schedule_session(ScheduleRequest::new(survey.id, Contact::new("+1"), ChannelKind::Voice))
            .await
            .unwrap();

        let edited = SurveyDraft::new("Onboarding v2")
            .question(Question::new("q1", "Easy to sign up?", QuestionType::YesNo))
            .question(Question::new("q2", "Rate the app", QuestionType::Numeric))
            .anytime()
            .active();
        let updated = h.orchestrator.surveys().update(survey.id, edited).await.unwrap();
        assert_eq!(updated.revision, 2);

        let after = h
            .orchestrator
            .schedule_session(ScheduleRequest::new(survey.id, Contact::new("+2"), ChannelKind::Voice))
            .await
            .unwrap();
        assert_eq!(before.survey_revision, 1);
        assert_eq!(after.survey_revision, 2);

        dispatch_and_settle(&h).await;
        assert_eq!(h.channel.questions_asked("+1").await, vec!["q1"]);
        assert_eq!(h.channel.questions_asked("+2").await, vec!["q1", "q2"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn campaign_stats_follow_session_states() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        let mut draft = three_questions();
        draft.max_retries = 0;
        let survey = h.orchestrator.surveys().create(draft).await.unwrap();
        let campaign = h
            .orchestrator
            .create_campaign("March follow-ups", survey.id)
            .await
            .unwrap();

        h.channel.script("+2", [ScriptStep::Fail("unreachable".into())]).await;
        let mut ids = Vec::new();
        for phone in ["+1", "+2", "+3"] {
            let request = ScheduleRequest::new(survey.id, Contact::new(phone), ChannelKind::Voice)
                .in_campaign(campaign.id);
            ids.push(h.orchestrator.schedule_session(request).await.unwrap().id);
        }
        h.orchestrator.cancel_session(ids[2]).await.unwrap();
        dispatch_and_settle(&h).await;

        let (found, stats) = h.orchestrator.campaign_status(campaign.id).await.unwrap();
        assert_eq!(found.id, campaign.id);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert!((stats.completion_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!(stats.average_duration_seconds.is_some());

        let failed = h.orchestrator.get_session(ids[1]).await.unwrap();
        assert_eq!(
            failed.last_failure_reason.as_deref(),
            Some("retry_exhausted:channel_failed:unreachable")
        );
    })
    .await
    .expect("test timed out");
}

// ── Channel event ordering ──────────────────────────────────────────

/// Answers every question "yes", but first reports a late hang-up for the
/// previous question's delivery.
#[derive(Default)]
struct LateHangupChannel {
    counter: AtomicU64,
    previous: Mutex<Option<String>>,
}

#[async_trait]
impl ChannelAdapter for LateHangupChannel {
    fn name(&self) -> &str {
        "late-hangup"
    }

    async fn deliver(
        &self,
        _contact: &Contact,
        prompt: &Prompt,
        events: EventSender,
    ) -> Result<DeliveryHandle, ChannelError> {
        let delivery_id = format!("lh-{}", self.counter.fetch_add(1, Ordering::Relaxed));
        if prompt.expects_answer() {
            let stale = self.previous.lock().await.replace(delivery_id.clone());
            let current = delivery_id.clone();
            tokio::spawn(async move {
                if let Some(stale) = stale {
                    let _ = events
                        .send(ChannelEvent::new(stale, ChannelEventKind::Completed))
                        .await;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = events
                    .send(ChannelEvent::new(
                        current,
                        ChannelEventKind::AnswerCaptured("yes".into()),
                    ))
                    .await;
            });
        }
        Ok(DeliveryHandle {
            delivery_id,
            adapter: self.name().to_string(),
        })
    }

    async fn cancel(&self, _handle: &DeliveryHandle) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[tokio::test]
async fn late_terminal_event_for_answered_prompt_is_ignored() {
    timeout(TEST_TIMEOUT, async {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let surveys = Arc::new(SurveyRegistry::new(Arc::clone(&store)));
        let mut channels = ChannelManager::new();
        channels.register_all(Arc::new(LateHangupChannel::default()));
        let config = OrchestratorConfig {
            answer_timeout: Duration::from_secs(1),
            ..fast_config()
        };
        let orchestrator = Orchestrator::new(config, store, surveys, channels);

        let mut draft = SurveyDraft::new("Return visit")
            .question(Question::new("q1", "Did it arrive on time?", QuestionType::YesNo))
            .question(Question::new("q2", "Would you order again?", QuestionType::YesNo))
            .anytime()
            .active();
        draft.max_retries = 0;
        let survey = orchestrator.surveys().create(draft).await.unwrap();
        let session = orchestrator
            .schedule_session(ScheduleRequest::new(
                survey.id,
                Contact::new("+1"),
                ChannelKind::Voice,
            ))
            .await
            .unwrap();

        orchestrator.run_dispatch_pass().await.unwrap();
        orchestrator.wait_idle().await;

        let done = orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.attempt_count, 1);
        assert!(done.last_failure_reason.is_none());
        let answered: Vec<&str> = done.answers.iter().map(|a| a.question_id.as_str()).collect();
        assert_eq!(answered, vec!["q1", "q2"]);
    })
    .await
    .expect("test timed out");
}
