//! Orchestrator — admission control, dispatch, retry accounting, and the
//! control operations.
//!
//! The orchestrator is the only writer of `CallSession` state. Every mutation
//! runs under that session's lock, so a worker and an operator can never
//! advance the same session at once. Dispatch passes are serialized and never
//! wait on channel I/O; workers own the channel side of each live attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::ChannelManager;
use crate::config::OrchestratorConfig;
use crate::error::{Result, SessionError};
use crate::orchestrator::backoff::BackoffPolicy;
use crate::orchestrator::policy::{SchedulingPolicy, WindowCheck};
use crate::orchestrator::worker::{self, Attempt};
use crate::session::campaign::{Campaign, CampaignStats};
use crate::session::model::{CallSession, ChannelKind, Contact, FailureReason, Priority};
use crate::session::state::SessionStatus;
use crate::store::Database;
use crate::survey::flow::{FlowEvaluator, FlowStep};
use crate::survey::registry::SurveyRegistry;

/// Input for scheduling a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub survey_id: Uuid,
    pub contact: Contact,
    #[serde(default)]
    pub channel: ChannelKind,
    /// Defaults to now.
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub campaign_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ScheduleRequest {
    pub fn new(survey_id: Uuid, contact: Contact, channel: ChannelKind) -> Self {
        Self {
            survey_id,
            contact,
            channel,
            scheduled_time: None,
            campaign_id: None,
            priority: Priority::Normal,
            notes: None,
        }
    }

    pub fn at(mut self, scheduled_time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(scheduled_time);
        self
    }

    pub fn in_campaign(mut self, campaign_id: Uuid) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }
}

/// Why a due session stayed `scheduled` this pass. Not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeferReason {
    OutsideWindow { next_open: DateTime<Utc> },
    ConcurrencyLimit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub dispatched: Vec<Uuid>,
    pub deferred: Vec<(Uuid, DeferReason)>,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.deferred.is_empty()
    }
}

/// How a live attempt ended, as reported by its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Completed,
    Failure(FailureReason),
    /// The worker observed a cancellation.
    Cancelled,
}

enum Decision {
    Started,
    Deferred(DeferReason),
}

struct Inner {
    config: OrchestratorConfig,
    store: Arc<dyn Database>,
    surveys: Arc<SurveyRegistry>,
    channels: ChannelManager,
    policy: SchedulingPolicy,
    backoff: BackoffPolicy,
    /// Cancellation signal per live attempt. Its size is the admission count.
    live: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    dispatch_lock: Mutex<()>,
    /// Fires whenever a live attempt ends.
    idle: Notify,
    /// Asks the dispatch ticker for an early pass.
    kick: Notify,
}

/// Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Database>,
        surveys: Arc<SurveyRegistry>,
        channels: ChannelManager,
    ) -> Self {
        let policy = SchedulingPolicy::from_config(&config);
        let backoff = BackoffPolicy::new(config.backoff);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                surveys,
                channels,
                policy,
                backoff,
                live: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                dispatch_lock: Mutex::new(()),
                idle: Notify::new(),
                kick: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn surveys(&self) -> &Arc<SurveyRegistry> {
        &self.inner.surveys
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.inner.channels
    }

    // ── Control operations ──────────────────────────────────────────

    /// Create a `scheduled` session pinned to the survey's current revision.
    pub async fn schedule_session(&self, request: ScheduleRequest) -> Result<CallSession> {
        let survey = self
            .inner
            .surveys
            .get(request.survey_id)
            .await?
            .ok_or(SessionError::SurveyNotFound {
                id: request.survey_id,
            })?;

        if !survey.status.is_dispatchable() {
            return Err(SessionError::SurveyNotDispatchable {
                survey_id: survey.id,
                status: survey.status.to_string(),
            }
            .into());
        }

        let graph = self.inner.surveys.snapshot(survey.id, survey.revision).await?;
        graph.first_question()?;
        self.inner.channels.get(request.channel)?;

        if let Some(campaign_id) = request.campaign_id {
            let campaign = self
                .inner
                .store
                .get_campaign(campaign_id)
                .await?
                .ok_or(SessionError::CampaignNotFound { id: campaign_id })?;
            if campaign.survey_id != survey.id {
                return Err(SessionError::CampaignSurveyMismatch {
                    campaign_id,
                    expected: campaign.survey_id,
                    got: survey.id,
                }
                .into());
            }
        }

        let scheduled_time = request.scheduled_time.unwrap_or_else(Utc::now);
        let mut session = CallSession::new(&survey, request.contact, request.channel, scheduled_time);
        session.campaign_id = request.campaign_id;
        session.priority = request.priority;
        session.notes = request.notes;

        self.inner.store.insert_session(&session).await?;
        info!(
            session_id = %session.id,
            survey_id = %survey.id,
            revision = survey.revision,
            channel = %session.channel,
            scheduled_time = %scheduled_time,
            "Session scheduled"
        );
        self.inner.kick.notify_one();
        Ok(session)
    }

    /// Cancel a session. Terminal sessions are returned unchanged.
    pub async fn cancel_session(&self, id: Uuid) -> Result<CallSession> {
        let _guard = self.lock_session(id).await;
        let mut session = self.load(id).await?;
        if session.status.is_terminal() {
            debug!(session_id = %id, status = %session.status, "Cancel ignored, already terminal");
            return Ok(session);
        }

        session.transition_to(SessionStatus::Cancelled, Some("cancelled by operator".into()))?;
        self.inner.store.save_session(&session).await?;

        if let Some(cancel) = self.inner.live.lock().await.get(&id) {
            let _ = cancel.send(true);
        }
        self.forget_lock(id).await;

        info!(session_id = %id, "Session cancelled");
        Ok(session)
    }

    /// Hold a session. A live attempt keeps running; nothing is retried
    /// until `resume_session`.
    pub async fn pause_session(&self, id: Uuid) -> Result<CallSession> {
        let _guard = self.lock_session(id).await;
        let mut session = self.load(id).await?;
        if session.status == SessionStatus::Paused {
            return Ok(session);
        }

        session.transition_to(SessionStatus::Paused, Some("paused by operator".into()))?;
        self.inner.store.save_session(&session).await?;
        info!(session_id = %id, "Session paused");
        Ok(session)
    }

    /// Release a paused session: back to `in_progress` while its attempt is
    /// still live, otherwise back to `scheduled`.
    pub async fn resume_session(&self, id: Uuid) -> Result<CallSession> {
        let _guard = self.lock_session(id).await;
        let mut session = self.load(id).await?;
        if session.status != SessionStatus::Paused {
            return Err(SessionError::InvalidTransition {
                id,
                from: session.status.to_string(),
                to: "resumed".to_string(),
            }
            .into());
        }

        let live = self.inner.live.lock().await.contains_key(&id);
        if live {
            session.transition_to(SessionStatus::InProgress, Some("resumed".into()))?;
        } else {
            session.scheduled_time = session.scheduled_time.max(Utc::now());
            session.transition_to(SessionStatus::Scheduled, Some("resumed".into()))?;
            self.inner.kick.notify_one();
        }
        self.inner.store.save_session(&session).await?;

        info!(session_id = %id, status = %session.status, "Session resumed");
        Ok(session)
    }

    /// Make a scheduled session due now, skipping its backoff. The attempt
    /// still counts against `max_retries`.
    pub async fn retry_session_now(&self, id: Uuid) -> Result<CallSession> {
        let _guard = self.lock_session(id).await;
        let mut session = self.load(id).await?;
        match session.status {
            SessionStatus::Scheduled => {}
            SessionStatus::Failed => {
                return Err(SessionError::RetryExhausted {
                    id,
                    attempts: session.attempt_count,
                }
                .into());
            }
            other => {
                return Err(SessionError::InvalidTransition {
                    id,
                    from: other.to_string(),
                    to: SessionStatus::Scheduled.to_string(),
                }
                .into());
            }
        }

        let graph = self
            .inner
            .surveys
            .snapshot(session.survey_id, session.survey_revision)
            .await?;
        let max_attempts = graph.survey().max_attempts();
        if !session.has_attempts_left(max_attempts) {
            return Err(SessionError::RetryExhausted {
                id,
                attempts: session.attempt_count,
            }
            .into());
        }

        let now = Utc::now();
        session.scheduled_time = now;
        session.updated_at = now;
        self.inner.store.save_session(&session).await?;
        self.inner.kick.notify_one();

        info!(session_id = %id, attempt = session.attempt_count + 1, "Immediate retry requested");
        Ok(session)
    }

    pub async fn get_session(&self, id: Uuid) -> Result<CallSession> {
        self.load(id).await
    }

    /// Sessions in one status, or the most recent ones.
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<CallSession>> {
        let sessions = match status {
            Some(status) => {
                let mut sessions = self.inner.store.list_sessions_by_status(status).await?;
                sessions.truncate(limit);
                sessions
            }
            None => self.inner.store.list_recent_sessions(limit).await?,
        };
        Ok(sessions)
    }

    pub async fn create_campaign(&self, name: &str, survey_id: Uuid) -> Result<Campaign> {
        if self.inner.surveys.get(survey_id).await?.is_none() {
            return Err(SessionError::SurveyNotFound { id: survey_id }.into());
        }
        let campaign = Campaign::new(name, survey_id);
        self.inner.store.insert_campaign(&campaign).await?;
        info!(campaign_id = %campaign.id, survey_id = %survey_id, name, "Campaign created");
        Ok(campaign)
    }

    pub async fn list_campaigns(&self) -> Result<Vec<Campaign>> {
        Ok(self.inner.store.list_campaigns().await?)
    }

    pub async fn campaign_status(&self, id: Uuid) -> Result<(Campaign, CampaignStats)> {
        let campaign = self
            .inner
            .store
            .get_campaign(id)
            .await?
            .ok_or(SessionError::CampaignNotFound { id })?;
        let sessions = self.inner.store.list_sessions_by_campaign(id).await?;
        Ok((campaign, CampaignStats::from_sessions(&sessions)))
    }

    // ── Dispatch ────────────────────────────────────────────────────

    pub async fn run_dispatch_pass(&self) -> Result<DispatchReport> {
        self.run_dispatch_pass_at(Utc::now()).await
    }

    /// Consider every due session, oldest first, and start as many attempts
    /// as the window policy and the concurrency bound allow.
    pub async fn run_dispatch_pass_at(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let _pass = self.inner.dispatch_lock.lock().await;
        let due = self
            .inner
            .store
            .list_due_sessions(now, self.inner.config.dispatch_batch)
            .await?;

        let mut report = DispatchReport::default();
        for candidate in due {
            match self.try_dispatch(candidate.id, now).await {
                Ok(Some(Decision::Started)) => report.dispatched.push(candidate.id),
                Ok(Some(Decision::Deferred(reason))) => report.deferred.push((candidate.id, reason)),
                Ok(None) => {}
                Err(e) => {
                    error!(session_id = %candidate.id, error = %e, "Dispatch failed");
                }
            }
        }

        if !report.is_empty() {
            debug!(
                dispatched = report.dispatched.len(),
                deferred = report.deferred.len(),
                "Dispatch pass finished"
            );
        }
        Ok(report)
    }

    async fn try_dispatch(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Decision>> {
        let _guard = self.lock_session(id).await;
        let mut session = self.load(id).await?;
        if session.status != SessionStatus::Scheduled || session.scheduled_time > now {
            return Ok(None);
        }

        let graph = self
            .inner
            .surveys
            .snapshot(session.survey_id, session.survey_revision)
            .await?;
        let survey = graph.survey();

        let window = self
            .inner
            .policy
            .check(&survey.scheduling, session.contact.timezone, now);
        if let WindowCheck::Closed { next_open } = window {
            if self.inner.policy.within_horizon(now, next_open) {
                session.scheduled_time = next_open;
                session.updated_at = now;
                self.inner.store.save_session(&session).await?;
            }
            debug!(session_id = %id, next_open = %next_open, "Outside scheduling window, deferred");
            return Ok(Some(Decision::Deferred(DeferReason::OutsideWindow {
                next_open,
            })));
        }

        if !session.has_attempts_left(survey.max_attempts()) {
            warn!(session_id = %id, attempts = session.attempt_count, "Scheduled session has no attempts left");
            return Ok(None);
        }

        let mut live = self.inner.live.lock().await;
        if live.len() >= self.inner.config.max_concurrent_calls {
            debug!(session_id = %id, live = live.len(), "Concurrency limit reached, deferred");
            return Ok(Some(Decision::Deferred(DeferReason::ConcurrencyLimit)));
        }

        let fresh_start = session.is_fresh_start();
        let step = FlowEvaluator::new(graph.clone()).start(&mut session)?;
        session.attempt_count += 1;
        let attempt = session.attempt_count;
        session.transition_to(SessionStatus::InProgress, Some(format!("attempt {attempt}")))?;
        self.inner.store.save_session(&session).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        live.insert(id, cancel_tx);
        drop(live);

        info!(
            session_id = %id,
            attempt,
            channel = %session.channel,
            question = session.current_question_id.as_deref().unwrap_or("-"),
            "Session dispatched"
        );

        tokio::spawn(worker::run(
            self.clone(),
            Attempt {
                session_id: id,
                attempt,
                contact: session.contact,
                channel: session.channel,
                graph,
                step,
                fresh_start,
                cancel: cancel_rx,
            },
        ));
        Ok(Some(Decision::Started))
    }

    // ── Worker callbacks ────────────────────────────────────────────

    /// Record an answer (or its absence) for the session's current question
    /// and advance the flow.
    ///
    /// Invalid or missing required answers come back as `FlowError`s with
    /// nothing recorded, so the caller can re-prompt.
    pub async fn capture_answer(
        &self,
        id: Uuid,
        question_id: &str,
        raw: Option<&str>,
    ) -> Result<FlowStep> {
        let _guard = self.lock_session(id).await;
        let mut session = self.load(id).await?;
        if !matches!(
            session.status,
            SessionStatus::InProgress | SessionStatus::Paused
        ) {
            return Err(SessionError::NotAcceptingAnswers {
                id,
                status: session.status.to_string(),
            }
            .into());
        }

        let expected = session.current_question_id.clone().unwrap_or_default();
        if expected != question_id {
            return Err(SessionError::StaleAnswer {
                id,
                expected,
                got: question_id.to_string(),
            }
            .into());
        }

        let graph = self
            .inner
            .surveys
            .snapshot(session.survey_id, session.survey_revision)
            .await?;
        let step = FlowEvaluator::new(graph).submit(&mut session, raw)?;
        self.inner.store.save_session(&session).await?;

        debug!(session_id = %id, question = question_id, next = ?step, "Answer captured");
        Ok(step)
    }

    /// Settle a finished attempt: complete, schedule a retry, or fail.
    pub async fn finish_attempt(&self, id: Uuid, outcome: AttemptOutcome) -> Result<CallSession> {
        let _guard = self.lock_session(id).await;
        let result = self.settle(id, outcome).await;
        // Release the slot only once the outcome is stored.
        let was_live = self.inner.live.lock().await.remove(&id).is_some();
        if was_live {
            self.inner.idle.notify_waiters();
            self.inner.kick.notify_one();
        }
        result
    }

    async fn settle(&self, id: Uuid, outcome: AttemptOutcome) -> Result<CallSession> {
        let mut session = self.load(id).await?;
        if session.status.is_terminal() || session.status == SessionStatus::Scheduled {
            debug!(session_id = %id, status = %session.status, ?outcome, "Attempt outcome ignored");
            return Ok(session);
        }

        match outcome {
            AttemptOutcome::Cancelled => return Ok(session),
            AttemptOutcome::Completed => {
                session.transition_to(SessionStatus::Completed, Some("flow complete".into()))?;
                info!(
                    session_id = %id,
                    answers = session.answers.len(),
                    attempts = session.attempt_count,
                    "Session completed"
                );
            }
            AttemptOutcome::Failure(reason) => {
                let graph = self
                    .inner
                    .surveys
                    .snapshot(session.survey_id, session.survey_revision)
                    .await?;
                let code = reason.code();
                let now = Utc::now();

                if !session.has_attempts_left(graph.survey().max_attempts()) {
                    let final_reason = format!("retry_exhausted:{code}");
                    session.last_failure_reason = Some(final_reason.clone());
                    session.transition_to(SessionStatus::Failed, Some(final_reason))?;
                    error!(
                        session_id = %id,
                        attempts = session.attempt_count,
                        reason = %code,
                        "Session failed, attempts exhausted"
                    );
                } else {
                    session.last_failure_reason = Some(code.clone());
                    session.scheduled_time =
                        self.inner.backoff.next_retry(session.attempt_count, now);
                    if session.status == SessionStatus::Paused {
                        session.updated_at = now;
                        warn!(session_id = %id, reason = %code, "Attempt failed while paused, retry held");
                    } else {
                        session.transition_to(SessionStatus::Scheduled, Some(code.clone()))?;
                        warn!(
                            session_id = %id,
                            attempt = session.attempt_count,
                            reason = %code,
                            retry_at = %session.scheduled_time,
                            "Attempt failed, retry scheduled"
                        );
                    }
                }
            }
        }

        self.inner.store.save_session(&session).await?;
        if session.status.is_terminal() {
            self.forget_lock(id).await;
        }
        Ok(session)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Settle sessions left `in_progress` by a previous process. No worker
    /// survives a restart, so each counts as an interrupted attempt.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let stuck = self
            .inner
            .store
            .list_sessions_by_status(SessionStatus::InProgress)
            .await?;
        if stuck.is_empty() {
            return Ok(0);
        }

        info!(count = stuck.len(), "Recovering sessions interrupted by restart");
        let mut recovered = 0;
        for session in stuck {
            if self.inner.live.lock().await.contains_key(&session.id) {
                continue;
            }
            let outcome = AttemptOutcome::Failure(FailureReason::Interrupted);
            match self.finish_attempt(session.id, outcome).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(session_id = %session.id, error = %e, "Failed to recover session"),
            }
        }
        Ok(recovered)
    }

    /// Number of attempts currently holding a concurrency slot.
    pub async fn live_count(&self) -> usize {
        self.inner.live.lock().await.len()
    }

    /// Wait until no attempt is live.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.live.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    async fn load(&self, id: Uuid) -> Result<CallSession> {
        self.inner
            .store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::NotFound { id }.into())
    }

    async fn lock_session(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self.inner.locks.lock().await.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop a terminal session's lock entry. Late callers get a fresh lock,
    /// which is harmless because terminal sessions are never written again.
    async fn forget_lock(&self, id: Uuid) {
        self.inner.locks.lock().await.remove(&id);
    }
}

/// Spawn the dispatch loop: a pass on every tick, plus an early pass
/// whenever a session is scheduled, retried, resumed, or frees a slot.
pub fn spawn_dispatch_ticker(orchestrator: Orchestrator, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Dispatch ticker started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = orchestrator.inner.kick.notified() => {}
            }
            if let Err(e) = orchestrator.run_dispatch_pass().await {
                error!(error = %e, "Dispatch pass failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ScriptStep, ScriptedChannel};
    use crate::error::Error;
    use crate::session::model::ContactTimezone;
    use crate::store::LibSqlBackend;
    use crate::survey::model::{Question, QuestionType, SurveyDraft};

    struct Harness {
        orchestrator: Orchestrator,
        channel: Arc<ScriptedChannel>,
    }

    async fn harness(channel: ScriptedChannel, config: OrchestratorConfig) -> Harness {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let surveys = Arc::new(SurveyRegistry::new(store.clone()));
        let channel = Arc::new(channel);
        let mut channels = ChannelManager::new();
        channels.register_all(channel.clone());
        Harness {
            orchestrator: Orchestrator::new(config, store, surveys, channels),
            channel,
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            answer_timeout: Duration::from_millis(50),
            backoff: crate::config::BackoffConfig {
                initial: Duration::ZERO,
                max: Duration::ZERO,
                multiplier: 2,
            },
            ..OrchestratorConfig::default()
        }
    }

    fn two_questions() -> SurveyDraft {
        SurveyDraft::new("Quick check")
            .question(Question::new("q1", "Rate us", QuestionType::Numeric))
            .question(Question::new("q2", "Recommend us?", QuestionType::YesNo))
            .anytime()
            .active()
    }

    async fn scheduled(h: &Harness, draft: SurveyDraft, phone: &str) -> CallSession {
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

    #[tokio::test]
    async fn draft_survey_cannot_be_scheduled() {
        let h = harness(ScriptedChannel::new(), fast_config()).await;
        let survey = h
            .orchestrator
            .surveys()
            .create(SurveyDraft::new("draft").question(Question::new(
                "q1",
                "?",
                QuestionType::OpenEnded,
            )))
            .await
            .unwrap();
        let err = h
            .orchestrator
            .schedule_session(ScheduleRequest::new(
                survey.id,
                Contact::new("+1"),
                ChannelKind::Sms,
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::SurveyNotDispatchable { .. })
        ));
    }

    #[tokio::test]
    async fn completes_with_auto_answers() {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        let session = scheduled(&h, two_questions(), "+1").await;

        let report = h.orchestrator.run_dispatch_pass().await.unwrap();
        assert_eq!(report.dispatched, vec![session.id]);
        h.orchestrator.wait_idle().await;

        let done = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.attempt_count, 1);
        assert_eq!(done.answers.len(), 2);
        assert!(done.flow_complete);
        assert_eq!(h.channel.questions_asked("+1").await, vec!["q1", "q2"]);
    }

    #[tokio::test]
    async fn invalid_answer_is_reprompted_then_accepted() {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        h.channel
            .script("+1", [ScriptStep::Answer("purple".into())])
            .await;
        let session = scheduled(&h, two_questions(), "+1").await;

        h.orchestrator.run_dispatch_pass().await.unwrap();
        h.orchestrator.wait_idle().await;

        let done = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(h.channel.questions_asked("+1").await, vec!["q1", "q1", "q2"]);
        assert_eq!(
            h.channel
                .prompts_of_kind("+1", crate::channels::PromptKind::Reprompt)
                .await,
            1
        );
        assert!(done.answers.iter().all(|a| a.value != "purple"));
    }

    #[tokio::test]
    async fn unresolved_answer_fails_the_attempt() {
        let config = OrchestratorConfig {
            max_reprompts: 1,
            ..fast_config()
        };
        let h = harness(ScriptedChannel::new(), config).await;
        let session = scheduled(&h, two_questions(), "+1").await;
        let mut draft_zero = two_questions();
        draft_zero.max_retries = 0;
        let zero = scheduled(&h, draft_zero, "+2").await;

        h.orchestrator.run_dispatch_pass().await.unwrap();
        h.orchestrator.wait_idle().await;

        // Silence on a required question: one re-prompt, then the attempt fails.
        let retried = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(retried.status, SessionStatus::Scheduled);
        assert_eq!(retried.last_failure_reason.as_deref(), Some("unresolved_answer:q1"));
        assert_eq!(h.channel.questions_asked("+1").await, vec!["q1", "q1"]);

        let failed = h.orchestrator.get_session(zero.id).await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert_eq!(
            failed.last_failure_reason.as_deref(),
            Some("retry_exhausted:unresolved_answer:q1")
        );
    }

    #[tokio::test]
    async fn closed_window_defers_without_error() {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        let survey = h
            .orchestrator
            .surveys()
            .create(
                SurveyDraft::new("Business hours")
                    .question(Question::new("q1", "Rate us", QuestionType::Numeric))
                    .active(),
            )
            .await
            .unwrap();
        let tz: ContactTimezone = "UTC-5".parse().unwrap();
        // 22:00 local on Tuesday 2024-03-05.
        let now = DateTime::parse_from_rfc3339("2024-03-06T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let session = h
            .orchestrator
            .schedule_session(
                ScheduleRequest::new(survey.id, Contact::new("+1").with_timezone(tz), ChannelKind::Voice)
                    .at(now),
            )
            .await
            .unwrap();

        let report = h.orchestrator.run_dispatch_pass_at(now).await.unwrap();
        assert!(report.dispatched.is_empty());
        let next_open = DateTime::parse_from_rfc3339("2024-03-06T14:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            report.deferred,
            vec![(session.id, DeferReason::OutsideWindow { next_open })]
        );

        let after = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(after.status, SessionStatus::Scheduled);
        assert_eq!(after.attempt_count, 0);
        assert_eq!(after.scheduled_time, next_open);
        assert!(h.channel.deliveries().await.is_empty());
    }

    #[tokio::test]
    async fn pause_holds_a_scheduled_session() {
        let h = harness(ScriptedChannel::auto_answering(), fast_config()).await;
        let session = scheduled(&h, two_questions(), "+1").await;

        let paused = h.orchestrator.pause_session(session.id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        let report = h.orchestrator.run_dispatch_pass().await.unwrap();
        assert!(report.is_empty());

        let resumed = h.orchestrator.resume_session(session.id).await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Scheduled);
        let report = h.orchestrator.run_dispatch_pass().await.unwrap();
        assert_eq!(report.dispatched.len(), 1);
        h.orchestrator.wait_idle().await;
        assert_eq!(
            h.orchestrator.get_session(session.id).await.unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn retry_now_rules() {
        let h = harness(ScriptedChannel::new(), fast_config()).await;
        let session = scheduled(&h, two_questions(), "+1").await;

        let retried = h.orchestrator.retry_session_now(session.id).await.unwrap();
        assert!(retried.scheduled_time <= Utc::now());

        h.orchestrator.cancel_session(session.id).await.unwrap();
        let err = h.orchestrator.retry_session_now(session.id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn stale_answers_are_rejected() {
        let h = harness(ScriptedChannel::new(), fast_config()).await;
        let session = scheduled(&h, two_questions(), "+1").await;
        let err = h
            .orchestrator
            .capture_answer(session.id, "q1", Some("4"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError::NotAcceptingAnswers { .. })
        ));
    }

    #[tokio::test]
    async fn recovery_counts_an_interrupted_attempt() {
        let h = harness(ScriptedChannel::new(), fast_config()).await;
        let mut session = scheduled(&h, two_questions(), "+1").await;

        // Simulate a crash mid-attempt: in_progress on disk, no live worker.
        session.attempt_count = 1;
        session.current_question_id = Some("q1".into());
        session
            .transition_to(SessionStatus::InProgress, None)
            .unwrap();
        h.orchestrator.inner.store.save_session(&session).await.unwrap();

        assert_eq!(h.orchestrator.recover_interrupted().await.unwrap(), 1);
        let recovered = h.orchestrator.get_session(session.id).await.unwrap();
        assert_eq!(recovered.status, SessionStatus::Scheduled);
        assert_eq!(recovered.last_failure_reason.as_deref(), Some("interrupted"));
        assert_eq!(recovered.current_question_id.as_deref(), Some("q1"));
    }
}
