//! Attempt worker — drives one live attempt over its channel adapter.
//!
//! The worker delivers prompts and consumes the adapter's events from its own
//! queue. It never writes session state itself: answers and the final outcome
//! go back through the orchestrator.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channels::{
    ChannelAdapter, ChannelEvent, ChannelEventKind, DeliveryHandle, EventSender, Prompt,
};
use crate::error::{Error, SessionError};
use crate::orchestrator::engine::{AttemptOutcome, Orchestrator};
use crate::session::model::{ChannelKind, Contact, FailureReason};
use crate::survey::flow::FlowStep;
use crate::survey::graph::SurveyGraph;

const EVENT_QUEUE: usize = 64;

/// Everything a worker needs, captured at dispatch time.
pub(crate) struct Attempt {
    pub session_id: Uuid,
    pub attempt: u32,
    pub contact: Contact,
    pub channel: ChannelKind,
    /// The session's pinned survey revision.
    pub graph: Arc<SurveyGraph>,
    /// Where the flow stands at dispatch.
    pub step: FlowStep,
    /// Deliver the intro first.
    pub fresh_start: bool,
    pub cancel: watch::Receiver<bool>,
}

/// Drive an attempt to its end and hand the outcome back.
pub(crate) async fn run(orchestrator: Orchestrator, attempt: Attempt) {
    let session_id = attempt.session_id;
    let number = attempt.attempt;

    let outcome = match orchestrator.channels().get(attempt.channel) {
        Ok(adapter) => Worker::new(orchestrator.clone(), adapter, attempt).drive().await,
        Err(e) => AttemptOutcome::Failure(FailureReason::DeliveryFailed(e.to_string())),
    };
    debug!(session_id = %session_id, attempt = number, ?outcome, "Attempt finished");

    if let Err(e) = orchestrator.finish_attempt(session_id, outcome).await {
        error!(session_id = %session_id, error = %e, "Failed to record attempt outcome");
    }
}

/// What woke the worker while it waited for an answer.
enum Wake {
    Cancelled,
    DeadlinePassed,
    Silence,
    Event(Option<ChannelEvent>),
}

struct Worker {
    orchestrator: Orchestrator,
    adapter: Arc<dyn ChannelAdapter>,
    attempt: Attempt,
    events_tx: EventSender,
    events: mpsc::Receiver<ChannelEvent>,
    /// `max_duration` ceiling; `None` when the survey sets none.
    deadline: Option<Instant>,
}

impl Worker {
    fn new(orchestrator: Orchestrator, adapter: Arc<dyn ChannelAdapter>, attempt: Attempt) -> Self {
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE);
        let max_duration = attempt.graph.survey().max_duration;
        let deadline = (max_duration > 0)
            .then(|| Instant::now() + std::time::Duration::from_secs(u64::from(max_duration)));
        Self {
            orchestrator,
            adapter,
            attempt,
            events_tx,
            events,
            deadline,
        }
    }

    async fn drive(mut self) -> AttemptOutcome {
        let graph = self.attempt.graph.clone();
        let survey = graph.survey();

        if self.attempt.fresh_start && !survey.intro_message.trim().is_empty() {
            let intro = Prompt::intro(self.attempt.session_id, survey);
            if let Err(e) = self.deliver(&intro).await {
                return AttemptOutcome::Failure(FailureReason::DeliveryFailed(e.to_string()));
            }
        }

        let mut step = self.attempt.step.clone();
        loop {
            match step {
                FlowStep::Complete => {
                    self.deliver_outro().await;
                    return AttemptOutcome::Completed;
                }
                FlowStep::Next(question_id) => match self.ask(&graph, &question_id).await {
                    Ok(next) => step = next,
                    Err(outcome) => return outcome,
                },
            }
        }
    }

    /// Ask one question until an acceptable answer arrives or re-prompts run out.
    async fn ask(&mut self, graph: &SurveyGraph, question_id: &str) -> Result<FlowStep, AttemptOutcome> {
        let session_id = self.attempt.session_id;
        let Some(question) = graph.question(question_id) else {
            error!(session_id = %session_id, question = question_id, "Question missing from snapshot");
            return Err(AttemptOutcome::Failure(FailureReason::UnresolvedAnswer(
                question_id.to_string(),
            )));
        };
        let voice = &graph.survey().voice;
        let max_reprompts = self.orchestrator.config().max_reprompts;

        let mut prompt = Prompt::question(session_id, question, voice);
        let mut reprompts = 0;
        loop {
            let reply = self.deliver_and_wait(&prompt).await?;
            match self
                .orchestrator
                .capture_answer(session_id, question_id, reply.as_deref())
                .await
            {
                Ok(next) => return Ok(next),
                Err(Error::Flow(e)) if e.is_reprompt() => {
                    if reprompts >= max_reprompts {
                        warn!(session_id = %session_id, question = question_id, reason = %e, "Re-prompts exhausted");
                        return Err(AttemptOutcome::Failure(FailureReason::UnresolvedAnswer(
                            question_id.to_string(),
                        )));
                    }
                    reprompts += 1;
                    debug!(session_id = %session_id, question = question_id, reprompt = reprompts, reason = %e, "Re-prompting");
                    prompt = Prompt::reprompt(session_id, question, voice);
                }
                Err(Error::Session(SessionError::NotAcceptingAnswers { .. })) => {
                    return Err(AttemptOutcome::Cancelled);
                }
                Err(e) => {
                    error!(session_id = %session_id, question = question_id, error = %e, "Failed to record answer");
                    return Err(AttemptOutcome::Failure(FailureReason::Interrupted));
                }
            }
        }
    }

    /// Deliver a question and wait for its answer. `Ok(None)` means the
    /// answer timeout passed in silence.
    async fn deliver_and_wait(&mut self, prompt: &Prompt) -> Result<Option<String>, AttemptOutcome> {
        if *self.attempt.cancel.borrow() {
            return Err(AttemptOutcome::Cancelled);
        }

        let handle = self.deliver(prompt).await.map_err(|e| {
            AttemptOutcome::Failure(FailureReason::DeliveryFailed(e.to_string()))
        })?;
        let answer_deadline = Instant::now() + self.orchestrator.config().answer_timeout;
        let session_id = self.attempt.session_id;

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.attempt.cancel.changed() => Wake::Cancelled,
                _ = until(self.deadline) => Wake::DeadlinePassed,
                _ = tokio::time::sleep_until(answer_deadline) => Wake::Silence,
                event = self.events.recv() => Wake::Event(event),
            };

            let event = match wake {
                Wake::Cancelled => {
                    self.abort(&handle).await;
                    return Err(AttemptOutcome::Cancelled);
                }
                Wake::DeadlinePassed => {
                    warn!(session_id = %session_id, "Attempt exceeded max duration");
                    self.abort(&handle).await;
                    return Err(AttemptOutcome::Failure(FailureReason::Timeout));
                }
                Wake::Silence | Wake::Event(None) => {
                    self.release(&handle).await;
                    return Ok(None);
                }
                Wake::Event(Some(event)) => event,
            };

            if event.delivery_id != handle.delivery_id {
                debug!(session_id = %session_id, delivery_id = %event.delivery_id, kind = ?event.kind, "Ignoring event for an earlier prompt");
                continue;
            }

            let failure = match event.kind {
                ChannelEventKind::Ringing | ChannelEventKind::Answered => {
                    debug!(session_id = %session_id, delivery_id = %event.delivery_id, kind = ?event.kind, "Channel progress");
                    continue;
                }
                ChannelEventKind::AnswerCaptured(raw) => {
                    self.release(&handle).await;
                    return Ok(Some(raw));
                }
                ChannelEventKind::NoAnswer => FailureReason::NoAnswer,
                ChannelEventKind::Busy => FailureReason::Busy,
                ChannelEventKind::Failed(code) => FailureReason::ChannelFailed(code),
                ChannelEventKind::Completed => FailureReason::HungUp,
            };
            return Err(AttemptOutcome::Failure(failure));
        }
    }

    async fn deliver(&self, prompt: &Prompt) -> Result<DeliveryHandle, crate::error::ChannelError> {
        self.adapter
            .deliver(&self.attempt.contact, prompt, self.events_tx.clone())
            .await
    }

    async fn deliver_outro(&self) {
        let survey = self.attempt.graph.survey();
        if survey.outro_message.trim().is_empty() {
            return;
        }
        let outro = Prompt::outro(self.attempt.session_id, survey);
        if let Err(e) = self.deliver(&outro).await {
            warn!(session_id = %self.attempt.session_id, error = %e, "Outro delivery failed");
        }
    }

    /// The worker has moved past this delivery.
    async fn release(&self, handle: &DeliveryHandle) {
        self.adapter.release(handle).await;
    }

    async fn abort(&self, handle: &DeliveryHandle) {
        if let Err(e) = self.adapter.cancel(handle).await {
            warn!(
                session_id = %self.attempt.session_id,
                adapter = %handle.adapter,
                error = %e,
                "Channel cancel failed"
            );
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
