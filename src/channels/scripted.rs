//! Scripted channel — in-process adapter for simulations and tests.
//!
//! Each contact (by phone number) can be given a queue of steps consumed one
//! per answer-expecting prompt. When a contact's script runs out the adapter
//! either auto-answers with a valid response or stays silent.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::channels::channel::{
    ChannelAdapter, ChannelEvent, ChannelEventKind, DeliveryHandle, EventSender, Prompt,
    PromptKind,
};
use crate::error::ChannelError;
use crate::session::model::Contact;
use crate::survey::model::QuestionType;

/// What the simulated contact does in response to one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Answer(String),
    /// Say nothing; the worker's answer timeout fires.
    Silence,
    NoAnswer,
    Busy,
    Fail(String),
    HangUp,
    /// `deliver` itself returns an error.
    Reject(String),
}

/// A prompt the adapter was asked to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub phone_number: String,
    pub prompt: Prompt,
}

pub struct ScriptedChannel {
    scripts: Mutex<HashMap<String, VecDeque<ScriptStep>>>,
    auto_answer: bool,
    reply_delay: Duration,
    deliveries: Mutex<Vec<DeliveryRecord>>,
    cancelled: Mutex<Vec<String>>,
    counter: AtomicU64,
}

impl Default for ScriptedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChannel {
    /// Silent once scripts run out, replies immediately.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            auto_answer: false,
            reply_delay: Duration::ZERO,
            deliveries: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Answer every unscripted question with a valid response.
    pub fn auto_answering() -> Self {
        Self {
            auto_answer: true,
            ..Self::new()
        }
    }

    /// Delay each scripted reply.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Append steps to a contact's script.
    pub async fn script<I>(&self, phone_number: &str, steps: I)
    where
        I: IntoIterator<Item = ScriptStep>,
    {
        self.scripts
            .lock()
            .await
            .entry(phone_number.to_string())
            .or_default()
            .extend(steps);
    }

    pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries.lock().await.clone()
    }

    /// Question ids asked of one contact, in order (re-prompts included).
    pub async fn questions_asked(&self, phone_number: &str) -> Vec<String> {
        self.deliveries
            .lock()
            .await
            .iter()
            .filter(|d| d.phone_number == phone_number)
            .filter_map(|d| d.prompt.question_id.clone())
            .collect()
    }

    pub async fn prompts_of_kind(&self, phone_number: &str, kind: PromptKind) -> usize {
        self.deliveries
            .lock()
            .await
            .iter()
            .filter(|d| d.phone_number == phone_number && d.prompt.kind == kind)
            .count()
    }

    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }

    fn auto_reply(prompt: &Prompt) -> String {
        match prompt.question_type {
            Some(QuestionType::Numeric) => "4".to_string(),
            Some(QuestionType::YesNo) => "yes".to_string(),
            Some(QuestionType::MultipleChoice) => {
                prompt.options.first().cloned().unwrap_or_default()
            }
            Some(QuestionType::OpenEnded) | None => "No complaints.".to_string(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn deliver(
        &self,
        contact: &Contact,
        prompt: &Prompt,
        events: EventSender,
    ) -> Result<DeliveryHandle, ChannelError> {
        let delivery_id = format!("sim-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);

        if !prompt.expects_answer() {
            self.record(&delivery_id, contact, prompt).await;
            return Ok(DeliveryHandle {
                delivery_id,
                adapter: self.name().to_string(),
            });
        }

        let step = self
            .scripts
            .lock()
            .await
            .get_mut(&contact.phone_number)
            .and_then(VecDeque::pop_front);

        let step = match step {
            Some(step) => step,
            None if self.auto_answer => ScriptStep::Answer(Self::auto_reply(prompt)),
            None => ScriptStep::Silence,
        };

        let kind = match step {
            ScriptStep::Reject(reason) => {
                return Err(ChannelError::DeliveryFailed {
                    channel: self.name().to_string(),
                    reason,
                });
            }
            ScriptStep::Silence => None,
            ScriptStep::Answer(raw) => Some(ChannelEventKind::AnswerCaptured(raw)),
            ScriptStep::NoAnswer => Some(ChannelEventKind::NoAnswer),
            ScriptStep::Busy => Some(ChannelEventKind::Busy),
            ScriptStep::Fail(code) => Some(ChannelEventKind::Failed(code)),
            ScriptStep::HangUp => Some(ChannelEventKind::Completed),
        };

        self.record(&delivery_id, contact, prompt).await;

        if let Some(kind) = kind {
            let event = ChannelEvent::new(delivery_id.clone(), kind);
            let delay = self.reply_delay;
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = events.send(event).await;
            });
        }

        Ok(DeliveryHandle {
            delivery_id,
            adapter: self.name().to_string(),
        })
    }

    async fn cancel(&self, handle: &DeliveryHandle) -> Result<(), ChannelError> {
        self.cancelled.lock().await.push(handle.delivery_id.clone());
        Ok(())
    }
}

impl ScriptedChannel {
    async fn record(&self, delivery_id: &str, contact: &Contact, prompt: &Prompt) {
        tracing::debug!(
            delivery_id,
            phone = %contact.phone_number,
            kind = ?prompt.kind,
            "Scripted delivery"
        );
        self.deliveries.lock().await.push(DeliveryRecord {
            delivery_id: delivery_id.to_string(),
            phone_number: contact.phone_number.clone(),
            prompt: prompt.clone(),
        });
    }
}
