//! HTTP gateway channel — hands prompts to an external transport service.
//!
//! The gateway owns the telephony / messaging specifics. It receives each
//! prompt as a JSON POST and reports the event vocabulary back through the
//! control API, where `PendingDeliveries` routes it to the waiting worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::channels::channel::{
    ChannelAdapter, ChannelEvent, ChannelEventKind, DeliveryHandle, EventSender, Prompt,
};
use crate::error::ChannelError;
use crate::session::model::{ChannelKind, Contact};

/// Event senders for deliveries still awaiting gateway callbacks.
#[derive(Default)]
pub struct PendingDeliveries {
    senders: Mutex<HashMap<String, EventSender>>,
}

impl PendingDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, delivery_id: &str, events: EventSender) {
        self.senders
            .lock()
            .await
            .insert(delivery_id.to_string(), events);
    }

    pub async fn remove(&self, delivery_id: &str) {
        self.senders.lock().await.remove(delivery_id);
    }

    pub async fn len(&self) -> usize {
        self.senders.lock().await.len()
    }

    /// Forward a gateway event to its worker.
    ///
    /// Terminal events and captured answers retire the delivery. Unknown or
    /// already retired deliveries fail with `UnknownDelivery`.
    pub async fn route(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        let sender = {
            let mut senders = self.senders.lock().await;
            let retire = event.kind.is_terminal()
                || matches!(event.kind, ChannelEventKind::AnswerCaptured(_));
            if retire {
                senders.remove(&event.delivery_id)
            } else {
                senders.get(&event.delivery_id).cloned()
            }
        };

        let sender =
            sender.ok_or_else(|| ChannelError::UnknownDelivery(event.delivery_id.clone()))?;
        let delivery_id = event.delivery_id.clone();
        sender
            .send(event)
            .await
            .map_err(|_| ChannelError::UnknownDelivery(delivery_id))
    }
}

#[derive(Serialize)]
struct DeliveryRequest<'a> {
    delivery_id: &'a str,
    channel: ChannelKind,
    to: &'a str,
    contact_name: Option<&'a str>,
    expects_answer: bool,
    #[serde(flatten)]
    prompt: &'a Prompt,
}

/// Adapter for one channel kind backed by an HTTP gateway.
pub struct GatewayChannel {
    kind: ChannelKind,
    name: String,
    base_url: String,
    client: reqwest::Client,
    pending: Arc<PendingDeliveries>,
}

impl GatewayChannel {
    pub fn new(
        kind: ChannelKind,
        base_url: impl Into<String>,
        pending: Arc<PendingDeliveries>,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        Ok(Self {
            kind,
            name: format!("{kind}-gateway"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            pending,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn delivery_error(&self, reason: String) -> ChannelError {
        ChannelError::DeliveryFailed {
            channel: self.kind.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl ChannelAdapter for GatewayChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(
        &self,
        contact: &Contact,
        prompt: &Prompt,
        events: EventSender,
    ) -> Result<DeliveryHandle, ChannelError> {
        let delivery_id = Uuid::new_v4().to_string();
        let expects_answer = prompt.expects_answer();
        if expects_answer {
            self.pending.register(&delivery_id, events).await;
        }

        let body = DeliveryRequest {
            delivery_id: &delivery_id,
            channel: self.kind,
            to: &contact.phone_number,
            contact_name: contact.name.as_deref(),
            expects_answer,
            prompt,
        };

        let result = self.client.post(self.url("deliveries")).json(&body).send().await;

        let failure = match result {
            Ok(resp) if resp.status().is_success() => None,
            Ok(resp) => {
                let status = resp.status();
                let detail = resp.text().await.unwrap_or_default();
                Some(self.delivery_error(format!("gateway returned {status}: {detail}")))
            }
            Err(e) => Some(ChannelError::Http(e.to_string())),
        };

        if let Some(err) = failure {
            self.pending.remove(&delivery_id).await;
            tracing::warn!(channel = %self.kind, error = %err, "Gateway delivery failed");
            return Err(err);
        }

        tracing::debug!(channel = %self.kind, delivery_id = %delivery_id, "Gateway accepted delivery");
        Ok(DeliveryHandle {
            delivery_id,
            adapter: self.name.clone(),
        })
    }

    async fn cancel(&self, handle: &DeliveryHandle) -> Result<(), ChannelError> {
        self.pending.remove(&handle.delivery_id).await;
        let resp = self
            .client
            .post(self.url(&format!("deliveries/{}/cancel", handle.delivery_id)))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(self.delivery_error(format!("cancel returned {}", resp.status())));
        }
        Ok(())
    }

    async fn release(&self, handle: &DeliveryHandle) {
        self.pending.remove(&handle.delivery_id).await;
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.url("health"))
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.delivery_error(format!("health returned {}", resp.status())))
        }
    }
}
