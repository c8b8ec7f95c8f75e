//! Channel manager — routes each channel kind to its adapter.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::channels::channel::ChannelAdapter;
use crate::error::ChannelError;
use crate::session::model::ChannelKind;

#[derive(Default, Clone)]
pub struct ChannelManager {
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an adapter for one channel kind, replacing any previous one.
    pub fn register(&mut self, kind: ChannelKind, adapter: Arc<dyn ChannelAdapter>) {
        tracing::info!(channel = %kind, adapter = adapter.name(), "Channel adapter registered");
        self.adapters.insert(kind, adapter);
    }

    /// Attach one adapter to every channel kind.
    pub fn register_all(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        for kind in ChannelKind::ALL {
            self.register(kind, adapter.clone());
        }
    }

    pub fn get(&self, kind: ChannelKind) -> Result<Arc<dyn ChannelAdapter>, ChannelError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| ChannelError::NotConfigured {
                channel: kind.to_string(),
            })
    }

    pub fn kinds(&self) -> Vec<ChannelKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Health of every registered adapter, by channel kind. Checks run concurrently.
    pub async fn health_check_all(&self) -> Vec<(ChannelKind, Result<(), ChannelError>)> {
        let checks = self.kinds().into_iter().filter_map(|kind| {
            let adapter = self.adapters.get(&kind)?.clone();
            Some(async move { (kind, adapter.health_check().await) })
        });
        join_all(checks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::scripted::ScriptedChannel;

    #[test]
    fn unconfigured_kind_is_an_error() {
        let mut manager = ChannelManager::new();
        manager.register(ChannelKind::Sms, Arc::new(ScriptedChannel::new()));
        assert!(manager.get(ChannelKind::Sms).is_ok());
        assert!(matches!(
            manager.get(ChannelKind::Voice),
            Err(ChannelError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn register_all_covers_every_kind() {
        let mut manager = ChannelManager::new();
        manager.register_all(Arc::new(ScriptedChannel::new()));
        assert_eq!(manager.kinds().len(), 3);
        let health = manager.health_check_all().await;
        assert!(health.iter().all(|(_, r)| r.is_ok()));
    }
}
