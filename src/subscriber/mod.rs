#[cfg(test)]
mod subscriber_test;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

/// Receives payloads routed to a registered endpoint key.
///
/// The message is a shared-owned immutable byte slice; the engine keeps no
/// reference once the handler returns. The return value is advisory and
/// the engine never inspects it.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle_message(&self, msg: Bytes) -> i32;
}

/// Concurrent map from endpoint key to handler. Many readers (one per
/// receive task or dispatched closure), occasional writers.
#[derive(Default)]
pub struct SubscriberTable {
    subscribers: RwLock<HashMap<String, Arc<dyn Subscriber>>>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        SubscriberTable::default()
    }

    /// Registers `sub` under `key`, replacing any previous handler.
    pub fn register(&self, key: String, sub: Arc<dyn Subscriber>) {
        log::debug!("Registering subscriber for key {key}");
        self.subscribers.write().insert(key, sub);
    }

    pub fn find(&self, key: &str) -> Option<Arc<dyn Subscriber>> {
        self.subscribers.read().get(key).cloned()
    }

    /// Picks the handler of the first candidate key present in the table.
    pub fn resolve(&self, candidates: &[String]) -> Option<Arc<dyn Subscriber>> {
        let subscribers = self.subscribers.read();
        candidates
            .iter()
            .find_map(|key| subscribers.get(key).cloned())
    }

    pub fn clear(&self) {
        self.subscribers.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Routes one received payload: the handler of the strongest matching key
/// runs, or the payload is dropped with a warning.
pub(crate) async fn deliver(table: Arc<SubscriberTable>, candidates: [String; 4], msg: Bytes) {
    match table.resolve(&candidates) {
        Some(sub) => {
            let _ = sub.handle_message(msg).await;
        }
        None => {
            log::warn!("No subscriber found for message from {}", candidates[0]);
        }
    }
}
