use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// Run-scoped pub/sub: topic -> subscriber queues. Publishing is best-effort;
/// a dropped receiver unsubscribes its queue on the next publish.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, topic: &str, event: Value) {
        let mut topics = self.topics.lock();
        if let Some(queues) = topics.get_mut(topic) {
            queues.retain(|tx| tx.send(event.clone()).is_ok());
            if queues.is_empty() {
                topics.remove(topic);
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.lock().entry(topic.to_string()).or_default().push(tx);
        rx
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |q| q.len())
    }
}
