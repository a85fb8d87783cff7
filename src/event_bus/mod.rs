//! Event Bus: in-process topic-based publish/subscribe.
//!
//! Used by the actor to broadcast workflow state changes on `workflows` and
//! `workflow:{id}`, and by the alert dispatcher on `alerts` /
//! `alerts:{severity}`. Delivery is best-effort within the process.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// A topic-scoped publish/subscribe bus backed by one `broadcast` channel
/// per topic, created lazily on first publish or subscribe.
pub struct EventBus {
    topics: DashMap<String, broadcast::Sender<Value>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish `payload` on `topic`. A no-op if there are no subscribers.
    pub fn publish(&self, topic: &str, payload: Value) {
        let sender = self.sender_for(topic);
        let _ = sender.send(payload);
    }

    /// Subscribe to `topic`, receiving every message published from this
    /// point on.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender_for(topic).subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("workflows");
        bus.publish("workflows", json!({"workflow_id": "wf-1"}));
        let received = rx.recv().await.unwrap();
        assert_eq!(received["workflow_id"], "wf-1");
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new();
        let mut workflows_rx = bus.subscribe("workflows");
        let _alerts_rx = bus.subscribe("alerts");
        bus.publish("alerts", json!({"id": "a1"}));
        bus.publish("workflows", json!({"workflow_id": "wf-1"}));
        let received = workflows_rx.recv().await.unwrap();
        assert_eq!(received["workflow_id"], "wf-1");
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish("workflow:wf-1", json!({}));
    }
}
