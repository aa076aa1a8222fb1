/*!
In-memory bus for tests without a broker

Records every publish in order and keeps a retained view (last retained payload per topic),
which is what a late subscriber would receive from a real broker. The connectivity switch makes
publishes fail the way a dropped broker connection does.
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use unas_core::{Bus, BusError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Clone)]
pub struct MockBus {
    published: Arc<Mutex<Vec<MockMessage>>>,
    retained: Arc<Mutex<HashMap<String, String>>>,
    connected: Arc<AtomicBool>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            retained: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(true)),
            incoming: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Channel receiving messages injected with `simulate_incoming`
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.incoming.lock() = Some(tx);
        rx
    }

    /// Inject a message as if the broker had delivered it
    pub fn simulate_incoming(&self, topic: &str, payload: &str) -> anyhow::Result<()> {
        let message = MockMessage { topic: topic.to_string(), payload: payload.to_string(), retain: false };
        match self.incoming.lock().as_ref() {
            Some(tx) => tx.send(message).map_err(|e| anyhow::anyhow!("receiver dropped: {e}"))?,
            None => anyhow::bail!("no receiver set up"),
        }
        log::info!("📨 [MOCK] simulated incoming on {topic}");
        Ok(())
    }

    pub fn published(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    pub fn last_payload(&self, topic: &str) -> Option<String> {
        self.published.lock().iter().rev().find(|m| m.topic == topic).map(|m| m.payload.clone())
    }

    pub fn retained(&self, topic: &str) -> Option<String> {
        self.retained.lock().get(topic).cloned()
    }

    /// Forget publish history; the retained view survives like a broker's would.
    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), BusError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Disconnected);
        }
        if retain {
            self.retained.lock().insert(topic.to_string(), payload.clone());
        }
        log::info!("📤 [MOCK] {topic} = {payload} (retain={retain})");
        self.published.lock().push(MockMessage { topic: topic.to_string(), payload, retain });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_records_and_retains() {
        let bus = MockBus::new();
        bus.publish("a/fan_mode", "auto".into(), true).await.unwrap();
        bus.publish("a/fan_mode", "128".into(), true).await.unwrap();
        bus.publish("a/sensor/x/state", "1".into(), false).await.unwrap();

        assert_eq!(bus.published().len(), 3);
        assert_eq!(bus.find_messages_by_topic("a/fan_mode").len(), 2);
        assert_eq!(bus.last_payload("a/fan_mode").as_deref(), Some("128"));
        assert_eq!(bus.retained("a/fan_mode").as_deref(), Some("128"));
        assert_eq!(bus.retained("a/sensor/x/state"), None);

        bus.clear();
        assert!(bus.published().is_empty());
        assert_eq!(bus.retained("a/fan_mode").as_deref(), Some("128"));
    }

    #[tokio::test]
    async fn test_disconnected_bus_rejects_publish() {
        let bus = MockBus::new();
        bus.set_connected(false);
        let err = bus.publish("t", "x".into(), false).await.unwrap_err();
        assert!(matches!(err, BusError::Disconnected));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_simulate_incoming() {
        let bus = MockBus::new();
        assert!(bus.simulate_incoming("t", "x").is_err());
        let mut rx = bus.setup_receiver();
        bus.simulate_incoming("ns/status", "online").unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "ns/status");
        assert_eq!(msg.payload, "online");
    }
}
