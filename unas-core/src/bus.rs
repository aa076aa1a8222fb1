//! Publishing seam over the message bus
//!
//! Both binaries publish through `Bus` so tests can swap the broker client for the devkit's
//! `MockBus`. Subscriptions stay on the concrete `rumqttc` client: they are set up once
//! at connect time and never need faking.

use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus client rejected publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("bus is not connected")]
    Disconnected,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), BusError>;
}

#[async_trait]
impl Bus for AsyncClient {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), BusError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| BusError::Publish { topic: topic.to_string(), reason: e.to_string() })
    }
}
