use super::broker::Broker;
use super::{InconsistentEvent, encode};
use crate::core::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Publishes detected inconsistencies for asynchronous repair.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn produce_inconsistent_event(&self, evt: &InconsistentEvent) -> Result<()>;
}

/// Producer that JSON-encodes events onto a broker topic.
pub struct BrokerProducer {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl BrokerProducer {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Producer for BrokerProducer {
    async fn produce_inconsistent_event(&self, evt: &InconsistentEvent) -> Result<()> {
        let payload = encode(evt)?;
        self.broker.publish(&self.topic, payload).await?;
        debug!(
            topic = %self.topic,
            id = evt.id,
            direction = %evt.direction,
            kind = %evt.kind,
            "inconsistency event published"
        );
        Ok(())
    }
}
