use crate::core::Result;
use async_trait::async_trait;

/// A message handed to a consumer, with enough coordinates to commit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
    pub payload: Vec<u8>,
}

/// Message broker collaborator.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Join consumer group `group` on `topic`. Consumption resumes from the
    /// group's committed offset.
    async fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>>;
}

/// One consumer-group member reading a topic, one message at a time.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message. `None` once the broker is closed.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    /// Commit the offset of a processed message.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Give an unprocessed message back; it is delivered again next.
    async fn rewind(&mut self, delivery: &Delivery) -> Result<()>;
}
