use super::broker::{Broker, Delivery, Subscription};
use crate::core::{MigrateError, Result};
use crate::store::memory::FaultInjector;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<u8>>>,
    /// Committed offset (next message to read) per (group, topic).
    committed: HashMap<(String, String), u64>,
    closed: bool,
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    faults: FaultInjector,
}

/// Single-partition, in-process broker with consumer-group offsets.
///
/// Good enough to exercise at-least-once consumption: a message is read
/// again by the next subscriber of the group until someone acks it.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Faults apply to `publish`.
    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>> {
        self.inner
            .state
            .lock()
            .map_err(|_| MigrateError::Broker("broker state poisoned".to_string()))
    }

    /// Raw payloads published on `topic`, in order.
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .ok()
            .and_then(|state| state.topics.get(topic).cloned())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, topic: &str) -> u64 {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .committed
                    .get(&(group.to_string(), topic.to_string()))
                    .copied()
            })
            .unwrap_or(0)
    }

    /// Ends every subscription: pending and future `next` calls return `None`.
    pub fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.closed = true;
        }
        self.inner.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.inner
            .faults
            .before_call(topic, "publish")
            .await
            .map_err(|err| MigrateError::Broker(err.to_string()))?;
        {
            let mut state = self.lock()?;
            if state.closed {
                return Err(MigrateError::Broker("broker is closed".to_string()));
            }
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(payload);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>> {
        let cursor = self.committed_offset(group, topic);
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            cursor,
        }))
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    group: String,
    topic: String,
    cursor: u64,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            // Register before checking so a publish in between is not missed.
            let notified = self.broker.inner.notify.notified();
            {
                let state = self.broker.lock()?;
                if state.closed {
                    return Ok(None);
                }
                let payload = state
                    .topics
                    .get(&self.topic)
                    .and_then(|log| log.get(self.cursor as usize))
                    .cloned();
                if let Some(payload) = payload {
                    let delivery = Delivery {
                        topic: self.topic.clone(),
                        partition: 0,
                        offset: self.cursor,
                        payload,
                    };
                    self.cursor += 1;
                    return Ok(Some(delivery));
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        let mut state = self.broker.lock()?;
        let committed = state
            .committed
            .entry((self.group.clone(), self.topic.clone()))
            .or_insert(0);
        *committed = (*committed).max(delivery.offset + 1);
        Ok(())
    }

    async fn rewind(&mut self, delivery: &Delivery) -> Result<()> {
        self.cursor = self.cursor.min(delivery.offset);
        Ok(())
    }
}
