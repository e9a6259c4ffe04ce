use super::broker::{Delivery, Subscription};
use super::decode;
use crate::config::MigratorConfig;
use crate::core::{MigrateError, Result, sleep_or_cancel, with_deadline};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Business logic applied to each decoded message.
///
/// `cancel` is the consumer's token; long-running handlers should pass it
/// down to their own store calls.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, delivery: &Delivery, msg: T)
    -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deadline for a single handler invocation
    pub handler_timeout: Duration,
    /// Pause before a failed message is read again
    pub redelivery_backoff: Duration,
}

impl ConsumeOptions {
    pub fn from_config(config: &MigratorConfig) -> Self {
        Self {
            handler_timeout: config.fix_timeout,
            redelivery_backoff: config.redelivery_backoff,
        }
    }
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self::from_config(&MigratorConfig::default())
    }
}

/// Drives `sub` until `cancel` fires or the broker closes.
///
/// A message is acknowledged only once `handler` succeeded on it. Failed
/// messages are rewound and retried after `redelivery_backoff`. Payloads
/// that do not decode as `T` are logged and acknowledged, since retrying
/// them cannot help.
pub async fn consume<T, H>(
    mut sub: Box<dyn Subscription>,
    handler: Arc<H>,
    cancel: CancellationToken,
    options: ConsumeOptions,
) where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T> + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = sub.next() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                debug!("subscription closed");
                return;
            }
            Err(err) => {
                warn!(error = %err, "failed to read next message");
                if sleep_or_cancel(&cancel, options.redelivery_backoff).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let msg: T = match decode(&delivery.payload) {
            Ok(msg) => msg,
            Err(err) => {
                error!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %err,
                    "failed to decode message, skipping"
                );
                ack(sub.as_mut(), &delivery).await;
                continue;
            }
        };

        let outcome = with_deadline(
            &cancel,
            options.handler_timeout,
            handler.handle(&cancel, &delivery, msg),
        )
        .await;

        match outcome {
            Ok(()) => ack(sub.as_mut(), &delivery).await,
            // Left unacknowledged; the group reads it again next time.
            Err(MigrateError::Cancelled) => return,
            Err(err) => {
                error!(
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    error = %err,
                    "failed to handle message, will retry"
                );
                if let Err(err) = sub.rewind(&delivery).await {
                    warn!(error = %err, "failed to rewind subscription");
                }
                if sleep_or_cancel(&cancel, options.redelivery_backoff).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn ack(sub: &mut dyn Subscription, delivery: &Delivery) {
    if let Err(err) = sub.ack(delivery).await {
        warn!(
            topic = %delivery.topic,
            offset = delivery.offset,
            error = %err,
            "failed to commit offset"
        );
    }
}

/// Background consumer loop.
pub struct ConsumerHandle {
    cancel: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn spawn<T, H>(
        sub: Box<dyn Subscription>,
        handler: Arc<H>,
        cancel: CancellationToken,
        options: ConsumeOptions,
    ) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T> + ?Sized + 'static,
    {
        let token = cancel.clone();
        let join_handle = tokio::spawn(consume(sub, handler, token, options));
        Self {
            cancel,
            join_handle: Some(join_handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Signals the consumer to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| MigrateError::Job(format!("consumer join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
