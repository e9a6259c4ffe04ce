use super::broker::{Broker, Delivery};
use super::handler::{ConsumeOptions, ConsumerHandle, MessageHandler};
use super::{Direction, InconsistentEvent};
use crate::config::MigratorConfig;
use crate::core::{Entity, MigrateError, Result};
use crate::store::EntityStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Makes the target row match the base row.
///
/// The base row is re-read at repair time rather than trusted from the
/// event, so repeating a repair is harmless and a stale event can only
/// copy the latest state.
pub struct OverrideFixer<T: Entity> {
    base: Arc<dyn EntityStore<T>>,
    target: Arc<dyn EntityStore<T>>,
}

impl<T: Entity> OverrideFixer<T> {
    pub fn new(base: Arc<dyn EntityStore<T>>, target: Arc<dyn EntityStore<T>>) -> Self {
        Self { base, target }
    }

    pub async fn fix(&self, id: i64) -> Result<()> {
        match self.base.first(id).await {
            Ok(row) => {
                self.target.upsert(&row).await?;
                debug!(
                    id,
                    base = %self.base.name(),
                    target = %self.target.name(),
                    "row overridden from base"
                );
                Ok(())
            }
            Err(MigrateError::RecordNotFound) => {
                let removed = self.target.delete(id).await?;
                debug!(
                    id,
                    removed,
                    target = %self.target.name(),
                    "row absent from base, deleted from target"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Consumes inconsistency events and repairs the side that was not
/// authoritative when the mismatch was found.
pub struct FixConsumer<T: Entity> {
    /// SRC events: src is the base.
    src_to_dst: OverrideFixer<T>,
    /// DST events: dst is the base.
    dst_to_src: OverrideFixer<T>,
    broker: Arc<dyn Broker>,
    topic: String,
    group: String,
    options: ConsumeOptions,
}

impl<T: Entity> FixConsumer<T> {
    pub fn new(
        broker: Arc<dyn Broker>,
        src: Arc<dyn EntityStore<T>>,
        dst: Arc<dyn EntityStore<T>>,
        config: &MigratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            src_to_dst: OverrideFixer::new(Arc::clone(&src), Arc::clone(&dst)),
            dst_to_src: OverrideFixer::new(dst, src),
            broker,
            topic: config.inconsistency_topic.clone(),
            group: config.fix_consumer_group.clone(),
            options: ConsumeOptions::from_config(config),
        })
    }

    pub async fn fix(&self, evt: &InconsistentEvent) -> Result<()> {
        match evt.direction {
            Direction::Src => self.src_to_dst.fix(evt.id).await,
            Direction::Dst => self.dst_to_src.fix(evt.id).await,
        }
    }

    /// Joins the fixer consumer group and starts repairing in the background.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<ConsumerHandle> {
        let sub = self.broker.subscribe(&self.group, &self.topic).await?;
        info!(topic = %self.topic, group = %self.group, "fix consumer started");
        let options = self.options;
        Ok(ConsumerHandle::spawn::<InconsistentEvent, _>(
            sub, self, cancel, options,
        ))
    }
}

#[async_trait]
impl<T: Entity> MessageHandler<InconsistentEvent> for FixConsumer<T> {
    async fn handle(
        &self,
        _cancel: &CancellationToken,
        _delivery: &Delivery,
        evt: InconsistentEvent,
    ) -> Result<()> {
        self.fix(&evt).await
    }
}
