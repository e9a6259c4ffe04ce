use super::Reporter;
use crate::config::MigratorConfig;
use crate::core::{Entity, MigrateError, Result, with_deadline};
use crate::events::{
    Broker, ConsumeOptions, ConsumerHandle, Delivery, Direction, InconsistencyKind,
    MessageHandler, Producer, RowChangeEvent,
};
use crate::routing::{PolicyCell, Side};
use crate::store::EntityStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Checks one row, by id, in both stores.
pub struct IncrementalValidator<T: Entity> {
    base: Arc<dyn EntityStore<T>>,
    target: Arc<dyn EntityStore<T>>,
    reporter: Reporter,
    call_timeout: Duration,
}

impl<T: Entity> IncrementalValidator<T> {
    pub fn new(
        base: Arc<dyn EntityStore<T>>,
        target: Arc<dyn EntityStore<T>>,
        direction: Direction,
        producer: Arc<dyn Producer>,
        config: &MigratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            base,
            target,
            reporter: Reporter::new(producer, direction, config.call_timeout),
            call_timeout: config.call_timeout,
        })
    }

    pub fn direction(&self) -> Direction {
        self.reporter.direction()
    }

    async fn lookup(
        &self,
        cancel: &CancellationToken,
        store: &Arc<dyn EntityStore<T>>,
        id: i64,
    ) -> Result<Option<T>> {
        match with_deadline(cancel, self.call_timeout, store.first(id)).await {
            Ok(row) => Ok(Some(row)),
            Err(MigrateError::RecordNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Reports a mismatch for `id`, if any. Lookup errors are returned so the
    /// caller can retry the row.
    pub async fn validate(&self, cancel: &CancellationToken, id: i64) -> Result<()> {
        let (base, target) = tokio::try_join!(
            self.lookup(cancel, &self.base, id),
            self.lookup(cancel, &self.target, id),
        )?;

        let kind = match (base, target) {
            (Some(base), Some(target)) if !base.compare_to(&target) => InconsistencyKind::Neq,
            (Some(_), None) => InconsistencyKind::TargetMissing,
            (None, Some(_)) => InconsistencyKind::BaseMissing,
            _ => return Ok(()),
        };
        self.reporter.notify(cancel, id, kind).await
    }
}

/// Runs an [`IncrementalValidator`] for every row-changed notification on
/// the change topic.
///
/// The base store follows the routing policy at the time each message is
/// handled: src while src serves reads, dst after the cut-over.
pub struct RowChangeListener<T: Entity> {
    /// Base = src, tagged `SRC`.
    src_base: IncrementalValidator<T>,
    /// Base = dst, tagged `DST`.
    dst_base: IncrementalValidator<T>,
    policy: Arc<PolicyCell>,
    broker: Arc<dyn Broker>,
    topic: String,
    group: String,
    options: ConsumeOptions,
}

impl<T: Entity> RowChangeListener<T> {
    /// `policy` must be the cell the scheduler writes.
    pub fn new(
        src: Arc<dyn EntityStore<T>>,
        dst: Arc<dyn EntityStore<T>>,
        policy: Arc<PolicyCell>,
        producer: Arc<dyn Producer>,
        broker: Arc<dyn Broker>,
        config: &MigratorConfig,
    ) -> Result<Self> {
        Ok(Self {
            src_base: IncrementalValidator::new(
                Arc::clone(&src),
                Arc::clone(&dst),
                Direction::Src,
                Arc::clone(&producer),
                config,
            )?,
            dst_base: IncrementalValidator::new(dst, src, Direction::Dst, producer, config)?,
            policy,
            broker,
            topic: config.change_topic.clone(),
            group: config.change_consumer_group.clone(),
            options: ConsumeOptions::from_config(config),
        })
    }

    /// Validator whose base is the store currently serving reads.
    fn current(&self) -> Result<&IncrementalValidator<T>> {
        Ok(match self.policy.load()?.primary() {
            Side::Src => &self.src_base,
            Side::Dst => &self.dst_base,
        })
    }

    /// Checks `id` against the active policy's base store.
    pub async fn validate(&self, cancel: &CancellationToken, id: i64) -> Result<()> {
        self.current()?.validate(cancel, id).await
    }

    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<ConsumerHandle> {
        let sub = self.broker.subscribe(&self.group, &self.topic).await?;
        info!(
            topic = %self.topic,
            group = %self.group,
            "row change listener started"
        );
        let options = self.options;
        Ok(ConsumerHandle::spawn::<RowChangeEvent, _>(sub, self, cancel, options))
    }
}

#[async_trait]
impl<T: Entity> MessageHandler<RowChangeEvent> for RowChangeListener<T> {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        _delivery: &Delivery,
        msg: RowChangeEvent,
    ) -> Result<()> {
        self.validate(cancel, msg.id).await
    }
}
