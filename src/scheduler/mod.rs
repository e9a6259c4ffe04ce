//! Control plane of a migration: the active routing policy and the
//! validation jobs.
//!
//! Every mutation happens under one lock so that switching policy and
//! starting a job (which reads the policy) cannot interleave. The lock is
//! released before any job does real work.

pub mod job;

use crate::config::MigratorConfig;
use crate::core::{Entity, Result};
use crate::events::{Direction, Producer};
use crate::routing::{PolicyCell, RoutingPolicy, Side};
use crate::store::EntityStore;
use crate::validator::{ScanMode, Validator};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

pub use job::{JobCompletion, JobKind, JobStatus, ValidationJob};

#[derive(Default)]
struct SchedulerState {
    full: Option<ValidationJob>,
    incremental: Option<ValidationJob>,
}

impl SchedulerState {
    fn slot(&mut self, kind: JobKind) -> &mut Option<ValidationJob> {
        match kind {
            JobKind::Full => &mut self.full,
            JobKind::Incremental => &mut self.incremental,
        }
    }
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    /// `None` if the shared cell holds an unrecognized value.
    pub policy: Option<RoutingPolicy>,
    pub full: Option<JobStatus>,
    pub incremental: Option<JobStatus>,
}

pub struct Scheduler<T: Entity> {
    src: Arc<dyn EntityStore<T>>,
    dst: Arc<dyn EntityStore<T>>,
    policy: Arc<PolicyCell>,
    producer: Arc<dyn Producer>,
    config: MigratorConfig,
    state: Mutex<SchedulerState>,
}

impl<T: Entity> Scheduler<T> {
    /// `policy` must be the same cell the routing pool reads. Fails with
    /// `Config` if `config` does not validate.
    pub fn new(
        src: Arc<dyn EntityStore<T>>,
        dst: Arc<dyn EntityStore<T>>,
        policy: Arc<PolicyCell>,
        producer: Arc<dyn Producer>,
        config: MigratorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            src,
            dst,
            policy,
            producer,
            config,
            state: Mutex::new(SchedulerState::default()),
        })
    }

    pub fn policy(&self) -> Result<RoutingPolicy> {
        self.policy.load()
    }

    pub async fn set_policy(&self, policy: RoutingPolicy) {
        let _state = self.state.lock().await;
        let previous = self.policy.load().ok();
        self.policy.store(policy);
        info!(?previous, %policy, "routing policy switched");
    }

    /// Switch policy by wire name (`"src_first"`, ...).
    pub async fn set_policy_named(&self, name: &str) -> Result<RoutingPolicy> {
        let policy = name.parse::<RoutingPolicy>()?;
        self.set_policy(policy).await;
        Ok(policy)
    }

    pub async fn src_only(&self) {
        self.set_policy(RoutingPolicy::SrcOnly).await;
    }

    pub async fn src_first(&self) {
        self.set_policy(RoutingPolicy::SrcFirst).await;
    }

    pub async fn dst_first(&self) {
        self.set_policy(RoutingPolicy::DstFirst).await;
    }

    pub async fn dst_only(&self) {
        self.set_policy(RoutingPolicy::DstOnly).await;
    }

    fn store(&self, side: Side) -> Arc<dyn EntityStore<T>> {
        match side {
            Side::Src => Arc::clone(&self.src),
            Side::Dst => Arc::clone(&self.dst),
        }
    }

    /// Validator whose base is the store currently serving reads.
    fn new_validator(&self) -> Result<Validator<T>> {
        let policy = self.policy.load()?;
        let primary = policy.primary();
        Validator::new(
            self.store(primary),
            self.store(primary.other()),
            Direction::from(primary),
            Arc::clone(&self.producer),
            &self.config,
        )
    }

    /// Replaces the job of `validator`'s kind and returns the new job's id.
    /// Must be called with the state lock held.
    fn launch(&self, state: &mut SchedulerState, kind: JobKind, validator: Validator<T>) -> Uuid {
        let previous = state.slot(kind).take();
        if let Some(previous) = &previous {
            previous.cancel();
        }
        let previous = previous.filter(|_| self.config.await_previous_job);

        let (job, completion) = ValidationJob::new(kind);
        let id = job.id();
        let cancel = job.token().clone();
        let span = info_span!("validation", job = %id, %kind, direction = %validator.direction());

        tokio::spawn(
            async move {
                if let Some(previous) = previous {
                    previous.wait().await;
                }
                match validator.validate(&cancel).await {
                    Ok(()) => info!("validation job finished"),
                    Err(err) if err.is_cancellation() => info!(reason = %err, "validation job stopped"),
                    Err(err) => error!(error = %err, "validation job failed"),
                }
                completion.finish();
            }
            .instrument(span),
        );

        *state.slot(kind) = Some(job);
        id
    }

    /// Starts a one-shot scan of both tables, replacing any running one.
    ///
    /// Returns once the job is launched; its outcome is only logged.
    pub async fn start_full_validation(&self) -> Result<Uuid> {
        let mut state = self.state.lock().await;
        let validator = self.new_validator()?;
        let id = self.launch(&mut state, JobKind::Full, validator);
        info!(job = %id, "full validation started");
        Ok(id)
    }

    /// Starts a continuous scan of rows updated since `updated_since`,
    /// polling every `interval` once caught up.
    pub async fn start_incremental_validation(
        &self,
        updated_since: i64,
        interval: Duration,
    ) -> Result<Uuid> {
        let mode = ScanMode::continuous(interval)?;
        let mut state = self.state.lock().await;
        let validator = self
            .new_validator()?
            .updated_since(updated_since)
            .mode(mode);
        let id = self.launch(&mut state, JobKind::Incremental, validator);
        info!(job = %id, updated_since, ?interval, "incremental validation started");
        Ok(id)
    }

    async fn stop(&self, kind: JobKind) -> Option<ValidationJob> {
        let mut state = self.state.lock().await;
        let job = state.slot(kind).as_ref()?;
        job.cancel();
        info!(job = %job.id(), %kind, "validation stop requested");
        Some(job.clone())
    }

    /// No-op when no full job exists. The returned handle can be awaited.
    pub async fn stop_full_validation(&self) -> Option<ValidationJob> {
        self.stop(JobKind::Full).await
    }

    pub async fn stop_incremental_validation(&self) -> Option<ValidationJob> {
        self.stop(JobKind::Incremental).await
    }

    pub async fn current_job(&self, kind: JobKind) -> Option<ValidationJob> {
        let mut state = self.state.lock().await;
        state.slot(kind).clone()
    }

    pub async fn status(&self) -> SchedulerStatus {
        let state = self.state.lock().await;
        SchedulerStatus {
            policy: self.policy.load().ok(),
            full: state.full.as_ref().map(ValidationJob::status),
            incremental: state.incremental.as_ref().map(ValidationJob::status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MigrateError;
    use crate::core::entity::testing::Account;
    use crate::events::InconsistencyKind;
    use crate::store::MemoryStore;
    use crate::validator::testing::RecordingProducer;

    async fn scheduler(
        src: Vec<Account>,
        dst: Vec<Account>,
        policy: RoutingPolicy,
    ) -> (Scheduler<Account>, Arc<RecordingProducer>, MemoryStore<Account>) {
        let src = MemoryStore::with_rows("src", src).await;
        let dst = MemoryStore::with_rows("dst", dst).await;
        let producer = Arc::new(RecordingProducer::default());
        let scheduler = Scheduler::<Account>::new(
            Arc::new(src.clone()),
            Arc::new(dst),
            PolicyCell::shared(policy),
            producer.clone(),
            MigratorConfig::default(),
        )
        .unwrap();
        (scheduler, producer, src)
    }

    async fn wait_finished(job: &ValidationJob) {
        tokio::time::timeout(Duration::from_secs(1), job.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_policy_updates_shared_cell() {
        let (scheduler, _producer, _src) = scheduler(vec![], vec![], RoutingPolicy::SrcOnly).await;
        scheduler.src_first().await;
        assert_eq!(scheduler.policy().unwrap(), RoutingPolicy::SrcFirst);
        scheduler.dst_only().await;
        assert_eq!(scheduler.status().await.policy, Some(RoutingPolicy::DstOnly));

        assert!(matches!(
            scheduler.set_policy_named("nope").await,
            Err(MigrateError::UnknownPolicy(_))
        ));
        assert_eq!(scheduler.policy().unwrap(), RoutingPolicy::DstOnly);
    }

    #[tokio::test]
    async fn test_full_validation_direction_follows_policy() {
        let (scheduler, producer, _src) = scheduler(
            vec![Account::new(1, "a", 1)],
            vec![],
            RoutingPolicy::DstFirst,
        )
        .await;

        scheduler.start_full_validation().await.unwrap();
        let job = scheduler.current_job(JobKind::Full).await.unwrap();
        wait_finished(&job).await;

        // dst is the base: the src-only row shows up as base_missing.
        let events = producer.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::Dst);
        assert_eq!(events[0].kind, InconsistencyKind::BaseMissing);
    }

    #[tokio::test]
    async fn test_second_start_cancels_first() {
        let (scheduler, _producer, src) = scheduler(
            (1..=3).map(|id| Account::new(id, "a", id)).collect(),
            vec![],
            RoutingPolicy::SrcOnly,
        )
        .await;
        src.faults().set_latency(Duration::from_millis(100));

        let first = scheduler.start_full_validation().await.unwrap();
        let first_job = scheduler.current_job(JobKind::Full).await.unwrap();
        let second = scheduler.start_full_validation().await.unwrap();

        assert_ne!(first, second);
        assert!(first_job.is_cancelled());
        let status = scheduler.status().await;
        assert_eq!(status.full.as_ref().map(|s| s.id), Some(second));
        assert!(!status.full.unwrap().cancelled);
        wait_finished(&first_job).await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_prompt() {
        let (scheduler, _producer, src) = scheduler(
            vec![Account::new(1, "a", 1)],
            vec![Account::new(1, "a", 1)],
            RoutingPolicy::SrcFirst,
        )
        .await;
        assert!(scheduler.stop_full_validation().await.is_none());

        src.faults().set_latency(Duration::from_millis(300));
        scheduler.start_full_validation().await.unwrap();
        let job = scheduler.stop_full_validation().await.unwrap();
        wait_finished(&job).await;
        assert!(job.is_cancelled());

        // Stopping again is harmless.
        assert!(scheduler.stop_full_validation().await.is_some());
    }

    #[tokio::test]
    async fn test_incremental_rejects_zero_interval() {
        let (scheduler, _producer, _src) = scheduler(vec![], vec![], RoutingPolicy::SrcOnly).await;
        assert!(matches!(
            scheduler
                .start_incremental_validation(0, Duration::ZERO)
                .await,
            Err(MigrateError::Config(_))
        ));
        assert!(scheduler.status().await.incremental.is_none());
    }

    #[tokio::test]
    async fn test_incremental_runs_until_stopped() {
        let (scheduler, producer, src) = scheduler(vec![], vec![], RoutingPolicy::SrcOnly).await;
        scheduler
            .start_incremental_validation(0, Duration::from_millis(10))
            .await
            .unwrap();

        src.insert_all([Account::new(5, "e", 5)]).await;
        for _ in 0..100 {
            if !producer.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(producer.events()[0].id, 5);

        let job = scheduler.stop_incremental_validation().await.unwrap();
        wait_finished(&job).await;
        assert!(!scheduler.status().await.incremental.unwrap().running);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store = MemoryStore::<Account>::new("src");
        let res = Scheduler::<Account>::new(
            Arc::new(store.clone()),
            Arc::new(store),
            PolicyCell::shared(RoutingPolicy::SrcOnly),
            Arc::new(RecordingProducer::default()),
            MigratorConfig::default().batch_size(0),
        );
        assert!(matches!(res, Err(MigrateError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_policy_fails_job_construction() {
        let (scheduler, _producer, _src) = scheduler(vec![], vec![], RoutingPolicy::SrcOnly).await;
        scheduler.policy.store_raw(9);
        assert!(matches!(
            scheduler.start_full_validation().await,
            Err(MigrateError::UnknownPolicy(_))
        ));
        assert_eq!(scheduler.status().await.policy, None);
    }
}
