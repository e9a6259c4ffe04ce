use super::{Reporter, ScanMode};
use crate::config::MigratorConfig;
use crate::core::{Entity, MigrateError, Result, sleep_or_cancel, with_deadline};
use crate::events::{Direction, InconsistencyKind, Producer};
use crate::store::{EntityStore, PageQuery};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bidirectional paginated scan between a base and a target store.
///
/// `base -> target` finds rows missing from or different on the target;
/// `target -> base` finds rows that exist only on the target. Both
/// directions run concurrently and the run ends when both have ended.
/// Only cancellation-class errors end a run early; any other store error
/// skips the page it happened on.
pub struct Validator<T: Entity> {
    base: Arc<dyn EntityStore<T>>,
    target: Arc<dyn EntityStore<T>>,
    reporter: Reporter,
    batch_size: usize,
    call_timeout: Duration,
    max_consecutive_failures: usize,
    updated_since: Option<i64>,
    mode: ScanMode,
}

/// Page outcome bookkeeping for one scan direction.
struct PageFailures {
    direction: &'static str,
    consecutive: usize,
    limit: usize,
}

impl PageFailures {
    fn new(direction: &'static str, limit: usize) -> Self {
        Self {
            direction,
            consecutive: 0,
            limit,
        }
    }

    fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// Records a failed page. Returns true when the direction should give up.
    fn failed(&mut self, offset: usize, stage: &str, err: &MigrateError) -> bool {
        self.consecutive += 1;
        warn!(
            direction = self.direction,
            offset,
            stage,
            error = %err,
            "page skipped"
        );
        if self.consecutive >= self.limit {
            error!(
                direction = self.direction,
                offset,
                failures = self.consecutive,
                "too many consecutive page failures, scan direction stopped"
            );
            return true;
        }
        false
    }
}

impl<T: Entity> Validator<T> {
    /// Fails with `Config` if `config` does not validate.
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
            batch_size: config.batch_size,
            call_timeout: config.call_timeout,
            max_consecutive_failures: config.max_consecutive_failures,
            updated_since: None,
            mode: ScanMode::OneShot,
        })
    }

    /// Only scan base rows with `update_time >= updated_since`.
    pub fn updated_since(mut self, updated_since: i64) -> Self {
        self.updated_since = Some(updated_since);
        self
    }

    pub fn mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn direction(&self) -> Direction {
        self.reporter.direction()
    }

    /// Runs both scan directions until they finish or `cancel` fires.
    pub async fn validate(&self, cancel: &CancellationToken) -> Result<()> {
        info!(
            direction = %self.direction(),
            base = %self.base.name(),
            target = %self.target.name(),
            mode = ?self.mode,
            "validation started"
        );
        tokio::try_join!(self.base_to_target(cancel), self.target_to_base(cancel))?;
        info!(direction = %self.direction(), "validation finished");
        Ok(())
    }

    /// Decides what happens after a page of `fetched` rows. Returns false when
    /// the direction is done.
    async fn advance(
        &self,
        cancel: &CancellationToken,
        offset: &mut usize,
        fetched: usize,
    ) -> Result<bool> {
        *offset += fetched;
        if fetched >= self.batch_size {
            return Ok(true);
        }
        match self.mode {
            ScanMode::OneShot => Ok(false),
            ScanMode::Continuous { poll_interval } => {
                sleep_or_cancel(cancel, poll_interval).await?;
                Ok(true)
            }
        }
    }

    async fn base_to_target(&self, cancel: &CancellationToken) -> Result<()> {
        let mut offset = 0;
        let mut failures = PageFailures::new("base_to_target", self.max_consecutive_failures);
        loop {
            let mut query = PageQuery::new(offset, self.batch_size);
            query.updated_since = self.updated_since;

            let page = with_deadline(cancel, self.call_timeout, self.base.find_page(query)).await;
            let page = match page {
                Ok(page) => page,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    if failures.failed(offset, "read base page", &err) {
                        return Ok(());
                    }
                    offset += self.batch_size;
                    continue;
                }
            };
            let fetched = page.len();

            match self.diff_target(cancel, dedup_by_id(page)).await {
                Ok(()) => failures.succeeded(),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    if failures.failed(offset, "read target rows", &err) {
                        return Ok(());
                    }
                }
            }

            if !self.advance(cancel, &mut offset, fetched).await? {
                debug!(offset, "base_to_target scan complete");
                return Ok(());
            }
        }
    }

    async fn diff_target(&self, cancel: &CancellationToken, bases: Vec<T>) -> Result<()> {
        if bases.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = bases.iter().map(Entity::id).collect();
        let targets =
            with_deadline(cancel, self.call_timeout, self.target.find_by_ids(&ids)).await?;
        let targets: HashMap<i64, T> = targets.into_iter().map(|t| (t.id(), t)).collect();

        for base in &bases {
            let kind = match targets.get(&base.id()) {
                None => InconsistencyKind::TargetMissing,
                Some(target) if !base.compare_to(target) => InconsistencyKind::Neq,
                Some(_) => continue,
            };
            self.reporter.notify(cancel, base.id(), kind).await?;
        }
        Ok(())
    }

    async fn target_to_base(&self, cancel: &CancellationToken) -> Result<()> {
        let mut offset = 0;
        let mut failures = PageFailures::new("target_to_base", self.max_consecutive_failures);
        loop {
            let query = PageQuery::new(offset, self.batch_size);
            let page = with_deadline(cancel, self.call_timeout, self.target.find_page(query)).await;
            let page = match page {
                Ok(page) => page,
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    if failures.failed(offset, "read target page", &err) {
                        return Ok(());
                    }
                    offset += self.batch_size;
                    continue;
                }
            };
            let fetched = page.len();
            let ids = dedup_ids(page.iter().map(Entity::id));

            match self.diff_base(cancel, ids).await {
                Ok(()) => failures.succeeded(),
                Err(err) if err.is_cancellation() => return Err(err),
                Err(err) => {
                    if failures.failed(offset, "read base ids", &err) {
                        return Ok(());
                    }
                }
            }

            if !self.advance(cancel, &mut offset, fetched).await? {
                debug!(offset, "target_to_base scan complete");
                return Ok(());
            }
        }
    }

    async fn diff_base(&self, cancel: &CancellationToken, target_ids: Vec<i64>) -> Result<()> {
        if target_ids.is_empty() {
            return Ok(());
        }
        let present: HashSet<i64> =
            with_deadline(cancel, self.call_timeout, self.base.find_ids(&target_ids))
                .await?
                .into_iter()
                .collect();

        for id in target_ids.into_iter().filter(|id| !present.contains(id)) {
            self.reporter
                .notify(cancel, id, InconsistencyKind::BaseMissing)
                .await?;
        }
        Ok(())
    }
}

/// Keeps the first row per id, preserving order.
fn dedup_by_id<T: Entity>(rows: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter().filter(|row| seen.insert(row.id())).collect()
}

fn dedup_ids(ids: impl Iterator<Item = i64>) -> Vec<i64> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}
