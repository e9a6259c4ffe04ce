use super::transaction::RoutingTx;
use super::{PolicyCell, RoutingPolicy, Side};
use crate::core::{MigrateError, Result};
use crate::store::{ConnPool, ConnTx, ExecResult, PreparedStatement, Row, Statement};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

/// A secondary-store failure that was absorbed under a dual-write policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryFailure {
    pub store: String,
    pub operation: &'static str,
    pub statement: Option<String>,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Routing pool statistics
#[derive(Debug, Clone, Default)]
pub struct RoutingStats {
    pub policy: Option<RoutingPolicy>,
    pub secondary_failures: u64,
    pub last_secondary_failure: Option<SecondaryFailure>,
}

impl std::fmt::Display for RoutingStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let policy = self.policy.map_or("unknown", RoutingPolicy::as_str);
        write!(
            f,
            "Routing Stats: policy {}, {} secondary failures",
            policy, self.secondary_failures
        )
    }
}

/// Observability sink for absorbed secondary failures. Never re-raises.
#[derive(Debug, Default)]
pub(crate) struct FailureSink {
    count: AtomicU64,
    last: Mutex<Option<SecondaryFailure>>,
}

impl FailureSink {
    pub(crate) fn record(
        &self,
        store: &str,
        operation: &'static str,
        stmt: Option<&Statement>,
        err: &MigrateError,
    ) {
        match stmt {
            Some(stmt) => error!(
                store = %store,
                operation,
                sql = %stmt,
                error = %err,
                "dual write to secondary store failed"
            ),
            None => error!(
                store = %store,
                operation,
                error = %err,
                "dual write to secondary store failed"
            ),
        }

        self.count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(SecondaryFailure {
                store: store.to_string(),
                operation,
                statement: stmt.map(ToString::to_string),
                error: err.to_string(),
                at: Utc::now(),
            });
        }
    }

    fn snapshot(&self) -> (u64, Option<SecondaryFailure>) {
        let last = self.last.lock().ok().and_then(|l| l.clone());
        (self.count.load(Ordering::SeqCst), last)
    }
}

/// Connection pool that routes every call to the src and/or dst store
/// according to the active [`RoutingPolicy`].
///
/// Under `SrcFirst` / `DstFirst` writes go to the primary synchronously and,
/// only if that succeeds, to the secondary best-effort: secondary failures
/// are logged and counted, never returned and never retried.
pub struct RoutingPool {
    src: Arc<dyn ConnPool>,
    dst: Arc<dyn ConnPool>,
    policy: Arc<PolicyCell>,
    name: String,
    failures: Arc<FailureSink>,
}

impl RoutingPool {
    pub fn new(src: Arc<dyn ConnPool>, dst: Arc<dyn ConnPool>, policy: Arc<PolicyCell>) -> Self {
        let name = format!("routing({},{})", src.name(), dst.name());
        Self {
            src,
            dst,
            policy,
            name,
            failures: Arc::new(FailureSink::default()),
        }
    }

    pub fn policy(&self) -> Result<RoutingPolicy> {
        self.policy.load()
    }

    /// Shared handle to the policy cell this pool reads.
    pub fn policy_cell(&self) -> &Arc<PolicyCell> {
        &self.policy
    }

    pub fn update_policy(&self, policy: RoutingPolicy) {
        self.policy.store(policy);
    }

    /// Switch policy by wire name (`"src_first"`, ...).
    pub fn update_policy_named(&self, name: &str) -> Result<()> {
        let policy = name.parse::<RoutingPolicy>()?;
        self.policy.store(policy);
        Ok(())
    }

    pub fn stats(&self) -> RoutingStats {
        let (secondary_failures, last_secondary_failure) = self.failures.snapshot();
        RoutingStats {
            policy: self.policy.load().ok(),
            secondary_failures,
            last_secondary_failure,
        }
    }

    fn store(&self, side: Side) -> &Arc<dyn ConnPool> {
        match side {
            Side::Src => &self.src,
            Side::Dst => &self.dst,
        }
    }

    fn route(&self) -> Result<(RoutingPolicy, &Arc<dyn ConnPool>, Option<&Arc<dyn ConnPool>>)> {
        let policy = self.policy.load()?;
        let primary = self.store(policy.primary());
        let secondary = policy.secondary().map(|side| self.store(side));
        Ok((policy, primary, secondary))
    }

    /// Begin a transaction whose routing is frozen to the policy active now.
    pub async fn begin_transaction(&self) -> Result<RoutingTx> {
        let (policy, primary, secondary) = self.route()?;
        let primary_tx = primary.begin().await?;

        let secondary_tx = match secondary {
            Some(secondary) => match secondary.begin().await {
                Ok(tx) => Some((secondary.name().to_string(), tx)),
                Err(err) => {
                    self.failures.record(secondary.name(), "begin", None, &err);
                    None
                }
            },
            None => None,
        };

        Ok(RoutingTx::new(
            policy,
            primary.name().to_string(),
            primary_tx,
            secondary_tx,
            Arc::clone(&self.failures),
        ))
    }
}

#[async_trait]
impl ConnPool for RoutingPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, stmt: &Statement) -> Result<ExecResult> {
        let (_, primary, secondary) = self.route()?;
        let res = primary.execute(stmt).await?;
        if let Some(secondary) = secondary {
            if let Err(err) = secondary.execute(stmt).await {
                self.failures
                    .record(secondary.name(), "execute", Some(stmt), &err);
            }
        }
        Ok(res)
    }

    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>> {
        let (_, primary, _) = self.route()?;
        primary.query(stmt).await
    }

    async fn query_row(&self, stmt: &Statement) -> Result<Row> {
        let (_, primary, _) = self.route()?;
        primary.query_row(stmt).await
    }

    async fn begin(&self) -> Result<Box<dyn ConnTx>> {
        Ok(Box::new(self.begin_transaction().await?))
    }

    fn prepare(&self, _sql: &str) -> Result<PreparedStatement> {
        // A prepared statement is bound to one connection; it cannot stand
        // for two stores at once.
        Err(MigrateError::UnsupportedOperation(
            "prepare is not supported by the routing pool".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::store::MemoryConnPool;

    fn pools(policy: RoutingPolicy) -> (MemoryConnPool, MemoryConnPool, RoutingPool) {
        let src = MemoryConnPool::new("src");
        let dst = MemoryConnPool::new("dst");
        let pool = RoutingPool::new(
            Arc::new(src.clone()),
            Arc::new(dst.clone()),
            PolicyCell::shared(policy),
        );
        (src, dst, pool)
    }

    fn insert(id: i64) -> Statement {
        Statement::new("INSERT INTO accounts (id) VALUES (?)").bind(id)
    }

    #[tokio::test]
    async fn test_single_store_policies() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcOnly);
        pool.execute(&insert(1)).await.unwrap();
        assert_eq!(src.committed().len(), 1);
        assert!(dst.committed().is_empty());

        pool.update_policy(RoutingPolicy::DstOnly);
        pool.execute(&insert(2)).await.unwrap();
        assert_eq!(src.committed().len(), 1);
        assert_eq!(dst.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_single_store_errors_propagate() {
        let (src, _dst, pool) = pools(RoutingPolicy::SrcOnly);
        src.faults().fail_next_op("execute", 1);
        assert!(matches!(
            pool.execute(&insert(1)).await,
            Err(MigrateError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_dual_write_duplicates_in_order() {
        let (src, dst, pool) = pools(RoutingPolicy::DstFirst);
        pool.execute(&insert(1)).await.unwrap();
        assert_eq!(src.committed(), vec![insert(1)]);
        assert_eq!(dst.committed(), vec![insert(1)]);
    }

    #[tokio::test]
    async fn test_primary_failure_skips_secondary() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        src.faults().fail_next_op("execute", 1);

        assert!(pool.execute(&insert(1)).await.is_err());
        assert!(dst.committed().is_empty());
        assert_eq!(pool.stats().secondary_failures, 0);
    }

    #[tokio::test]
    async fn test_secondary_failure_is_absorbed_and_recorded() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        dst.faults().fail_next_op("execute", 1);

        let res = pool.execute(&insert(7)).await;
        assert!(res.is_ok());
        assert_eq!(src.committed().len(), 1);
        assert!(dst.committed().is_empty());

        let stats = pool.stats();
        assert_eq!(stats.secondary_failures, 1);
        let failure = stats.last_secondary_failure.unwrap();
        assert_eq!(failure.store, "dst");
        assert_eq!(failure.operation, "execute");
        assert!(failure.statement.unwrap().contains("INSERT INTO accounts"));
    }

    #[tokio::test]
    async fn test_reads_go_to_primary() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        src.set_result("SELECT name FROM accounts", vec![vec![Value::from("src")]]);
        dst.set_result("SELECT name FROM accounts", vec![vec![Value::from("dst")]]);

        let stmt = Statement::new("SELECT name FROM accounts");
        assert_eq!(pool.query_row(&stmt).await.unwrap(), vec![Value::from("src")]);

        pool.update_policy(RoutingPolicy::DstFirst);
        assert_eq!(pool.query(&stmt).await.unwrap(), vec![vec![Value::from("dst")]]);
    }

    #[tokio::test]
    async fn test_prepare_is_unsupported() {
        let (_src, _dst, pool) = pools(RoutingPolicy::SrcFirst);
        assert!(matches!(
            pool.prepare("SELECT 1"),
            Err(MigrateError::UnsupportedOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_policy_is_returned_not_panicked() {
        let (_src, _dst, pool) = pools(RoutingPolicy::SrcFirst);
        pool.policy_cell().store_raw(0);

        assert!(matches!(
            pool.execute(&insert(1)).await,
            Err(MigrateError::UnknownPolicy(_))
        ));
        assert!(matches!(
            pool.query_row(&Statement::new("SELECT 1")).await,
            Err(MigrateError::UnknownPolicy(_))
        ));
        assert!(matches!(
            pool.begin_transaction().await,
            Err(MigrateError::UnknownPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_update_policy_named() {
        let (_src, _dst, pool) = pools(RoutingPolicy::SrcOnly);
        pool.update_policy_named("dst_first").unwrap();
        assert_eq!(pool.policy().unwrap(), RoutingPolicy::DstFirst);
        assert!(matches!(
            pool.update_policy_named("both"),
            Err(MigrateError::UnknownPolicy(_))
        ));
        assert_eq!(pool.policy().unwrap(), RoutingPolicy::DstFirst);
    }
}
