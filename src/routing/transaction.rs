use super::RoutingPolicy;
use super::pool::FailureSink;
use crate::core::Result;
use crate::store::{ConnTx, ExecResult, Row, Statement};
use async_trait::async_trait;
use std::sync::Arc;

/// Transaction spanning one or two stores.
///
/// The policy is captured at begin time; later policy switches do not
/// affect it. Statements, commit and rollback hit the primary first and
/// reach the secondary only if the primary succeeded. If the primary fails
/// to commit or roll back, the secondary transaction is dropped, which the
/// store treats as a rollback.
pub struct RoutingTx {
    policy: RoutingPolicy,
    primary_name: String,
    primary: Box<dyn ConnTx>,
    secondary: Option<(String, Box<dyn ConnTx>)>,
    failures: Arc<FailureSink>,
}

impl RoutingTx {
    pub(crate) fn new(
        policy: RoutingPolicy,
        primary_name: String,
        primary: Box<dyn ConnTx>,
        secondary: Option<(String, Box<dyn ConnTx>)>,
        failures: Arc<FailureSink>,
    ) -> Self {
        Self {
            policy,
            primary_name,
            primary,
            secondary,
            failures,
        }
    }

    /// Policy this transaction was opened under.
    pub fn policy(&self) -> RoutingPolicy {
        self.policy
    }

    pub fn primary_store(&self) -> &str {
        &self.primary_name
    }

    /// Whether a secondary transaction is attached (it may have failed to open).
    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }
}

#[async_trait]
impl ConnTx for RoutingTx {
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        let res = self.primary.execute(stmt).await?;
        if let Some((name, secondary)) = self.secondary.as_mut() {
            if let Err(err) = secondary.execute(stmt).await {
                self.failures.record(name, "tx_execute", Some(stmt), &err);
            }
        }
        Ok(res)
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        self.primary.query(stmt).await
    }

    async fn query_row(&mut self, stmt: &Statement) -> Result<Row> {
        self.primary.query_row(stmt).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.primary.commit().await?;
        if let Some((name, secondary)) = this.secondary {
            if let Err(err) = secondary.commit().await {
                this.failures.record(&name, "commit", None, &err);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.primary.rollback().await?;
        if let Some((name, secondary)) = this.secondary {
            if let Err(err) = secondary.rollback().await {
                this.failures.record(&name, "rollback", None, &err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MigrateError;
    use crate::routing::{PolicyCell, RoutingPool};
    use crate::store::{ConnPool, MemoryConnPool};

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

    fn update(id: i64) -> Statement {
        Statement::new("UPDATE accounts SET balance = balance + 1 WHERE id = ?").bind(id)
    }

    #[tokio::test]
    async fn test_commit_reaches_both_stores() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        let mut tx = pool.begin_transaction().await.unwrap();
        assert!(tx.has_secondary());
        tx.execute(&update(1)).await.unwrap();
        Box::new(tx).commit().await.unwrap();

        assert_eq!(src.committed(), vec![update(1)]);
        assert_eq!(dst.committed(), vec![update(1)]);
    }

    #[tokio::test]
    async fn test_policy_is_frozen_at_begin() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcOnly);
        let mut tx = pool.begin_transaction().await.unwrap();

        pool.update_policy(RoutingPolicy::DstFirst);
        tx.execute(&update(1)).await.unwrap();
        assert_eq!(tx.policy(), RoutingPolicy::SrcOnly);
        Box::new(tx).commit().await.unwrap();

        assert_eq!(src.committed().len(), 1);
        assert!(dst.committed().is_empty());
        assert_eq!(dst.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_secondary_commit_failure_is_absorbed() {
        let (src, dst, pool) = pools(RoutingPolicy::DstFirst);
        src.faults().fail_next_op("commit", 1);

        let mut tx = pool.begin_transaction().await.unwrap();
        assert_eq!(tx.primary_store(), "dst");
        tx.execute(&update(3)).await.unwrap();
        Box::new(tx).commit().await.unwrap();

        assert_eq!(dst.committed().len(), 1);
        assert!(src.committed().is_empty());
        let stats = pool.stats();
        assert_eq!(stats.secondary_failures, 1);
        assert_eq!(stats.last_secondary_failure.unwrap().operation, "commit");
    }

    #[tokio::test]
    async fn test_primary_commit_failure_returns_and_drops_secondary() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        src.faults().fail_next_op("commit", 1);

        let mut tx = pool.begin_transaction().await.unwrap();
        tx.execute(&update(1)).await.unwrap();
        let res = Box::new(tx).commit().await;

        assert!(matches!(res, Err(MigrateError::Store(_))));
        assert!(src.committed().is_empty());
        assert!(dst.committed().is_empty());
        assert_eq!(dst.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_secondary_begin_failure_degrades_to_primary_only() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        dst.faults().fail_next_op("begin", 1);

        let mut tx = pool.begin_transaction().await.unwrap();
        assert!(!tx.has_secondary());
        tx.execute(&update(1)).await.unwrap();
        Box::new(tx).commit().await.unwrap();

        assert_eq!(src.committed().len(), 1);
        assert!(dst.committed().is_empty());
        assert_eq!(pool.stats().secondary_failures, 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_both() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        let mut tx = pool.begin().await.unwrap();
        tx.execute(&update(1)).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(src.committed().is_empty());
        assert!(dst.committed().is_empty());
        assert_eq!(src.rolled_back_transactions(), 1);
        assert_eq!(dst.rolled_back_transactions(), 1);
    }

    #[tokio::test]
    async fn test_secondary_statement_failure_keeps_primary() {
        let (src, dst, pool) = pools(RoutingPolicy::SrcFirst);
        dst.faults().fail_next_op("tx_execute", 1);

        let mut tx = pool.begin_transaction().await.unwrap();
        tx.execute(&update(1)).await.unwrap();
        tx.execute(&update(2)).await.unwrap();
        Box::new(tx).commit().await.unwrap();

        assert_eq!(src.committed().len(), 2);
        assert_eq!(dst.committed(), vec![update(2)]);
    }
}
