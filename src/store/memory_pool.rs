use super::memory::FaultInjector;
use super::{ConnPool, ConnTx, ExecResult, PreparedStatement, Row, Statement};
use crate::core::{MigrateError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct PoolState {
    /// Statements that reached the store, in apply order.
    committed: Vec<Statement>,
    /// Canned result sets keyed by SQL text.
    results: HashMap<String, Vec<Row>>,
    open_transactions: usize,
    committed_transactions: u64,
    rolled_back_transactions: u64,
}

/// In-process statement-level connection pool.
///
/// Statements are not interpreted: executes are recorded in a committed log
/// (buffered until commit inside a transaction) and queries are answered
/// from canned result sets. Used to exercise routing behavior without a
/// real database.
#[derive(Clone)]
pub struct MemoryConnPool {
    name: String,
    state: Arc<Mutex<PoolState>>,
    faults: Arc<FaultInjector>,
}

impl MemoryConnPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(PoolState::default())),
            faults: Arc::new(FaultInjector::new()),
        }
    }

    /// Operation names: "execute", "query", "begin", "tx_execute",
    /// "tx_query", "commit", "rollback".
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Answer `sql` with `rows` from now on.
    pub fn set_result(&self, sql: &str, rows: Vec<Row>) {
        if let Ok(mut state) = self.state.lock() {
            state.results.insert(sql.to_string(), rows);
        }
    }

    /// Statements applied to this store so far.
    pub fn committed(&self) -> Vec<Statement> {
        self.lock().map(|s| s.committed.clone()).unwrap_or_default()
    }

    pub fn open_transactions(&self) -> usize {
        self.lock().map(|s| s.open_transactions).unwrap_or_default()
    }

    pub fn committed_transactions(&self) -> u64 {
        self.lock().map(|s| s.committed_transactions).unwrap_or_default()
    }

    pub fn rolled_back_transactions(&self) -> u64 {
        self.lock()
            .map(|s| s.rolled_back_transactions)
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        lock_state(&self.state)
    }

    fn canned(&self, stmt: &Statement) -> Result<Vec<Row>> {
        Ok(self
            .lock()?
            .results
            .get(&stmt.sql)
            .cloned()
            .unwrap_or_default())
    }
}

fn lock_state(state: &Mutex<PoolState>) -> Result<MutexGuard<'_, PoolState>> {
    state
        .lock()
        .map_err(|e| MigrateError::Store(format!("pool state poisoned: {}", e)))
}

#[async_trait]
impl ConnPool for MemoryConnPool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, stmt: &Statement) -> Result<ExecResult> {
        self.faults.before_call(&self.name, "execute").await?;
        self.lock()?.committed.push(stmt.clone());
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>> {
        self.faults.before_call(&self.name, "query").await?;
        self.canned(stmt)
    }

    async fn begin(&self) -> Result<Box<dyn ConnTx>> {
        self.faults.before_call(&self.name, "begin").await?;
        self.lock()?.open_transactions += 1;
        Ok(Box::new(MemoryTx {
            pool: self.clone(),
            pending: Vec::new(),
            finished: false,
        }))
    }

    fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        Ok(PreparedStatement::new(sql))
    }
}

/// Transaction on a [`MemoryConnPool`]; statements become visible in the
/// committed log only on commit.
pub struct MemoryTx {
    pool: MemoryConnPool,
    pending: Vec<Statement>,
    finished: bool,
}

impl MemoryTx {
    fn finish(&mut self, commit: bool) -> Result<()> {
        let mut state = lock_state(&self.pool.state)?;
        state.open_transactions = state.open_transactions.saturating_sub(1);
        if commit {
            state.committed.append(&mut self.pending);
            state.committed_transactions += 1;
        } else {
            self.pending.clear();
            state.rolled_back_transactions += 1;
        }
        self.finished = true;
        Ok(())
    }
}

#[async_trait]
impl ConnTx for MemoryTx {
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult> {
        self.pool
            .faults
            .before_call(&self.pool.name, "tx_execute")
            .await?;
        self.pending.push(stmt.clone());
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: None,
        })
    }

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>> {
        self.pool
            .faults
            .before_call(&self.pool.name, "tx_query")
            .await?;
        self.pool.canned(stmt)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.pool.faults.before_call(&self.pool.name, "commit").await?;
        self.finish(true)
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.pool
            .faults
            .before_call(&self.pool.name, "rollback")
            .await?;
        self.finish(false)
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        // Abandoned (or failed to commit): behave like a server-side rollback.
        if !self.finished {
            let _ = self.finish(false);
        }
    }
}
