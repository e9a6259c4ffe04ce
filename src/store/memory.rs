use super::{EntityStore, PageQuery};
use crate::core::{Entity, MigrateError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

/// Failure and latency injection shared by the in-memory collaborators.
#[derive(Debug, Default)]
pub struct FaultInjector {
    /// Remaining forced failures per operation name ("*" matches any).
    failures: Mutex<HashMap<String, usize>>,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls of any operation.
    pub fn fail_next(&self, n: usize) {
        self.fail_next_op("*", n);
    }

    /// Fail the next `n` calls of operation `op` (e.g. "find_page").
    pub fn fail_next_op(&self, op: &str, n: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(op.to_string(), n);
        }
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of calls observed so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn before_call(&self, target: &str, op: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self.take_failure(op) {
            return Err(MigrateError::Store(format!(
                "injected failure: {} on {}",
                op, target
            )));
        }
        Ok(())
    }

    fn take_failure(&self, op: &str) -> bool {
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        for key in [op, "*"] {
            if let Some(remaining) = failures.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return true;
                }
            }
        }
        false
    }
}

/// In-memory table of entities keyed by id.
pub struct MemoryStore<T> {
    name: String,
    rows: Arc<RwLock<BTreeMap<i64, T>>>,
    faults: Arc<FaultInjector>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            rows: Arc::clone(&self.rows),
            faults: Arc::clone(&self.faults),
        }
    }
}

impl<T: Entity> MemoryStore<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: Arc::new(RwLock::new(BTreeMap::new())),
            faults: Arc::new(FaultInjector::new()),
        }
    }

    /// Create a store pre-populated with `rows`.
    pub async fn with_rows(name: impl Into<String>, rows: impl IntoIterator<Item = T>) -> Self {
        let store = Self::new(name);
        store.insert_all(rows).await;
        store
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Seed rows directly, bypassing fault injection.
    pub async fn insert_all(&self, rows: impl IntoIterator<Item = T>) {
        let mut table = self.rows.write().await;
        for row in rows {
            table.insert(row.id(), row);
        }
    }

    pub async fn get(&self, id: i64) -> Option<T> {
        self.rows.read().await.get(&id).cloned()
    }

    /// All rows ordered by id.
    pub async fn snapshot(&self) -> Vec<T> {
        self.rows.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl<T: Entity> EntityStore<T> for MemoryStore<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find_page(&self, query: PageQuery) -> Result<Vec<T>> {
        self.faults.before_call(&self.name, "find_page").await?;
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|row| {
                query
                    .updated_since
                    .is_none_or(|watermark| row.update_time() >= watermark)
            })
            .skip(query.offset)
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<T>> {
        self.faults.before_call(&self.name, "find_by_ids").await?;
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|row| wanted.contains(&row.id()))
            .cloned()
            .collect())
    }

    async fn find_ids(&self, ids: &[i64]) -> Result<Vec<i64>> {
        self.faults.before_call(&self.name, "find_ids").await?;
        let wanted: HashSet<i64> = ids.iter().copied().collect();
        let rows = self.rows.read().await;
        Ok(rows.keys().copied().filter(|id| wanted.contains(id)).collect())
    }

    async fn first(&self, id: i64) -> Result<T> {
        self.faults.before_call(&self.name, "first").await?;
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(MigrateError::RecordNotFound)
    }

    async fn count(&self, updated_since: Option<i64>) -> Result<u64> {
        self.faults.before_call(&self.name, "count").await?;
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|row| updated_since.is_none_or(|watermark| row.update_time() >= watermark))
            .count() as u64)
    }

    async fn upsert(&self, entity: &T) -> Result<()> {
        self.faults.before_call(&self.name, "upsert").await?;
        self.rows.write().await.insert(entity.id(), entity.clone());
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<u64> {
        self.faults.before_call(&self.name, "delete").await?;
        Ok(self.rows.write().await.remove(&id).map_or(0, |_| 1))
    }
}
