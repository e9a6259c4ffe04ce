//! Store collaborator boundary.
//!
//! Two views of a relational store are consumed by the migrator:
//!
//! - [`ConnPool`] / [`ConnTx`]: the statement-level surface application
//!   write paths talk to. The routing pool implements it on top of two
//!   underlying pools.
//! - [`EntityStore`]: the typed CRUD surface validators and fixers use to
//!   page through, look up and repair rows.
//!
//! The in-memory implementations in [`memory`] and [`memory_pool`] back the
//! tests and the demo binary.

pub mod memory;
pub mod memory_pool;

use crate::core::{Entity, MigrateError, Result, Value};
use async_trait::async_trait;
use std::fmt;

pub use memory::MemoryStore;
pub use memory_pool::MemoryConnPool;

pub type Row = Vec<Value>;

/// A parameterized statement as handed to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn bind(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            return f.write_str(&self.sql);
        }
        let args: Vec<String> = self.args.iter().map(ToString::to_string).collect();
        write!(f, "{} [{}]", self.sql, args.join(", "))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Prepared statement handle bound to a single connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    sql: String,
}

impl PreparedStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// Connection-pool surface of a store.
#[async_trait]
pub trait ConnPool: Send + Sync {
    /// Store identity used in logs.
    fn name(&self) -> &str;

    async fn execute(&self, stmt: &Statement) -> Result<ExecResult>;

    async fn query(&self, stmt: &Statement) -> Result<Vec<Row>>;

    /// First row of the result, or `RecordNotFound` if there is none.
    async fn query_row(&self, stmt: &Statement) -> Result<Row> {
        self.query(stmt)
            .await?
            .into_iter()
            .next()
            .ok_or(MigrateError::RecordNotFound)
    }

    async fn begin(&self) -> Result<Box<dyn ConnTx>>;

    fn prepare(&self, sql: &str) -> Result<PreparedStatement>;
}

/// An open transaction on one store.
#[async_trait]
pub trait ConnTx: Send {
    async fn execute(&mut self, stmt: &Statement) -> Result<ExecResult>;

    async fn query(&mut self, stmt: &Statement) -> Result<Vec<Row>>;

    async fn query_row(&mut self, stmt: &Statement) -> Result<Row> {
        self.query(stmt)
            .await?
            .into_iter()
            .next()
            .ok_or(MigrateError::RecordNotFound)
    }

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// `ORDER BY id OFFSET .. LIMIT ..` page request, optionally restricted to
/// rows with `update_time >= updated_since`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub offset: usize,
    pub limit: usize,
    pub updated_since: Option<i64>,
}

impl PageQuery {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            updated_since: None,
        }
    }

    pub fn updated_since(mut self, watermark: i64) -> Self {
        self.updated_since = Some(watermark);
        self
    }
}

/// Typed CRUD surface of a store for one entity type.
#[async_trait]
pub trait EntityStore<T: Entity>: Send + Sync {
    fn name(&self) -> &str;

    async fn find_page(&self, query: PageQuery) -> Result<Vec<T>>;

    /// `WHERE id IN (..)`; missing ids are simply absent from the result.
    async fn find_by_ids(&self, ids: &[i64]) -> Result<Vec<T>>;

    /// Id-only projection of `find_by_ids`.
    async fn find_ids(&self, ids: &[i64]) -> Result<Vec<i64>>;

    /// `RecordNotFound` if the id does not exist.
    async fn first(&self, id: i64) -> Result<T>;

    async fn count(&self, updated_since: Option<i64>) -> Result<u64>;

    /// Insert or overwrite every field of the row with the same id.
    async fn upsert(&self, entity: &T) -> Result<()>;

    /// Returns the number of deleted rows (0 or 1).
    async fn delete(&self, id: i64) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_display_includes_args() {
        let stmt = Statement::new("UPDATE accounts SET balance = ? WHERE id = ?")
            .bind(10i64)
            .bind(3i64);
        assert_eq!(
            stmt.to_string(),
            "UPDATE accounts SET balance = ? WHERE id = ? [10, 3]"
        );
        assert_eq!(Statement::new("SELECT 1").to_string(), "SELECT 1");
    }

    #[test]
    fn page_query_builder() {
        let q = PageQuery::new(200, 100).updated_since(42);
        assert_eq!(q.offset, 200);
        assert_eq!(q.limit, 100);
        assert_eq!(q.updated_since, Some(42));
    }
}
