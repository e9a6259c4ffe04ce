// ============================================================================
// RustMigrator Library
// ============================================================================
//
// Control plane for moving a table from one relational store (src) to
// another (dst) while both are live:
//
// - `routing`: a connection pool that sends traffic to src, dst or both
//   according to the active routing policy
// - `validator`: full and per-row consistency checks between the stores
// - `events`: the inconsistency event channel and the fixer that consumes it
// - `scheduler`: the single authority over policy and validation jobs
// - `web`: HTTP control surface for the scheduler

pub mod config;
pub mod core;
pub mod events;
pub mod routing;
pub mod scheduler;
pub mod store;
pub mod validator;
pub mod web;

pub use config::MigratorConfig;
pub use core::{Entity, MigrateError, Result, Value};
pub use events::{
    BrokerProducer, Direction, FixConsumer, InconsistencyKind, InconsistentEvent, MemoryBroker,
    OverrideFixer, RowChangeEvent,
};
pub use routing::{PolicyCell, RoutingPolicy, RoutingPool, RoutingStats, Side};
pub use scheduler::{JobKind, JobStatus, Scheduler, SchedulerStatus, ValidationJob};
pub use store::{ConnPool, ConnTx, EntityStore, MemoryConnPool, MemoryStore, Statement};
pub use validator::{IncrementalValidator, RowChangeListener, ScanMode, Validator};
