pub mod deadline;
pub mod entity;
pub mod error;
pub mod value;

pub use deadline::{sleep_or_cancel, with_deadline};
pub use entity::Entity;
pub use error::{MigrateError, Result};
pub use value::Value;
