use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrateError {
    #[error("Unknown routing policy: {0}")]
    UnknownPolicy(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Record not found")]
    RecordNotFound,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job error: {0}")]
    Job(String),
}

impl MigrateError {
    /// True for the errors that mean "the caller asked us to stop" rather
    /// than "something broke".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

pub type Result<T> = std::result::Result<T, MigrateError>;

impl From<serde_json::Error> for MigrateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_class() {
        assert!(MigrateError::Cancelled.is_cancellation());
        assert!(MigrateError::DeadlineExceeded.is_cancellation());
        assert!(!MigrateError::Store("boom".into()).is_cancellation());
        assert!(!MigrateError::RecordNotFound.is_cancellation());
    }

    #[test]
    fn json_errors_become_serialization_errors() {
        let err: MigrateError = serde_json::from_str::<i64>("nope").unwrap_err().into();
        assert!(matches!(err, MigrateError::Serialization(_)));
    }
}
