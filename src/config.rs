use crate::core::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Migration control-plane configuration
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Page size for both scan directions
    pub batch_size: usize,

    /// Deadline applied to every single store or broker call
    #[serde(with = "duration_ms", rename = "call_timeout_ms")]
    pub call_timeout: Duration,

    /// Deadline applied to each consumed repair message
    #[serde(with = "duration_ms", rename = "fix_timeout_ms")]
    pub fix_timeout: Duration,

    /// Topic carrying inconsistency events
    pub inconsistency_topic: String,

    /// Topic carrying row-changed notifications
    pub change_topic: String,

    /// Consumer group of the fixer
    pub fix_consumer_group: String,

    /// Consumer group of the change-stream validator
    pub change_consumer_group: String,

    /// Consecutive failed pages after which a scan direction gives up
    pub max_consecutive_failures: usize,

    /// Pause before an unacknowledged message is redelivered
    #[serde(with = "duration_ms", rename = "redelivery_backoff_ms")]
    pub redelivery_backoff: Duration,

    /// Whether a replacement job waits for its predecessor to finish
    pub await_previous_job: bool,
}

impl MigratorConfig {
    pub fn new() -> Self {
        Self {
            batch_size: 100,
            call_timeout: Duration::from_secs(1),
            fix_timeout: Duration::from_secs(1),
            inconsistency_topic: "migrator_inconsistent".to_string(),
            change_topic: "migrator_row_changed".to_string(),
            fix_consumer_group: "migrator-fix".to_string(),
            change_consumer_group: "migrator-change".to_string(),
            max_consecutive_failures: 3,
            redelivery_backoff: Duration::from_millis(100),
            await_previous_job: true,
        }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn fix_timeout(mut self, timeout: Duration) -> Self {
        self.fix_timeout = timeout;
        self
    }

    pub fn inconsistency_topic(mut self, topic: &str) -> Self {
        self.inconsistency_topic = topic.to_string();
        self
    }

    pub fn change_topic(mut self, topic: &str) -> Self {
        self.change_topic = topic.to_string();
        self
    }

    pub fn fix_consumer_group(mut self, group: &str) -> Self {
        self.fix_consumer_group = group.to_string();
        self
    }

    pub fn change_consumer_group(mut self, group: &str) -> Self {
        self.change_consumer_group = group.to_string();
        self
    }

    pub fn max_consecutive_failures(mut self, max: usize) -> Self {
        self.max_consecutive_failures = max;
        self
    }

    pub fn redelivery_backoff(mut self, backoff: Duration) -> Self {
        self.redelivery_backoff = backoff;
        self
    }

    pub fn await_previous_job(mut self, wait: bool) -> Self {
        self.await_previous_job = wait;
        self
    }

    /// Load a JSON configuration file; absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::Config(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| MigrateError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MigrateError::Config("batch_size must be > 0".to_string()));
        }
        if self.call_timeout.is_zero() {
            return Err(MigrateError::Config("call_timeout must be > 0".to_string()));
        }
        if self.fix_timeout.is_zero() {
            return Err(MigrateError::Config("fix_timeout must be > 0".to_string()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(MigrateError::Config(
                "max_consecutive_failures must be > 0".to_string(),
            ));
        }
        for (name, value) in [
            ("inconsistency_topic", &self.inconsistency_topic),
            ("change_topic", &self.change_topic),
            ("fix_consumer_group", &self.fix_consumer_group),
            ("change_consumer_group", &self.change_consumer_group),
        ] {
            if value.trim().is_empty() {
                return Err(MigrateError::Config(format!("{} cannot be empty", name)));
            }
        }
        Ok(())
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = MigratorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.call_timeout, Duration::from_secs(1));
        assert_eq!(config.fix_consumer_group, "migrator-fix");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = MigratorConfig::new()
            .batch_size(10)
            .call_timeout(Duration::from_millis(250))
            .inconsistency_topic("orders_inconsistent")
            .await_previous_job(false);

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.inconsistency_topic, "orders_inconsistent");
        assert!(!config.await_previous_job);
    }

    #[test]
    fn test_validate() {
        assert!(MigratorConfig::new().batch_size(0).validate().is_err());
        assert!(MigratorConfig::new().call_timeout(Duration::ZERO).validate().is_err());
        assert!(MigratorConfig::new().change_topic("  ").validate().is_err());
        assert!(MigratorConfig::new().max_consecutive_failures(0).validate().is_err());
    }

    #[test]
    fn test_from_json_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"batch_size": 25, "call_timeout_ms": 500}}"#).unwrap();

        let config = MigratorConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.call_timeout, Duration::from_millis(500));
        assert_eq!(config.fix_timeout, Duration::from_secs(1));
        assert_eq!(config.inconsistency_topic, "migrator_inconsistent");
    }

    #[test]
    fn test_from_json_file_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"batch_size": 0}}"#).unwrap();
        assert!(matches!(
            MigratorConfig::from_json_file(file.path()),
            Err(MigrateError::Config(_))
        ));
    }
}
