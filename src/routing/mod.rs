//! Dual-write traffic routing.
//!
//! The active [`RoutingPolicy`] lives in a [`PolicyCell`] shared by reference
//! between the scheduler (the only writer during a migration) and the
//! [`RoutingPool`] (read on every call).

pub mod pool;
pub mod transaction;

use crate::core::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

pub use pool::{RoutingPool, RoutingStats, SecondaryFailure};
pub use transaction::RoutingTx;

/// One of the two stores taking part in the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Src,
    Dst,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::Src => Self::Dst,
            Self::Dst => Self::Src,
        }
    }
}

/// Which store(s) receive reads and writes, and in what order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    #[default]
    SrcOnly,
    DstOnly,
    SrcFirst,
    DstFirst,
}

impl RoutingPolicy {
    pub const ALL: [RoutingPolicy; 4] = [
        RoutingPolicy::SrcOnly,
        RoutingPolicy::DstOnly,
        RoutingPolicy::SrcFirst,
        RoutingPolicy::DstFirst,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SrcOnly => "src_only",
            Self::DstOnly => "dst_only",
            Self::SrcFirst => "src_first",
            Self::DstFirst => "dst_first",
        }
    }

    /// Store that serves reads and takes writes synchronously.
    pub fn primary(self) -> Side {
        match self {
            Self::SrcOnly | Self::SrcFirst => Side::Src,
            Self::DstOnly | Self::DstFirst => Side::Dst,
        }
    }

    /// Store that receives best-effort duplicated writes, if any.
    pub fn secondary(self) -> Option<Side> {
        match self {
            Self::SrcOnly | Self::DstOnly => None,
            Self::SrcFirst => Some(Side::Dst),
            Self::DstFirst => Some(Side::Src),
        }
    }

    pub fn is_dual_write(self) -> bool {
        self.secondary().is_some()
    }

    fn to_raw(self) -> u8 {
        match self {
            Self::SrcOnly => 1,
            Self::DstOnly => 2,
            Self::SrcFirst => 3,
            Self::DstFirst => 4,
        }
    }

    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Self::SrcOnly),
            2 => Ok(Self::DstOnly),
            3 => Ok(Self::SrcFirst),
            4 => Ok(Self::DstFirst),
            other => Err(MigrateError::UnknownPolicy(format!("raw value {}", other))),
        }
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingPolicy {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| MigrateError::UnknownPolicy(s.to_string()))
    }
}

/// Process-wide active policy, read atomically on every routed call.
#[derive(Debug)]
pub struct PolicyCell(AtomicU8);

impl PolicyCell {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self(AtomicU8::new(policy.to_raw()))
    }

    pub fn shared(policy: RoutingPolicy) -> Arc<Self> {
        Arc::new(Self::new(policy))
    }

    pub fn load(&self) -> Result<RoutingPolicy> {
        RoutingPolicy::from_raw(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, policy: RoutingPolicy) {
        self.0.store(policy.to_raw(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn store_raw(&self, raw: u8) {
        self.0.store(raw, Ordering::Release);
    }
}

impl Default for PolicyCell {
    fn default() -> Self {
        Self::new(RoutingPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip_names() {
        for policy in RoutingPolicy::ALL {
            assert_eq!(policy.as_str().parse::<RoutingPolicy>().unwrap(), policy);
        }
        assert!(matches!(
            "both".parse::<RoutingPolicy>(),
            Err(MigrateError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_primary_and_secondary() {
        assert_eq!(RoutingPolicy::SrcFirst.primary(), Side::Src);
        assert_eq!(RoutingPolicy::SrcFirst.secondary(), Some(Side::Dst));
        assert_eq!(RoutingPolicy::DstFirst.primary(), Side::Dst);
        assert_eq!(RoutingPolicy::DstFirst.secondary(), Some(Side::Src));
        assert_eq!(RoutingPolicy::DstOnly.secondary(), None);
        assert!(!RoutingPolicy::SrcOnly.is_dual_write());
    }

    #[test]
    fn test_policy_cell_defaults_to_src_only() {
        let cell = PolicyCell::default();
        assert_eq!(cell.load().unwrap(), RoutingPolicy::SrcOnly);
        cell.store(RoutingPolicy::DstFirst);
        assert_eq!(cell.load().unwrap(), RoutingPolicy::DstFirst);
    }

    #[test]
    fn test_corrupt_cell_reports_unknown_policy() {
        let cell = PolicyCell::default();
        cell.store_raw(42);
        assert!(matches!(cell.load(), Err(MigrateError::UnknownPolicy(_))));
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&RoutingPolicy::DstFirst).unwrap();
        assert_eq!(json, r#""dst_first""#);
    }
}
