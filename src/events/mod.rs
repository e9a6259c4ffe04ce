//! Inconsistency event channel and the asynchronous repair pipeline.

pub mod broker;
pub mod fixer;
pub mod handler;
pub mod memory_broker;
pub mod producer;

use crate::core::Result;
use crate::routing::Side;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use broker::{Broker, Delivery, Subscription};
pub use fixer::{FixConsumer, OverrideFixer};
pub use handler::{ConsumeOptions, ConsumerHandle, MessageHandler, consume};
pub use memory_broker::MemoryBroker;
pub use producer::{BrokerProducer, Producer};

/// Which store was authoritative when a mismatch was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Src,
    Dst,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Src => "SRC",
            Self::Dst => "DST",
        }
    }
}

impl From<Side> for Direction {
    fn from(side: Side) -> Self {
        match side {
            Side::Src => Self::Src,
            Side::Dst => Self::Dst,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    /// Base row has no counterpart on the target.
    TargetMissing,
    /// Target row has no counterpart on the base.
    BaseMissing,
    /// Both rows exist but differ.
    Neq,
}

impl InconsistencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TargetMissing => "target_missing",
            Self::BaseMissing => "base_missing",
            Self::Neq => "neq",
        }
    }
}

impl fmt::Display for InconsistencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected mismatch, published for asynchronous repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InconsistentEvent {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Direction")]
    pub direction: Direction,
    #[serde(rename = "Type")]
    pub kind: InconsistencyKind,
}

impl InconsistentEvent {
    pub fn new(id: i64, direction: Direction, kind: InconsistencyKind) -> Self {
        Self {
            id,
            direction,
            kind,
        }
    }
}

/// Change-stream notification that a row was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    pub id: i64,
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let evt = InconsistentEvent::new(42, Direction::Src, InconsistencyKind::TargetMissing);
        let json = String::from_utf8(encode(&evt).unwrap()).unwrap();
        assert_eq!(json, r#"{"ID":42,"Direction":"SRC","Type":"target_missing"}"#);
    }

    #[test]
    fn test_decode_rejects_unknown_direction() {
        let payload = br#"{"ID":1,"Direction":"BOTH","Type":"neq"}"#;
        assert!(decode::<InconsistentEvent>(payload).is_err());

        let ok = br#"{"ID":1,"Direction":"DST","Type":"base_missing"}"#;
        let evt: InconsistentEvent = decode(ok).unwrap();
        assert_eq!(evt.direction, Direction::Dst);
        assert_eq!(evt.kind, InconsistencyKind::BaseMissing);
    }

    #[test]
    fn test_direction_from_side() {
        assert_eq!(Direction::from(Side::Src), Direction::Src);
        assert_eq!(Direction::from(Side::Dst).to_string(), "DST");
    }
}
