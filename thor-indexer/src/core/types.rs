//! Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One block as delivered by the chain, already split into its three
/// event phases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub height: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "hex_bytes")]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub begin_events: Vec<RawEvent>,
    #[serde(default)]
    pub txs: Vec<TxResult>,
    #[serde(default)]
    pub end_events: Vec<RawEvent>,
}

impl Block {
    /// Block time as nanoseconds since the epoch, the unit used by every
    /// `block_timestamp` column.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode_upper(&self.hash)
    }
}

/// Result of delivering one transaction. A non-zero code means the
/// transaction failed on chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

impl TxResult {
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// ABCI event exactly as emitted by the chain
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl RawEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute {
            key: key.into(),
            value: value.into(),
        });
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attribute {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Position of an event within its block
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Begin = 0,
    Tx = 1,
    End = 2,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Begin => write!(f, "begin"),
            Phase::Tx => write!(f, "tx"),
            Phase::End => write!(f, "end"),
        }
    }
}

/// Globally ordered event key. The derived ordering (height, phase, index)
/// matches the ordering of the encoded integer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId {
    pub block_height: i64,
    pub phase: Phase,
    pub index: u32,
}

impl EventId {
    const HEIGHT_SPAN: i64 = 1_000_000_000;
    const PHASE_SPAN: i64 = 100_000_000;

    /// Largest index representable inside one phase
    pub const MAX_INDEX: u32 = (Self::PHASE_SPAN - 1) as u32;

    pub fn new(block_height: i64, phase: Phase, index: u32) -> Self {
        Self {
            block_height,
            phase,
            index,
        }
    }

    /// Encoded form stored in the `event_id` column
    pub fn as_i64(&self) -> i64 {
        self.block_height * Self::HEIGHT_SPAN
            + self.phase as i64 * Self::PHASE_SPAN
            + i64::from(self.index)
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        let block_height = value.div_euclid(Self::HEIGHT_SPAN);
        let rest = value.rem_euclid(Self::HEIGHT_SPAN);
        let phase = match rest / Self::PHASE_SPAN {
            0 => Phase::Begin,
            1 => Phase::Tx,
            2 => Phase::End,
            _ => return None,
        };
        let index = u32::try_from(rest % Self::PHASE_SPAN).ok()?;
        Some(Self::new(block_height, phase, index))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Context attached to every recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub block_height: i64,
    /// Nanoseconds since the epoch
    pub block_timestamp: i64,
    pub event_id: EventId,
}

impl Metadata {
    pub fn new(block_height: i64, block_timestamp: i64, phase: Phase, index: u32) -> Self {
        Self {
            block_height,
            block_timestamp,
            event_id: EventId::new(block_height, phase, index),
        }
    }
}

/// Hex (de)serialization for hashes in archived blocks
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_encoding_preserves_order() {
        let ids = [
            EventId::new(7, Phase::Begin, 0),
            EventId::new(7, Phase::Begin, 3),
            EventId::new(7, Phase::Tx, 0),
            EventId::new(7, Phase::Tx, 120),
            EventId::new(7, Phase::End, 0),
            EventId::new(8, Phase::Begin, 0),
        ];
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].as_i64() < pair[1].as_i64());
        }
        for id in ids {
            assert_eq!(EventId::from_i64(id.as_i64()), Some(id));
        }
    }

    #[test]
    fn block_json_keeps_hash_as_hex() {
        let block = Block {
            height: 12,
            timestamp: DateTime::from_timestamp(1_650_000_000, 5).unwrap(),
            hash: vec![0xAB, 0x01],
            begin_events: vec![RawEvent::new("pool").with("pool", "BTC.BTC")],
            txs: vec![TxResult::default()],
            end_events: vec![],
        };
        let json = serde_json::to_string(&block).unwrap();
        assert!(json.contains("\"AB01\""));
        let back: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
        assert_eq!(back.timestamp_nanos(), 1_650_000_000_000_000_005);
    }
}
