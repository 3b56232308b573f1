//! Authoritative per-pool balances

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

use crate::core::SnapshotError;

const SNAPSHOT_VERSION: u8 = 1;

/// Depths of one pool at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDepths {
    pub asset_e8: i64,
    pub rune_e8: i64,
    pub synth_e8: i64,
}

/// Cumulative effect of every recorded event on each pool since genesis.
///
/// Only the recorder mutates it; everybody else reads cloned snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTotals {
    asset_e8: BTreeMap<String, i64>,
    rune_e8: BTreeMap<String, i64>,
    synth_e8: BTreeMap<String, i64>,
    /// Deltas refused because they would overflow; not part of the snapshot
    #[serde(skip)]
    overflows: u64,
}

impl RunningTotals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_asset(&mut self, pool: &str, delta: i64) {
        if !add(&mut self.asset_e8, pool, delta) {
            self.overflowed("asset", pool, delta);
        }
    }

    pub fn add_rune(&mut self, pool: &str, delta: i64) {
        if !add(&mut self.rune_e8, pool, delta) {
            self.overflowed("rune", pool, delta);
        }
    }

    pub fn add_synth(&mut self, pool: &str, delta: i64) {
        if !add(&mut self.synth_e8, pool, delta) {
            self.overflowed("synth", pool, delta);
        }
    }

    fn overflowed(&mut self, ledger: &'static str, pool: &str, delta: i64) {
        self.overflows += 1;
        error!(ledger, pool, delta, "Depth overflow, delta not applied");
    }

    /// Deltas dropped since start because they would overflow 64 bits
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Authoritative overwrite, used for suspension and corrections
    pub fn set(&mut self, pool: &str, depths: PoolDepths) {
        self.asset_e8.insert(pool.to_string(), depths.asset_e8);
        self.rune_e8.insert(pool.to_string(), depths.rune_e8);
        self.synth_e8.insert(pool.to_string(), depths.synth_e8);
    }

    pub fn get(&self, pool: &str) -> PoolDepths {
        PoolDepths {
            asset_e8: self.asset_e8.get(pool).copied().unwrap_or(0),
            rune_e8: self.rune_e8.get(pool).copied().unwrap_or(0),
            synth_e8: self.synth_e8.get(pool).copied().unwrap_or(0),
        }
    }

    /// Every pool any ledger has seen, sorted
    pub fn pools(&self) -> Vec<&str> {
        let mut pools: Vec<&str> = self
            .asset_e8
            .keys()
            .chain(self.rune_e8.keys())
            .chain(self.synth_e8.keys())
            .map(String::as_str)
            .collect();
        pools.sort_unstable();
        pools.dedup();
        pools
    }

    pub fn is_empty(&self) -> bool {
        self.asset_e8.is_empty() && self.rune_e8.is_empty() && self.synth_e8.is_empty()
    }

    /// Versioned bincode encoding stored in `block_log.agg_state`
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        let body = bincode::serialize(self).map_err(|e| SnapshotError::Encode(e.to_string()))?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8], height: i64) -> Result<Self, SnapshotError> {
        let corrupt = |reason: String| SnapshotError::Corrupt { height, reason };
        match bytes.split_first() {
            Some((&SNAPSHOT_VERSION, body)) => {
                bincode::deserialize(body).map_err(|e| corrupt(e.to_string()))
            }
            Some((version, _)) => Err(corrupt(format!("unknown snapshot version {}", version))),
            None => Err(corrupt("empty snapshot".to_string())),
        }
    }
}

/// Exact addition; returns false and leaves the ledger alone on overflow
fn add(ledger: &mut BTreeMap<String, i64>, pool: &str, delta: i64) -> bool {
    match ledger.get_mut(pool) {
        Some(value) => match value.checked_add(delta) {
            Some(sum) => {
                *value = sum;
                true
            }
            None => false,
        },
        None => {
            ledger.insert(pool.to_string(), delta);
            true
        }
    }
}
