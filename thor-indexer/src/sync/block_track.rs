//! Per-block checkpoint and the published snapshot

use std::sync::Arc;
use tokio::sync::watch;

use crate::core::{Block, BlockLogRow, SnapshotError};
use crate::record::RunningTotals;

/// Identity of a committed block plus the running totals after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTrack {
    pub height: i64,
    /// Nanoseconds since the epoch
    pub timestamp: i64,
    pub hash: Vec<u8>,
    pub agg_track: Arc<RunningTotals>,
}

/// Latest committed state as seen by readers
pub type Snapshot = Arc<BlockTrack>;

impl BlockTrack {
    pub fn new(block: &Block, totals: &RunningTotals) -> Self {
        Self {
            height: block.height,
            timestamp: block.timestamp_nanos(),
            hash: block.hash.clone(),
            agg_track: Arc::new(totals.clone()),
        }
    }

    /// Encoded running totals for `block_log.agg_state`
    pub fn encode_state(&self) -> Result<Vec<u8>, SnapshotError> {
        self.agg_track.encode()
    }

    /// Rebuilds the track from the latest checkpoint row. Undecodable
    /// state is fatal.
    pub fn restore(row: &BlockLogRow) -> Result<Self, SnapshotError> {
        let totals = RunningTotals::decode(&row.agg_state, row.height)?;
        Ok(Self {
            height: row.height,
            timestamp: row.timestamp,
            hash: row.hash.clone(),
            agg_track: Arc::new(totals),
        })
    }
}

pub fn snapshot_channel(
    initial: Option<Snapshot>,
) -> (watch::Sender<Option<Snapshot>>, watch::Receiver<Option<Snapshot>>) {
    watch::channel(initial)
}
