//! Ingestion: checkpoint recovery, the per-block loop and snapshots

pub mod block_track;
pub mod ingest;

use tracing::info;

use crate::core::{Block, IndexerError, StoragePort};
use crate::record::RunningTotals;
pub use block_track::{snapshot_channel, BlockTrack, Snapshot};
pub use ingest::{BlockIngestor, BlockOutcome};

/// One block on its way from acquisition to ingestion
#[derive(Debug, Clone)]
pub struct BlockMessage {
    pub block: Block,
    /// Last block of a fetch batch, a commit boundary
    pub batch_end: bool,
}

/// State the ingestion task resumes from
#[derive(Debug, Default)]
pub struct Recovered {
    pub totals: RunningTotals,
    pub next_height: i64,
    pub track: Option<Snapshot>,
}

/// Restores the running totals from the latest checkpoint, or starts
/// empty at `start_height`
pub async fn recover(store: &dyn StoragePort, start_height: i64) -> Result<Recovered, IndexerError> {
    match store.latest_checkpoint().await? {
        Some(row) => {
            let track = BlockTrack::restore(&row)?;
            info!(height = track.height, "Resuming from checkpoint");
            Ok(Recovered {
                totals: (*track.agg_track).clone(),
                next_height: track.height + 1,
                track: Some(std::sync::Arc::new(track)),
            })
        }
        None => {
            info!(start_height, "No checkpoint, starting fresh");
            Ok(Recovered {
                totals: RunningTotals::new(),
                next_height: start_height,
                track: None,
            })
        }
    }
}
