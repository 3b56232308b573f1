//! Core trait abstractions (Ports in Hexagonal Architecture)

use async_trait::async_trait;

use super::error::{FetchError, StorageError};
use super::types::Block;
use crate::aggregates::views::AggregateView;
use crate::database::row::Row;

/// Chain port - the upstream Tendermint RPC as seen by block acquisition
#[async_trait]
pub trait ChainPort: Send + Sync {
    /// Latest height the node has committed
    async fn latest_height(&self) -> Result<i64, FetchError>;

    /// Fetch the inclusive height range `[from, to]`, ordered by height
    async fn fetch_blocks(&self, from: i64, to: i64) -> Result<Vec<Block>, FetchError>;
}

/// Open transaction of the tolerant strategy. Rows become visible on
/// `commit`; dropping the session rolls all of them back.
#[async_trait]
pub trait WriteSession: Send {
    /// Writes `rows` under one savepoint. When the database rejects any of
    /// them the savepoint is rolled back and `StorageError::RowRejected` is
    /// returned; the session stays usable. Any other error leaves the
    /// session broken.
    async fn write_group(&mut self, rows: &[Row]) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Most recent checkpoint row of the block ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLogRow {
    pub height: i64,
    pub timestamp: i64,
    pub hash: Vec<u8>,
    pub agg_state: Vec<u8>,
}

/// Storage port - durable store used by the ingestion task
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Write all rows in one transaction; any failing row fails the call
    async fn write_rows(&self, rows: &[Row]) -> Result<(), StorageError>;

    /// Open a transaction that rows are written into as they arrive
    async fn begin_session(&self) -> Result<Box<dyn WriteSession>, StorageError>;

    async fn get_constant(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_constant(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn delete_constant(&self, key: &str) -> Result<(), StorageError>;

    /// Latest `block_log` row carrying a running-totals snapshot
    async fn latest_checkpoint(&self) -> Result<Option<BlockLogRow>, StorageError>;
}

/// Aggregate port - rollup maintenance used by the refresher
#[async_trait]
pub trait AggregatePort: Send + Sync {
    async fn watermark(&self, view: &str) -> Result<Option<i64>, StorageError>;

    /// Timestamp of the first block in the ledger, where an empty view
    /// starts aggregating
    async fn earliest_block_timestamp(&self) -> Result<Option<i64>, StorageError>;

    /// Re-aggregate `[from, to)` of one view and move its watermark to
    /// `watermark`, atomically
    async fn refresh_view(
        &self,
        view: &AggregateView,
        from: i64,
        to: i64,
        watermark: i64,
    ) -> Result<(), StorageError>;
}
