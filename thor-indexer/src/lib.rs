//! THORChain Indexer Library
//!
//! Follows a Tendermint chain block by block, turns its events into typed
//! rows and pool depths in Postgres, and keeps time-bucketed rollups of
//! them up to date.

pub mod aggregates;
pub mod chain;
pub mod config;
pub mod core;
pub mod database;
pub mod demux;
pub mod metrics;
pub mod record;
pub mod sync;

// Re-export commonly used types
pub use config::IndexerConfig;
pub use crate::core::{Block, EventId, IndexerError, Phase};
