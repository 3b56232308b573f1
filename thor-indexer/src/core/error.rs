//! Centralized error types for the indexer

use std::time::Duration;
use thiserror::Error;

/// Main indexer error type
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Insert error: {0}")]
    Insert(#[from] InsertError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Block height out of order: expected {expected}, got {got}")]
    HeightOutOfOrder { expected: i64, got: i64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IndexerError {
    /// A row the schema or the database refused. Only the event that
    /// produced it is lost; ingestion carries on.
    pub fn is_row_refusal(&self) -> bool {
        matches!(
            self,
            IndexerError::Insert(_) | IndexerError::Storage(StorageError::RowRejected { .. })
        )
    }
}

/// Block acquisition errors. All of them are recovered by restarting the
/// acquisition cycle; none is fatal to the process.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("no new blocks available")]
    NoData,

    #[error("height gap: expected {expected}, got {got}")]
    HeightGap { expected: i64, got: i64 },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    pub fn is_no_data(&self) -> bool {
        matches!(self, FetchError::NoData)
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Schema hash mismatch: stored {stored}, expected {expected}")]
    SchemaMismatch { stored: String, expected: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Row rejected by {table}: {reason}")]
    RowRejected { table: String, reason: String },
}

/// Errors raised while handing a row to an inserter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("table {table}: required column {column} not provided")]
    MissingColumn { table: String, column: String },

    #[error("table {table}: {columns} columns but {values} values")]
    ValueCount {
        table: String,
        columns: usize,
        values: usize,
    },

    #[error("table {table}: column {column} expects {expected}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
    },

    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

/// Attribute parsing errors for a single chain event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{kind}: missing attribute {key}")]
    MissingAttribute { kind: String, key: String },

    #[error("{kind}: attribute {key}={value:?} is not an integer")]
    InvalidInteger {
        kind: String,
        key: String,
        value: String,
    },

    #[error("{kind}: attribute {key}={value:?} is not a coin")]
    InvalidCoin {
        kind: String,
        key: String,
        value: String,
    },

    #[error("{kind}: attribute {key} could not be decoded: {reason}")]
    Encoding {
        kind: String,
        key: String,
        reason: String,
    },

    #[error("{kind}: {reason}")]
    Invalid { kind: String, reason: String },
}

/// Running-totals snapshot errors. Decoding failures are fatal.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("corrupt snapshot at height {height}: {reason}")]
    Corrupt { height: i64, reason: String },

    #[error("snapshot encoding failed: {0}")]
    Encode(String),
}

/// Result type alias for indexer operations
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Helper to convert sqlx errors
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(err: sqlx::Error) -> Self {
        IndexerError::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Archive(err.to_string())
    }
}
