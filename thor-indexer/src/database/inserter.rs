//! Per-block row handling and the two flush strategies
//!
//! Callers validate rows against the schema registry and hand over all
//! rows of one event together; an event's rows are accepted or refused as
//! a unit. The batch strategy buffers them until `flush` and writes only
//! completed blocks. The tolerant strategy writes them into an open
//! transaction right away, so a rejection is known before the event's
//! side effects are applied, and commits on `flush`.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::row::{Row, SqlValue};
use super::schema::validate_row;
use crate::core::{IndexerError, InsertError, StorageError, StoragePort, WriteSession};

/// Constants key recording an unrecoverable flush failure
pub const LAST_INSERT_FAILED_KEY: &str = "last_insert_failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStrategy {
    /// Multi-row inserts, one transaction, all or nothing
    Batch,
    /// One savepoint per event, rejected events are skipped
    Tolerant,
}

impl fmt::Display for InsertStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertStrategy::Batch => write!(f, "batch"),
            InsertStrategy::Tolerant => write!(f, "tolerant"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub blocks: usize,
    pub rows_written: usize,
    pub rows_skipped: usize,
}

#[async_trait]
pub trait Inserter: Send {
    fn strategy(&self) -> InsertStrategy;

    fn start_block(&mut self) -> Result<(), InsertError>;

    /// Takes every row of one event. A refusal, reported as an error for
    /// which [`IndexerError::is_row_refusal`] holds, leaves none of them
    /// behind.
    async fn insert_rows(&mut self, rows: Vec<Row>) -> Result<(), IndexerError>;

    /// Validates and inserts a single-row event
    async fn insert(
        &mut self,
        table: &str,
        columns: &[&str],
        values: Vec<SqlValue>,
    ) -> Result<(), IndexerError> {
        let row = validate_row(table, columns, values)?;
        self.insert_rows(vec![row]).await
    }

    fn end_block(&mut self) -> Result<(), InsertError>;

    /// Makes every completed block durable
    async fn flush(&mut self) -> Result<FlushStats, IndexerError>;

    /// Rows not yet durable, including those of an open block
    fn pending_rows(&self) -> usize;

    /// Drops everything not yet durable, used on shutdown
    fn discard(&mut self);
}

/// Tracks the start_block / end_block protocol
#[derive(Debug, Default)]
struct BlockState {
    in_block: bool,
    completed_blocks: usize,
}

impl BlockState {
    fn start(&mut self) -> Result<(), InsertError> {
        if self.in_block {
            return Err(InsertError::Protocol("start_block while a block is open"));
        }
        self.in_block = true;
        Ok(())
    }

    fn require_open(&self) -> Result<(), InsertError> {
        if self.in_block {
            Ok(())
        } else {
            Err(InsertError::Protocol("insert outside of a block"))
        }
    }

    fn end(&mut self) -> Result<(), InsertError> {
        if !self.in_block {
            return Err(InsertError::Protocol("end_block without start_block"));
        }
        self.in_block = false;
        self.completed_blocks += 1;
        Ok(())
    }
}

/// Row buffer of the batch strategy
#[derive(Debug, Default)]
pub struct RowBuffer {
    rows: Vec<Row>,
    /// Rows belonging to completed blocks
    completed: usize,
    state: BlockState,
}

impl RowBuffer {
    pub fn start_block(&mut self) -> Result<(), InsertError> {
        self.state.start()
    }

    pub fn push(&mut self, rows: Vec<Row>) -> Result<(), InsertError> {
        self.state.require_open()?;
        self.rows.extend(rows);
        Ok(())
    }

    pub fn end_block(&mut self) -> Result<(), InsertError> {
        self.state.end()?;
        self.completed = self.rows.len();
        Ok(())
    }

    pub fn completed_rows(&self) -> &[Row] {
        &self.rows[..self.completed]
    }

    pub fn completed_blocks(&self) -> usize {
        self.state.completed_blocks
    }

    /// Forgets the completed rows after a successful write
    pub fn drain_completed(&mut self) {
        self.rows.drain(..self.completed);
        self.completed = 0;
        self.state.completed_blocks = 0;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

pub struct BatchInserter {
    store: Arc<dyn StoragePort>,
    buffer: RowBuffer,
}

impl BatchInserter {
    pub fn new(store: Arc<dyn StoragePort>) -> Self {
        Self {
            store,
            buffer: RowBuffer::default(),
        }
    }
}

#[async_trait]
impl Inserter for BatchInserter {
    fn strategy(&self) -> InsertStrategy {
        InsertStrategy::Batch
    }

    fn start_block(&mut self) -> Result<(), InsertError> {
        self.buffer.start_block()
    }

    async fn insert_rows(&mut self, rows: Vec<Row>) -> Result<(), IndexerError> {
        Ok(self.buffer.push(rows)?)
    }

    fn end_block(&mut self) -> Result<(), InsertError> {
        self.buffer.end_block()
    }

    async fn flush(&mut self) -> Result<FlushStats, IndexerError> {
        let rows = self.buffer.completed_rows();
        let stats = FlushStats {
            blocks: self.buffer.completed_blocks(),
            rows_written: rows.len(),
            rows_skipped: 0,
        };
        if stats.blocks == 0 {
            return Ok(stats);
        }
        self.store.write_rows(rows).await?;
        self.buffer.drain_completed();
        Ok(stats)
    }

    fn pending_rows(&self) -> usize {
        self.buffer.len()
    }

    fn discard(&mut self) {
        self.buffer.clear();
    }
}

pub struct TolerantInserter {
    store: Arc<dyn StoragePort>,
    session: Option<Box<dyn WriteSession>>,
    state: BlockState,
    /// Rows written into the open session
    written: usize,
    skipped: usize,
}

impl TolerantInserter {
    pub fn new(store: Arc<dyn StoragePort>) -> Self {
        Self {
            store,
            session: None,
            state: BlockState::default(),
            written: 0,
            skipped: 0,
        }
    }

    fn reset(&mut self) {
        self.session = None;
        self.written = 0;
        self.skipped = 0;
        self.state.completed_blocks = 0;
    }
}

#[async_trait]
impl Inserter for TolerantInserter {
    fn strategy(&self) -> InsertStrategy {
        InsertStrategy::Tolerant
    }

    fn start_block(&mut self) -> Result<(), InsertError> {
        self.state.start()
    }

    async fn insert_rows(&mut self, rows: Vec<Row>) -> Result<(), IndexerError> {
        self.state.require_open()?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut session = match self.session.take() {
            Some(session) => session,
            None => self.store.begin_session().await?,
        };
        match session.write_group(&rows).await {
            Ok(()) => {
                self.session = Some(session);
                self.written += rows.len();
                Ok(())
            }
            Err(e @ StorageError::RowRejected { .. }) => {
                self.session = Some(session);
                self.skipped += rows.len();
                Err(e.into())
            }
            // the session is unusable, everything since the last commit is lost
            Err(e) => {
                self.reset();
                Err(e.into())
            }
        }
    }

    fn end_block(&mut self) -> Result<(), InsertError> {
        self.state.end()
    }

    async fn flush(&mut self) -> Result<FlushStats, IndexerError> {
        if self.state.in_block {
            return Err(InsertError::Protocol("flush while a block is open").into());
        }
        let stats = FlushStats {
            blocks: self.state.completed_blocks,
            rows_written: self.written,
            rows_skipped: self.skipped,
        };
        let session = self.session.take();
        self.reset();
        if let Some(session) = session {
            session.commit().await?;
        }
        if stats.rows_skipped > 0 {
            warn!(
                skipped = stats.rows_skipped,
                written = stats.rows_written,
                "Rows rejected since the last commit"
            );
        }
        Ok(stats)
    }

    fn pending_rows(&self) -> usize {
        self.written
    }

    fn discard(&mut self) {
        self.reset();
        self.state = BlockState::default();
    }
}

/// Picks the strategy from durable state: a recorded flush failure forces
/// the tolerant strategy until reset
pub async fn select_strategy(store: &dyn StoragePort) -> Result<InsertStrategy, StorageError> {
    match store.get_constant(LAST_INSERT_FAILED_KEY).await? {
        Some(reason) => {
            warn!(
                reason = %reason,
                "Previous run failed to flush, using the tolerant insert strategy"
            );
            Ok(InsertStrategy::Tolerant)
        }
        None => Ok(InsertStrategy::Batch),
    }
}

pub async fn mark_insert_failure(store: &dyn StoragePort, reason: &str) -> Result<(), StorageError> {
    store.set_constant(LAST_INSERT_FAILED_KEY, reason).await
}

pub async fn reset_insert_strategy(store: &dyn StoragePort) -> Result<(), StorageError> {
    store.delete_constant(LAST_INSERT_FAILED_KEY).await?;
    info!("Insert strategy reset to batch");
    Ok(())
}

pub fn new_inserter(strategy: InsertStrategy, store: Arc<dyn StoragePort>) -> Box<dyn Inserter> {
    match strategy {
        InsertStrategy::Batch => Box::new(BatchInserter::new(store)),
        InsertStrategy::Tolerant => Box::new(TolerantInserter::new(store)),
    }
}
