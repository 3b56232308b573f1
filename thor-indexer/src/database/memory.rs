//! In-memory store
//!
//! Implements both storage ports without a database. Used by the tests and
//! by `--dry-run`. Tables can be told to reject rows to exercise the
//! failure paths of the inserters.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::row::{Row, SqlValue};
use crate::aggregates::views::AggregateView;
use crate::core::{AggregatePort, BlockLogRow, StorageError, StoragePort, WriteSession};

/// One `refresh_view` call as seen by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshCall {
    pub view: String,
    pub from: i64,
    pub to: i64,
    pub watermark: i64,
}

#[derive(Default)]
struct Inner {
    rows: Vec<Row>,
    constants: BTreeMap<String, String>,
    watermarks: HashMap<String, i64>,
    refreshes: Vec<RefreshCall>,
    rejected_tables: HashSet<String>,
    fail_writes: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row written to `table` from now on is rejected
    pub async fn reject_table(&self, table: &str) {
        self.inner.lock().await.rejected_tables.insert(table.to_string());
    }

    /// Makes every write fail as if the database were unreachable
    pub async fn fail_writes(&self, fail: bool) {
        self.inner.lock().await.fail_writes = fail;
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.inner
            .lock()
            .await
            .rows
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    /// Heights of every `block_log` row, in write order
    pub async fn block_heights(&self) -> Vec<i64> {
        self.rows("block_log")
            .await
            .iter()
            .filter_map(|r| r.get("height").and_then(SqlValue::as_i64))
            .collect()
    }

    pub async fn refreshes(&self) -> Vec<RefreshCall> {
        self.inner.lock().await.refreshes.clone()
    }

    pub async fn set_watermark(&self, view: &str, watermark: i64) {
        self.inner
            .lock()
            .await
            .watermarks
            .insert(view.to_string(), watermark);
    }
}

fn rejection(row: &Row) -> StorageError {
    StorageError::RowRejected {
        table: row.table.to_string(),
        reason: "table rejects writes".to_string(),
    }
}

fn check_writable(inner: &Inner, rows: &[Row]) -> Result<(), StorageError> {
    if inner.fail_writes {
        return Err(StorageError::Database("write failure".to_string()));
    }
    match rows.iter().find(|r| inner.rejected_tables.contains(r.table)) {
        Some(row) => Err(rejection(row)),
        None => Ok(()),
    }
}

/// Rows staged by the tolerant strategy, published on commit
pub struct MemorySession {
    inner: Arc<Mutex<Inner>>,
    staged: Vec<Row>,
}

#[async_trait]
impl WriteSession for MemorySession {
    async fn write_group(&mut self, rows: &[Row]) -> Result<(), StorageError> {
        check_writable(&*self.inner.lock().await, rows)?;
        self.staged.extend_from_slice(rows);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemorySession { inner: shared, staged } = *self;
        let mut inner = shared.lock().await;
        if inner.fail_writes {
            return Err(StorageError::Database("write failure".to_string()));
        }
        inner.rows.extend(staged);
        Ok(())
    }
}

#[async_trait]
impl StoragePort for MemoryStore {
    async fn write_rows(&self, rows: &[Row]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        check_writable(&inner, rows)?;
        inner.rows.extend_from_slice(rows);
        Ok(())
    }

    async fn begin_session(&self) -> Result<Box<dyn WriteSession>, StorageError> {
        if self.inner.lock().await.fail_writes {
            return Err(StorageError::Database("write failure".to_string()));
        }
        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            staged: Vec::new(),
        }))
    }

    async fn get_constant(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().await.constants.get(key).cloned())
    }

    async fn set_constant(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner
            .lock()
            .await
            .constants
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_constant(&self, key: &str) -> Result<(), StorageError> {
        self.inner.lock().await.constants.remove(key);
        Ok(())
    }

    async fn latest_checkpoint(&self) -> Result<Option<BlockLogRow>, StorageError> {
        let inner = self.inner.lock().await;
        let latest = inner
            .rows
            .iter()
            .filter(|r| r.table == "block_log")
            .filter_map(|r| {
                Some(BlockLogRow {
                    height: r.get("height")?.as_i64()?,
                    timestamp: r.get("timestamp")?.as_i64()?,
                    hash: r.get("hash")?.as_bytes()?.to_vec(),
                    agg_state: r.get("agg_state")?.as_bytes()?.to_vec(),
                })
            })
            .max_by_key(|row| row.height);
        Ok(latest)
    }
}

#[async_trait]
impl AggregatePort for MemoryStore {
    async fn watermark(&self, view: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.inner.lock().await.watermarks.get(view).copied())
    }

    async fn earliest_block_timestamp(&self) -> Result<Option<i64>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .iter()
            .filter(|r| r.table == "block_log")
            .filter_map(|r| r.get("timestamp").and_then(SqlValue::as_i64))
            .min())
    }

    async fn refresh_view(
        &self,
        view: &AggregateView,
        from: i64,
        to: i64,
        watermark: i64,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_writes {
            return Err(StorageError::Database("write failure".to_string()));
        }
        let name = view.name();
        inner.refreshes.push(RefreshCall {
            view: name.clone(),
            from,
            to,
            watermark,
        });
        let current = inner.watermarks.entry(name).or_insert(watermark);
        *current = (*current).max(watermark);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregates::views::{Bucket, Metric};
    use crate::database::schema::validate_row;

    fn node_row(addr: &str) -> Row {
        validate_row(
            "new_node_events",
            &["node_addr", "event_id", "block_timestamp"],
            vec![addr.into(), 1i64.into(), 1i64.into()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn session_rows_appear_only_on_commit() {
        let store = MemoryStore::new();
        let mut session = store.begin_session().await.unwrap();
        session.write_group(&[node_row("a")]).await.unwrap();
        assert!(store.rows("new_node_events").await.is_empty());
        session.commit().await.unwrap();
        assert_eq!(store.rows("new_node_events").await.len(), 1);

        let mut dropped = store.begin_session().await.unwrap();
        dropped.write_group(&[node_row("b")]).await.unwrap();
        drop(dropped);
        assert_eq!(store.rows("new_node_events").await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_group_stages_nothing() {
        let store = MemoryStore::new();
        store.reject_table("pool_events").await;
        let pool_row = validate_row(
            "pool_events",
            &["asset", "status", "event_id", "block_timestamp"],
            vec!["BTC.BTC".into(), "Available".into(), 2i64.into(), 1i64.into()],
        )
        .unwrap();

        let mut session = store.begin_session().await.unwrap();
        let err = session.write_group(&[node_row("a"), pool_row]).await.unwrap_err();
        assert!(matches!(err, StorageError::RowRejected { .. }));
        session.commit().await.unwrap();
        assert!(store.rows("new_node_events").await.is_empty());
    }

    #[tokio::test]
    async fn watermarks_never_move_backwards() {
        let store = MemoryStore::new();
        let view = AggregateView::new(Metric::Swaps, Bucket::Hour);
        store.refresh_view(&view, 0, 10, 10).await.unwrap();
        store.refresh_view(&view, 0, 5, 5).await.unwrap();
        assert_eq!(store.watermark(&view.name()).await.unwrap(), Some(10));
    }
}
