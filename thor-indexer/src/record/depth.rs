//! One `block_pool_depths` row per pool whose depths changed in a block

use std::collections::BTreeMap;
use tracing::warn;

use super::running_totals::{PoolDepths, RunningTotals};
use crate::core::IndexerError;
use crate::database::Inserter;

#[derive(Debug, Default)]
pub struct DepthRecorder {
    last: BTreeMap<String, PoolDepths>,
}

impl DepthRecorder {
    /// Starts from the depths already persisted, typically the restored
    /// snapshot
    pub fn new(persisted: &RunningTotals) -> Self {
        let last = persisted
            .pools()
            .into_iter()
            .map(|pool| (pool.to_string(), persisted.get(pool)))
            .collect();
        Self { last }
    }

    /// Writes a row for every pool that differs from its last recorded
    /// depths. Returns the number of rows written; a refused row keeps its
    /// pool pending for the next block.
    pub async fn record(
        &mut self,
        totals: &RunningTotals,
        block_timestamp: i64,
        inserter: &mut dyn Inserter,
    ) -> Result<usize, IndexerError> {
        let mut written = 0;
        for pool in totals.pools() {
            let current = totals.get(pool);
            let previous = self.last.get(pool).copied().unwrap_or_default();
            if current == previous {
                continue;
            }
            let result = inserter
                .insert(
                    "block_pool_depths",
                    &["pool", "asset_e8", "rune_e8", "synth_e8", "block_timestamp"],
                    vec![
                        pool.into(),
                        current.asset_e8.into(),
                        current.rune_e8.into(),
                        current.synth_e8.into(),
                        block_timestamp.into(),
                    ],
                )
                .await;
            match result {
                Ok(()) => {
                    self.last.insert(pool.to_string(), current);
                    written += 1;
                }
                Err(e) if e.is_row_refusal() => warn!(pool = pool, error = %e, "Depth row refused"),
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{BatchInserter, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn only_changed_pools_get_rows() {
        let mut inserter = BatchInserter::new(Arc::new(MemoryStore::new()));
        let mut totals = RunningTotals::new();
        totals.add_asset("A", 1);
        totals.add_asset("B", 1);
        let mut depths = DepthRecorder::new(&RunningTotals::new());

        inserter.start_block().unwrap();
        assert_eq!(depths.record(&totals, 1, &mut inserter).await.unwrap(), 2);
        inserter.end_block().unwrap();

        inserter.start_block().unwrap();
        totals.add_rune("B", 5);
        assert_eq!(depths.record(&totals, 2, &mut inserter).await.unwrap(), 1);
        assert_eq!(depths.record(&totals, 2, &mut inserter).await.unwrap(), 0);
        inserter.end_block().unwrap();
        assert_eq!(inserter.pending_rows(), 3);
    }

    #[tokio::test]
    async fn restored_totals_are_not_rewritten() {
        let mut totals = RunningTotals::new();
        totals.add_asset("A", 1);
        let mut depths = DepthRecorder::new(&totals);
        let mut inserter = BatchInserter::new(Arc::new(MemoryStore::new()));
        inserter.start_block().unwrap();
        assert_eq!(depths.record(&totals, 1, &mut inserter).await.unwrap(), 0);
    }
}
