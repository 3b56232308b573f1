//! Ingestion task
//!
//! Sole consumer of the block queue and sole writer of the running totals
//! and the inserter. Every block writes its `block_log` row; commit
//! boundaries additionally store the encoded totals, flush and publish the
//! new snapshot.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::block_track::{BlockTrack, Snapshot};
use super::{BlockMessage, Recovered};
use crate::aggregates::Trigger;
use crate::core::{Block, IndexerError, Metadata, StoragePort};
use crate::database::{mark_insert_failure, FlushStats, Inserter};
use crate::demux::{Demux, DemuxStats, EventSink, TypedEvent};
use crate::metrics::Metrics;
use crate::record::{DepthRecorder, EventRecorder, RecordStats, RunningTotals};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    pub committed: bool,
    pub demux: DemuxStats,
    pub record: RecordStats,
    pub depth_rows: usize,
    pub flush: Option<FlushStats>,
}

/// Events of one block in emission order
#[derive(Default)]
struct BlockEvents(Vec<(TypedEvent, Metadata)>);

impl EventSink for BlockEvents {
    fn on_event(&mut self, event: &TypedEvent, meta: &Metadata) {
        self.0.push((event.clone(), *meta));
    }
}

pub struct BlockIngestor {
    demux: Demux,
    recorder: EventRecorder,
    depths: DepthRecorder,
    totals: RunningTotals,
    inserter: Box<dyn Inserter>,
    store: Arc<dyn StoragePort>,
    snapshots: watch::Sender<Option<Snapshot>>,
    refresh: Option<Trigger>,
    metrics: Option<Arc<Metrics>>,
    genesis_height: Option<i64>,
    next_height: i64,
    committed_once: bool,
}

impl BlockIngestor {
    pub fn new(
        demux: Demux,
        recorder: EventRecorder,
        inserter: Box<dyn Inserter>,
        store: Arc<dyn StoragePort>,
        recovered: Recovered,
        snapshots: watch::Sender<Option<Snapshot>>,
    ) -> Self {
        Self {
            demux,
            recorder,
            depths: DepthRecorder::new(&recovered.totals),
            totals: recovered.totals,
            inserter,
            store,
            snapshots,
            refresh: None,
            metrics: None,
            genesis_height: None,
            next_height: recovered.next_height,
            committed_once: recovered.track.is_some(),
        }
    }

    /// Fired after every commit to wake the aggregate refresher
    pub fn with_refresh_trigger(mut self, trigger: Trigger) -> Self {
        self.refresh = Some(trigger);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_genesis_height(mut self, height: Option<i64>) -> Self {
        self.genesis_height = height;
        self
    }

    pub fn next_height(&self) -> i64 {
        self.next_height
    }

    pub fn totals(&self) -> &RunningTotals {
        &self.totals
    }

    /// Records one block; commits when `batch_end` is set, on the first
    /// block ever processed and at the genesis height
    pub async fn process(&mut self, block: &Block, batch_end: bool) -> Result<BlockOutcome, IndexerError> {
        if block.height != self.next_height {
            return Err(IndexerError::HeightOutOfOrder {
                expected: self.next_height,
                got: block.height,
            });
        }

        let mut outcome = BlockOutcome::default();
        let mut events = BlockEvents::default();
        outcome.demux = self.demux.process_block(block, &mut events);

        self.inserter.start_block()?;
        for (event, meta) in &events.0 {
            self.recorder
                .record(event, meta, &mut self.totals, self.inserter.as_mut())
                .await?;
        }
        outcome.record = self.recorder.take_stats();
        outcome.depth_rows = self
            .depths
            .record(&self.totals, block.timestamp_nanos(), self.inserter.as_mut())
            .await?;

        let commit = batch_end || !self.committed_once || self.genesis_height == Some(block.height);
        let track = commit.then(|| BlockTrack::new(block, &self.totals));
        let agg_state = match &track {
            Some(track) => Some(track.encode_state()?),
            None => None,
        };
        // a refused ledger row is fatal under either strategy
        let logged = self
            .inserter
            .insert(
                "block_log",
                &["height", "timestamp", "hash", "agg_state"],
                vec![
                    block.height.into(),
                    block.timestamp_nanos().into(),
                    block.hash.clone().into(),
                    agg_state.into(),
                ],
            )
            .await;
        if let Err(e) = logged {
            return Err(self.insert_failed(block.height, e).await);
        }
        self.inserter.end_block()?;

        if let Some(track) = track {
            outcome.flush = Some(self.commit(track).await?);
            outcome.committed = true;
        }

        self.next_height += 1;
        self.observe(block.height, &outcome);
        Ok(outcome)
    }

    async fn commit(&mut self, track: BlockTrack) -> Result<FlushStats, IndexerError> {
        let stats = match self.inserter.flush().await {
            Ok(stats) => stats,
            Err(e) => return Err(self.insert_failed(track.height, e).await),
        };

        debug!(
            height = track.height,
            blocks = stats.blocks,
            rows = stats.rows_written,
            "Committed"
        );
        let height = track.height;
        self.snapshots.send_replace(Some(Arc::new(track)));
        self.committed_once = true;
        if let Some(trigger) = &self.refresh {
            trigger.fire();
        }
        if let Some(metrics) = &self.metrics {
            metrics.flushes.inc();
            metrics.committed_height.set(height);
            metrics.rows_skipped.inc_by(stats.rows_skipped as u64);
        }
        Ok(stats)
    }

    /// Records the durable failure flag so the next start uses the tolerant
    /// strategy
    async fn insert_failed(&mut self, height: i64, e: IndexerError) -> IndexerError {
        error!(height = height, error = %e, "Insert failed, recording failure flag");
        if let Some(metrics) = &self.metrics {
            metrics.flush_failures.inc();
        }
        if let Err(mark) = mark_insert_failure(self.store.as_ref(), &e.to_string()).await {
            error!(error = %mark, "Could not record the insert failure flag");
        }
        e
    }

    fn observe(&self, height: i64, outcome: &BlockOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.blocks_ingested.inc();
            metrics.ingested_height.set(height);
            metrics.events_recorded.inc_by(outcome.record.recorded);
            metrics.rows_refused.inc_by(outcome.record.rejected);
            metrics.observe_demux(&outcome.demux);
        }
    }

    /// Consumes the block queue until it closes or `cancel` fires. Blocks
    /// buffered since the last commit are dropped on the way out.
    pub async fn run(
        mut self,
        mut blocks: mpsc::Receiver<BlockMessage>,
        cancel: CancellationToken,
    ) -> Result<(), IndexerError> {
        info!(
            next_height = self.next_height,
            strategy = %self.inserter.strategy(),
            "Ingestion started"
        );
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                message = blocks.recv() => message,
            };
            let Some(message) = message else { break };
            self.process(&message.block, message.batch_end).await?;
        }
        let dropped = self.inserter.pending_rows();
        self.inserter.discard();
        info!(
            next_height = self.next_height,
            dropped_rows = dropped,
            "Ingestion stopped"
        );
        Ok(())
    }
}
