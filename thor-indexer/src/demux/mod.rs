//! Block demultiplexer
//!
//! Walks the three event phases of a block in order, turns every raw event
//! into a [`TypedEvent`], runs the correction table over it and hands the
//! survivors to an [`EventSink`] together with their [`Metadata`].

pub mod attributes;
pub mod corrections;
pub mod events;
pub mod loader;

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::core::{AssetClassifier, Block, EventId, Metadata, Phase, RawEvent};
use attributes::Attributes;
use corrections::{CorrectionTable, Verdict};
pub use events::TypedEvent;
pub use loader::{swap_pool, SwapDirection};

/// Receiver of demultiplexed events
pub trait EventSink {
    fn on_event(&mut self, event: &TypedEvent, meta: &Metadata);
}

/// Per-block demultiplexing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub delivered: u64,
    pub ignored: u64,
    pub unknown: u64,
    pub parse_failed: u64,
    pub discarded: u64,
    pub injected: u64,
    pub failed_txs: u64,
}

impl DemuxStats {
    pub fn skipped(&self) -> u64 {
        self.unknown + self.parse_failed + self.discarded
    }
}

pub struct Demux {
    classifier: AssetClassifier,
    corrections: CorrectionTable,
    base64_attributes: bool,
    ignored_kinds: HashSet<String>,
}

impl Demux {
    pub fn new(
        classifier: AssetClassifier,
        corrections: CorrectionTable,
        base64_attributes: bool,
        ignored_kinds: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            classifier,
            corrections,
            base64_attributes,
            ignored_kinds: ignored_kinds.into_iter().collect(),
        }
    }

    pub fn classifier(&self) -> &AssetClassifier {
        &self.classifier
    }

    /// Delivers every event of `block` to `sink` in phase order. Within the
    /// tx phase the index runs across all successful transactions. Injected
    /// events follow the end phase's ordinary events.
    pub fn process_block(&self, block: &Block, sink: &mut dyn EventSink) -> DemuxStats {
        let mut stats = DemuxStats::default();
        let timestamp = block.timestamp_nanos();

        for (index, raw) in block.begin_events.iter().enumerate() {
            let meta = Metadata::new(block.height, timestamp, Phase::Begin, index as u32);
            self.process_raw(raw, meta, sink, &mut stats);
        }

        let mut tx_index: u32 = 0;
        for tx in &block.txs {
            if !tx.succeeded() {
                stats.failed_txs += 1;
                continue;
            }
            for raw in &tx.events {
                let meta = Metadata::new(block.height, timestamp, Phase::Tx, tx_index);
                self.process_raw(raw, meta, sink, &mut stats);
                tx_index += 1;
            }
        }

        let mut end_index = block.end_events.len() as u32;
        for (index, raw) in block.end_events.iter().enumerate() {
            let meta = Metadata::new(block.height, timestamp, Phase::End, index as u32);
            self.process_raw(raw, meta, sink, &mut stats);
        }

        for event in self.corrections.injected(block.height) {
            let meta = Metadata::new(block.height, timestamp, Phase::End, end_index);
            end_index += 1;
            debug!(height = block.height, kind = event.kind(), "Injecting synthetic event");
            stats.injected += 1;
            sink.on_event(event, &meta);
        }

        stats
    }

    fn process_raw(
        &self,
        raw: &RawEvent,
        meta: Metadata,
        sink: &mut dyn EventSink,
        stats: &mut DemuxStats,
    ) {
        if meta.event_id.index > EventId::MAX_INDEX {
            warn!(event_id = %meta.event_id, "Event index overflows its phase, skipping");
            stats.parse_failed += 1;
            return;
        }
        if self.ignored_kinds.contains(&raw.kind) {
            stats.ignored += 1;
            return;
        }

        let loaded = Attributes::decode(raw, self.base64_attributes)
            .and_then(|attrs| TypedEvent::load(&attrs, &self.classifier));
        let mut event = match loaded {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(
                    height = meta.block_height,
                    event_id = %meta.event_id,
                    kind = %raw.kind,
                    "Unknown event kind, skipping"
                );
                stats.unknown += 1;
                return;
            }
            Err(e) => {
                warn!(
                    height = meta.block_height,
                    event_id = %meta.event_id,
                    error = %e,
                    "Malformed event, skipping"
                );
                stats.parse_failed += 1;
                return;
            }
        };

        match self.corrections.apply(meta.block_height, &mut event) {
            Verdict::Keep => {
                stats.delivered += 1;
                sink.on_event(&event, &meta);
            }
            Verdict::Discard(reason) => {
                warn!(
                    height = meta.block_height,
                    event_id = %meta.event_id,
                    kind = event.kind(),
                    reason = %reason,
                    "Event discarded"
                );
                stats.discarded += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TxResult;
    use chrono::DateTime;

    #[derive(Default)]
    struct Collect(Vec<(String, EventId)>);

    impl EventSink for Collect {
        fn on_event(&mut self, event: &TypedEvent, meta: &Metadata) {
            self.0.push((event.kind().to_string(), meta.event_id));
        }
    }

    fn pool(status: &str) -> RawEvent {
        RawEvent::new("pool")
            .with("pool", "BTC.BTC")
            .with("pool_status", status)
    }

    fn demux() -> Demux {
        let corrections = CorrectionTable::builder("test", AssetClassifier::default())
            .inject(
                5,
                None,
                TypedEvent::SetMimir(events::SetMimir {
                    key: "K".into(),
                    value: "1".into(),
                }),
            )
            .build();
        Demux::new(
            AssetClassifier::default(),
            corrections,
            false,
            vec!["message".to_string()],
        )
    }

    #[test]
    fn phases_and_indexes() {
        let block = Block {
            height: 5,
            timestamp: DateTime::from_timestamp(1_000, 0).unwrap(),
            hash: vec![1],
            begin_events: vec![pool("Available")],
            txs: vec![
                TxResult {
                    code: 0,
                    events: vec![RawEvent::new("message"), pool("Staged")],
                },
                TxResult {
                    code: 5,
                    events: vec![pool("Suspended")],
                },
                TxResult {
                    code: 0,
                    events: vec![pool("Available")],
                },
            ],
            end_events: vec![RawEvent::new("mystery"), pool("Available")],
        };
        let mut sink = Collect::default();
        let stats = demux().process_block(&block, &mut sink);

        let ids: Vec<EventId> = sink.0.iter().map(|(_, id)| *id).collect();
        assert_eq!(
            ids,
            vec![
                EventId::new(5, Phase::Begin, 0),
                EventId::new(5, Phase::Tx, 1),
                EventId::new(5, Phase::Tx, 2),
                EventId::new(5, Phase::End, 1),
                EventId::new(5, Phase::End, 2),
            ]
        );
        assert_eq!(sink.0.last().map(|(k, _)| k.as_str()), Some("set_mimir"));
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.injected, 1);
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.failed_txs, 1);
    }

    #[test]
    fn malformed_event_does_not_abort_block() {
        let block = Block {
            height: 6,
            timestamp: DateTime::from_timestamp(1_000, 0).unwrap(),
            hash: vec![],
            begin_events: vec![
                RawEvent::new("gas").with("asset", "BTC.BTC").with("asset_amt", "x"),
                pool("Available"),
            ],
            txs: vec![],
            end_events: vec![],
        };
        let mut sink = Collect::default();
        let stats = demux().process_block(&block, &mut sink);
        assert_eq!(stats.parse_failed, 1);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].1, EventId::new(6, Phase::Begin, 1));
    }
}
