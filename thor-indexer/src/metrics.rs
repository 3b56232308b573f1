//! Prometheus metrics and the `/metrics` endpoint
//!
//! Metrics exported:
//! - `thor_indexer_blocks_ingested_total`
//! - `thor_indexer_events_recorded_total`
//! - `thor_indexer_events_skipped_total` (by reason)
//! - `thor_indexer_rows_refused_total` and `thor_indexer_rows_skipped_total`
//! - `thor_indexer_flushes_total` and `thor_indexer_flush_failures_total`
//! - `thor_indexer_fetch_errors_total`
//! - `thor_indexer_refresh_cycles_total` (by mode)
//! - `thor_indexer_refresh_triggers_dropped_total`
//! - `thor_indexer_notifications_dropped_total`
//! - `thor_indexer_chain_height`, `thor_indexer_ingested_height`,
//!   `thor_indexer_committed_height`

use anyhow::Result;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::demux::DemuxStats;

pub struct Metrics {
    registry: Registry,
    pub blocks_ingested: IntCounter,
    pub events_recorded: IntCounter,
    pub events_skipped: IntCounterVec,
    pub rows_refused: IntCounter,
    pub rows_skipped: IntCounter,
    pub flushes: IntCounter,
    pub flush_failures: IntCounter,
    pub fetch_errors: IntCounter,
    pub refresh_cycles: IntCounterVec,
    pub refresh_triggers_dropped: IntCounter,
    pub notifications_dropped: IntCounter,
    pub chain_height: IntGauge,
    pub ingested_height: IntGauge,
    pub committed_height: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(format!("thor_indexer_{}", name), help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter_vec(registry: &Registry, name: &str, help: &str, label: &str) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(format!("thor_indexer_{}", name), help), &[label])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let gauge = IntGauge::new(format!("thor_indexer_{}", name), help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            blocks_ingested: counter(&registry, "blocks_ingested_total", "Blocks fully processed")?,
            events_recorded: counter(&registry, "events_recorded_total", "Events written and applied")?,
            events_skipped: counter_vec(
                &registry,
                "events_skipped_total",
                "Events skipped before recording",
                "reason",
            )?,
            rows_refused: counter(&registry, "rows_refused_total", "Rows refused by schema validation")?,
            rows_skipped: counter(&registry, "rows_skipped_total", "Rows rejected by the database in tolerant mode")?,
            flushes: counter(&registry, "flushes_total", "Successful flushes")?,
            flush_failures: counter(&registry, "flush_failures_total", "Unrecoverable flush failures")?,
            fetch_errors: counter(&registry, "fetch_errors_total", "Block acquisition errors")?,
            refresh_cycles: counter_vec(&registry, "refresh_cycles_total", "Aggregate refresh cycles", "mode")?,
            refresh_triggers_dropped: counter(
                &registry,
                "refresh_triggers_dropped_total",
                "Refresh triggers coalesced into a pending one",
            )?,
            notifications_dropped: counter(
                &registry,
                "notifications_dropped_total",
                "Caught-up notifications coalesced into a pending one",
            )?,
            chain_height: gauge(&registry, "chain_height", "Latest height reported by the node")?,
            ingested_height: gauge(&registry, "ingested_height", "Last block processed")?,
            committed_height: gauge(&registry, "committed_height", "Last block durably committed")?,
            registry,
        })
    }

    pub fn observe_demux(&self, stats: &DemuxStats) {
        for (reason, count) in [
            ("unknown", stats.unknown),
            ("parse_failed", stats.parse_failed),
            ("discarded", stats.discarded),
        ] {
            if count > 0 {
                self.events_skipped.with_label_values(&[reason]).inc_by(count);
            }
        }
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Result<String, StatusCode> {
    metrics.render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Serves `/metrics` and `/health` until cancelled
pub async fn serve(metrics: Arc<Metrics>, port: u16, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Metrics server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.blocks_ingested.inc();
        metrics.observe_demux(&DemuxStats {
            parse_failed: 2,
            ..Default::default()
        });
        let text = metrics.render().unwrap();
        assert!(text.contains("thor_indexer_blocks_ingested_total 1"));
        assert!(text.contains("reason=\"parse_failed\""));
    }
}
