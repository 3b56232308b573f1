//! Block acquisition task: drives a `BlockSource` into the block queue

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::archive::ArchiveWriter;
use super::source::{BlockSource, Origin};
use crate::config::ChainConfig;
use crate::core::FetchError;
use crate::metrics::Metrics;
use crate::sync::BlockMessage;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

pub struct BlockFetcher {
    source: BlockSource,
    backoff: Backoff,
    poll_interval: Duration,
    writer: Option<ArchiveWriter>,
    metrics: Option<Arc<Metrics>>,
}

impl BlockFetcher {
    pub fn new(source: BlockSource, config: &ChainConfig) -> Self {
        Self {
            source,
            backoff: Backoff::new(
                Duration::from_millis(config.backoff_initial_ms),
                Duration::from_millis(config.backoff_max_ms),
            ),
            poll_interval: config.poll_interval(),
            writer: None,
            metrics: None,
        }
    }

    /// Appends RPC-fetched blocks to the archive as they are delivered
    pub fn with_write_through(mut self, writer: ArchiveWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Feeds blocks from `start` into `blocks` until cancelled or the queue
    /// closes. Fetch failures restart the cycle at the last confirmed
    /// height + 1 after a backoff.
    pub async fn run(mut self, start: i64, blocks: mpsc::Sender<BlockMessage>, cancel: CancellationToken) {
        info!(start, "Block acquisition started");
        let mut next = start;

        'cycle: loop {
            let mut iter = match self.source.iterator(next, None) {
                Ok(iter) => iter,
                Err(e) => {
                    if !self.fail(next, &e, &cancel).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break 'cycle,
                    result = iter.next() => result,
                };
                if let (Some(metrics), Some(head)) = (&self.metrics, iter.chain_height()) {
                    metrics.chain_height.set(head);
                }

                match result {
                    Ok(block) => {
                        self.backoff.reset();
                        if iter.origin() == Some(Origin::Rpc) {
                            self.write_through(&block);
                        }
                        let message = BlockMessage {
                            block,
                            batch_end: iter.at_batch_end(),
                        };
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => break 'cycle,
                            sent = blocks.send(message) => sent,
                        };
                        if sent.is_err() {
                            debug!("Block queue closed");
                            break 'cycle;
                        }
                        next += 1;
                    }
                    Err(FetchError::NoData) => {
                        if !sleep_or_cancel(self.poll_interval, &cancel).await {
                            break 'cycle;
                        }
                    }
                    Err(e) => {
                        if !self.fail(next, &e, &cancel).await {
                            break 'cycle;
                        }
                        continue 'cycle;
                    }
                }
            }
        }
        info!(next_height = next, "Block acquisition stopped");
    }

    async fn fail(&mut self, next: i64, error: &FetchError, cancel: &CancellationToken) -> bool {
        let delay = self.backoff.next_delay();
        warn!(height = next, error = %error, delay_ms = delay.as_millis() as u64, "Fetch failed, restarting cycle");
        if let Some(metrics) = &self.metrics {
            metrics.fetch_errors.inc();
        }
        sleep_or_cancel(delay, cancel).await
    }

    fn write_through(&mut self, block: &crate::core::Block) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(e) = writer.append(block) {
            warn!(
                height = block.height,
                expected = writer.next_height(),
                error = %e,
                "Archive write-through disabled"
            );
            self.writer = None;
        }
    }
}

/// False when cancelled before the delay elapsed
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::source::tests::MockChain;

    fn config() -> ChainConfig {
        ChainConfig {
            fetch_batch_size: 2,
            poll_interval_ms: 100,
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            ..ChainConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let delays: Vec<u128> = (0..4).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
        backoff.reset();
        assert_eq!(backoff.next_delay().as_millis(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_errors_without_gaps() {
        let chain = Arc::new(MockChain::with_head(5));
        *chain.failures.lock().unwrap() = 2;
        let fetcher = BlockFetcher::new(BlockSource::new(chain, 2), &config());
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fetcher.run(1, tx, cancel.clone()));

        let mut heights = Vec::new();
        while heights.len() < 5 {
            heights.push(rx.recv().await.unwrap().block.height);
        }
        assert_eq!(heights, vec![1, 2, 3, 4, 5]);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn archive_starting_above_resume_height_falls_back_to_rpc() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut writer = crate::chain::ArchiveWriter::new(dir.path(), 3, 4);
        for height in 4..=6 {
            writer.append(&crate::chain::source::tests::block(height)).unwrap();
        }

        let chain = Arc::new(MockChain::with_head(8));
        let source = BlockSource::new(chain, 2).with_archive(dir.path());
        let fetcher = BlockFetcher::new(source, &config());
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fetcher.run(1, tx, cancel.clone()));

        let mut heights = Vec::new();
        while heights.len() < 8 {
            let message = tokio::time::timeout(Duration::from_secs(600), rx.recv())
                .await
                .unwrap()
                .unwrap();
            heights.push(message.block.height);
        }
        assert_eq!(heights, (1..=8).collect::<Vec<_>>());
        cancel.cancel();
        task.await.unwrap();
    }
}
