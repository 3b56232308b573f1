//! Ordered, resumable block sequence over the archive and live RPC

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::archive::{ArchiveReader, BlockArchive};
use crate::core::{Block, ChainPort, FetchError};

/// Where a delivered block came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Archive,
    Rpc,
}

#[derive(Clone)]
pub struct BlockSource {
    chain: Arc<dyn ChainPort>,
    archive_dir: Option<PathBuf>,
    fetch_batch_size: usize,
}

impl BlockSource {
    pub fn new(chain: Arc<dyn ChainPort>, fetch_batch_size: usize) -> Self {
        Self {
            chain,
            archive_dir: None,
            fetch_batch_size: fetch_batch_size.max(1),
        }
    }

    /// Serve heights the archive holds from disk
    pub fn with_archive(mut self, dir: impl Into<PathBuf>) -> Self {
        self.archive_dir = Some(dir.into());
        self
    }

    /// Iterator over `[from, to]`; unbounded when `to` is `None`
    pub fn iterator(&self, from: i64, to: Option<i64>) -> Result<BlockIter, FetchError> {
        let archive = match &self.archive_dir {
            Some(dir) => {
                let archive = BlockArchive::scan(dir)?;
                archive
                    .last_height()
                    .filter(|last| *last >= from)
                    .map(|last| (archive.reader(from), last))
            }
            None => None,
        };
        Ok(BlockIter {
            chain: self.chain.clone(),
            archive,
            fetch_batch_size: self.fetch_batch_size,
            next_height: from,
            to,
            buffer: VecDeque::new(),
            at_batch_end: false,
            origin: None,
            chain_height: None,
        })
    }
}

pub struct BlockIter {
    chain: Arc<dyn ChainPort>,
    archive: Option<(ArchiveReader, i64)>,
    fetch_batch_size: usize,
    next_height: i64,
    to: Option<i64>,
    buffer: VecDeque<Block>,
    at_batch_end: bool,
    origin: Option<Origin>,
    chain_height: Option<i64>,
}

impl BlockIter {
    /// Next block in height order. `NoData` means caught up with the chain
    /// head (or past `to`); any other error ends this iterator's usefulness.
    /// Heights the archive does not hold are served from RPC.
    pub async fn next(&mut self) -> Result<Block, FetchError> {
        if self.to.map_or(false, |to| self.next_height > to) {
            return Err(FetchError::NoData);
        }

        if let Some((reader, last)) = self.archive.as_mut() {
            while self.next_height <= *last {
                let Some((block, file_end)) = reader.next_block()? else { break };
                if block.height < self.next_height {
                    continue;
                }
                if block.height > self.next_height {
                    // archive starts later or lost a batch file
                    debug!(
                        height = self.next_height,
                        archived = block.height,
                        "Archive does not hold the next height"
                    );
                    break;
                }
                let closes = file_end || self.to == Some(block.height);
                return self.deliver(block, closes, Origin::Archive);
            }
            debug!(height = self.next_height, "Switching to RPC");
            self.archive = None;
        }

        if self.buffer.is_empty() {
            self.fill().await?;
        }
        let Some(block) = self.buffer.pop_front() else {
            return Err(FetchError::NoData);
        };
        let closes = self.buffer.is_empty();
        self.deliver(block, closes, Origin::Rpc)
    }

    async fn fill(&mut self) -> Result<(), FetchError> {
        let latest = self.chain.latest_height().await?;
        self.chain_height = Some(latest);
        let mut last = latest.min(self.next_height + self.fetch_batch_size as i64 - 1);
        if let Some(to) = self.to {
            last = last.min(to);
        }
        if last < self.next_height {
            return Err(FetchError::NoData);
        }
        let blocks = self.chain.fetch_blocks(self.next_height, last).await?;
        debug!(from = self.next_height, to = last, count = blocks.len(), "Fetched batch");
        self.buffer.extend(blocks);
        Ok(())
    }

    fn deliver(&mut self, block: Block, closes: bool, origin: Origin) -> Result<Block, FetchError> {
        if block.height != self.next_height {
            self.buffer.clear();
            self.archive = None;
            return Err(FetchError::HeightGap {
                expected: self.next_height,
                got: block.height,
            });
        }
        self.next_height += 1;
        self.at_batch_end = closes;
        self.origin = Some(origin);
        Ok(block)
    }

    /// Whether the block just returned closed a fetch batch
    pub fn at_batch_end(&self) -> bool {
        self.at_batch_end
    }

    /// Origin of the block just returned
    pub fn origin(&self) -> Option<Origin> {
        self.origin
    }

    pub fn next_height(&self) -> i64 {
        self.next_height
    }

    /// Chain head as of the last RPC batch
    pub fn chain_height(&self) -> Option<i64> {
        self.chain_height
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    pub(crate) fn block(height: i64) -> Block {
        Block {
            height,
            timestamp: DateTime::from_timestamp(1_600_000_000 + height * 6, 0).unwrap(),
            hash: vec![(height % 256) as u8],
            begin_events: vec![],
            txs: vec![],
            end_events: vec![],
        }
    }

    /// Chain whose head and skipped heights tests control
    #[derive(Default)]
    pub(crate) struct MockChain {
        pub head: Mutex<i64>,
        pub skip: Mutex<Vec<i64>>,
        pub failures: Mutex<u32>,
    }

    impl MockChain {
        pub(crate) fn with_head(head: i64) -> Self {
            let chain = Self::default();
            *chain.head.lock().unwrap() = head;
            chain
        }
    }

    #[async_trait]
    impl ChainPort for MockChain {
        async fn latest_height(&self) -> Result<i64, FetchError> {
            Ok(*self.head.lock().unwrap())
        }

        async fn fetch_blocks(&self, from: i64, to: i64) -> Result<Vec<Block>, FetchError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(FetchError::Http("connection reset".into()));
                }
            }
            let skip = self.skip.lock().unwrap().clone();
            Ok((from..=to).filter(|h| !skip.contains(h)).map(block).collect())
        }
    }

    #[tokio::test]
    async fn batches_and_no_data() {
        let chain = Arc::new(MockChain::with_head(5));
        let source = BlockSource::new(chain.clone(), 3);
        let mut iter = source.iterator(1, None).unwrap();

        let mut ends = Vec::new();
        for expected in 1..=5 {
            let block = iter.next().await.unwrap();
            assert_eq!(block.height, expected);
            ends.push(iter.at_batch_end());
        }
        assert_eq!(ends, vec![false, false, true, false, true]);
        assert!(iter.next().await.unwrap_err().is_no_data());
        assert_eq!(iter.chain_height(), Some(5));

        *chain.head.lock().unwrap() = 6;
        assert_eq!(iter.next().await.unwrap().height, 6);
    }

    #[tokio::test]
    async fn missing_height_is_a_gap() {
        let chain = Arc::new(MockChain::with_head(4));
        chain.skip.lock().unwrap().push(2);
        let mut iter = BlockSource::new(chain, 10).iterator(1, None).unwrap();
        assert_eq!(iter.next().await.unwrap().height, 1);
        assert!(matches!(
            iter.next().await,
            Err(FetchError::HeightGap { expected: 2, got: 3 })
        ));
    }

    #[tokio::test]
    async fn bounded_range_stops() {
        let chain = Arc::new(MockChain::with_head(100));
        let mut iter = BlockSource::new(chain, 10).iterator(5, Some(6)).unwrap();
        assert_eq!(iter.next().await.unwrap().height, 5);
        assert_eq!(iter.next().await.unwrap().height, 6);
        assert!(iter.at_batch_end());
        assert!(iter.next().await.unwrap_err().is_no_data());
    }
}
