//! Block archive recovery and archive-to-RPC handoff

use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use thor_indexer::chain::{ArchiveWriter, BlockArchive, BlockSource, Origin};
use thor_indexer::core::{Block, ChainPort, FetchError};

fn block(height: i64) -> Block {
    Block {
        height,
        timestamp: DateTime::from_timestamp(1_600_000_000 + height * 6, 0).unwrap(),
        hash: vec![(height % 256) as u8],
        begin_events: vec![],
        txs: vec![],
        end_events: vec![],
    }
}

/// Serves every height up to `head` and counts fetch calls
struct CountingChain {
    head: i64,
    fetches: AtomicUsize,
}

#[async_trait]
impl ChainPort for CountingChain {
    async fn latest_height(&self) -> Result<i64, FetchError> {
        Ok(self.head)
    }

    async fn fetch_blocks(&self, from: i64, to: i64) -> Result<Vec<Block>, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok((from..=to).map(block).collect())
    }
}

#[test]
fn incomplete_batch_is_discarded_on_open() -> Result<()> {
    let dir = TempDir::new()?;
    let mut writer = ArchiveWriter::new(dir.path(), 4, 1);
    for height in 1..=10 {
        writer.append(&block(height))?;
    }
    drop(writer);

    let tmp = dir.path().join("000000000012.tmp");
    assert!(tmp.exists());

    let archive = BlockArchive::open(dir.path())?;
    assert!(!tmp.exists());
    assert_eq!(archive.last_height(), Some(8));
    assert_eq!(archive.resume_height(1), 9);

    let mut writer = ArchiveWriter::new(dir.path(), 4, archive.resume_height(1));
    for height in 9..=12 {
        writer.append(&block(height))?;
    }
    let archive = BlockArchive::open(dir.path())?;
    assert_eq!(archive.last_height(), Some(12));
    assert_eq!(fs::read_dir(dir.path())?.count(), 3);
    Ok(())
}

#[test]
fn empty_archive_resumes_at_start_height() -> Result<()> {
    let dir = TempDir::new()?;
    let archive = BlockArchive::open(dir.path().join("blocks"))?;
    assert_eq!(archive.last_height(), None);
    assert_eq!(archive.resume_height(42), 42);
    Ok(())
}

#[tokio::test]
async fn archive_first_then_rpc() -> Result<()> {
    let dir = TempDir::new()?;
    let mut writer = ArchiveWriter::new(dir.path(), 3, 1);
    for height in 1..=6 {
        writer.append(&block(height))?;
    }

    let chain = Arc::new(CountingChain {
        head: 9,
        fetches: AtomicUsize::new(0),
    });
    let source = BlockSource::new(chain.clone(), 10).with_archive(dir.path());
    let mut iter = source.iterator(2, None)?;

    let mut seen = Vec::new();
    loop {
        match iter.next().await {
            Ok(block) => seen.push((block.height, iter.origin(), iter.at_batch_end())),
            Err(e) if e.is_no_data() => break,
            Err(e) => return Err(e.into()),
        }
    }

    let heights: Vec<i64> = seen.iter().map(|s| s.0).collect();
    assert_eq!(heights, (2..=9).collect::<Vec<_>>());
    assert!(seen[..5].iter().all(|s| s.1 == Some(Origin::Archive)));
    assert!(seen[5..].iter().all(|s| s.1 == Some(Origin::Rpc)));
    // archive file ends and the end of the RPC batch close batches
    let ends: Vec<i64> = seen.iter().filter(|s| s.2).map(|s| s.0).collect();
    assert_eq!(ends, vec![3, 6, 9]);
    assert_eq!(chain.fetches.load(Ordering::SeqCst), 1);
    Ok(())
}

async fn drain(source: &BlockSource, from: i64) -> Result<Vec<(i64, Option<Origin>)>> {
    let mut iter = source.iterator(from, None)?;
    let mut seen = Vec::new();
    loop {
        match iter.next().await {
            Ok(block) => seen.push((block.height, iter.origin())),
            Err(e) if e.is_no_data() => return Ok(seen),
            Err(e) => return Err(e.into()),
        }
    }
}

#[tokio::test]
async fn archive_starting_later_is_bypassed() -> Result<()> {
    let dir = TempDir::new()?;
    let mut writer = ArchiveWriter::new(dir.path(), 3, 4);
    for height in 4..=6 {
        writer.append(&block(height))?;
    }

    let chain = Arc::new(CountingChain {
        head: 8,
        fetches: AtomicUsize::new(0),
    });
    let source = BlockSource::new(chain, 10).with_archive(dir.path());
    let seen = drain(&source, 1).await?;

    let heights: Vec<i64> = seen.iter().map(|s| s.0).collect();
    assert_eq!(heights, (1..=8).collect::<Vec<_>>());
    assert!(seen.iter().all(|s| s.1 == Some(Origin::Rpc)));
    Ok(())
}

#[tokio::test]
async fn missing_batch_file_is_served_from_rpc() -> Result<()> {
    let dir = TempDir::new()?;
    let mut writer = ArchiveWriter::new(dir.path(), 3, 1);
    for height in 1..=9 {
        writer.append(&block(height))?;
    }
    fs::remove_file(dir.path().join("000000000006"))?;

    let chain = Arc::new(CountingChain {
        head: 10,
        fetches: AtomicUsize::new(0),
    });
    let source = BlockSource::new(chain, 10).with_archive(dir.path());
    let seen = drain(&source, 1).await?;

    let heights: Vec<i64> = seen.iter().map(|s| s.0).collect();
    assert_eq!(heights, (1..=10).collect::<Vec<_>>());
    assert!(seen[..3].iter().all(|s| s.1 == Some(Origin::Archive)));
    assert!(seen[3..].iter().all(|s| s.1 == Some(Origin::Rpc)));
    Ok(())
}
