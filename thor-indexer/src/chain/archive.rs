//! Local append-only block archive
//!
//! Blocks are stored in batches of `blocks_per_file`, one zstd-compressed
//! newline-delimited JSON file per batch, named by the last height it
//! contains zero-padded to 12 digits. A batch being written lives under a
//! `.tmp` name and only becomes part of the archive when it is complete;
//! leftover `.tmp` files are discarded when the archive is opened.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::core::{Block, FetchError};

const TMP_SUFFIX: &str = ".tmp";
const COMPRESSION_LEVEL: i32 = 3;

fn batch_name(last_height: i64) -> String {
    format!("{:012}", last_height)
}

fn parse_batch_name(name: &str) -> Option<i64> {
    if name.len() == 12 && name.bytes().all(|b| b.is_ascii_digit()) {
        name.parse().ok()
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub path: PathBuf,
    pub last_height: i64,
}

/// Complete batches of an archive directory, ordered by height
#[derive(Debug, Clone)]
pub struct BlockArchive {
    dir: PathBuf,
    batches: Vec<BatchFile>,
}

impl BlockArchive {
    /// Opens the archive for writing: creates the directory and discards
    /// incomplete batches
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, FetchError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_tmp = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(TMP_SUFFIX));
            if is_tmp {
                warn!(path = %path.display(), "Discarding incomplete archive batch");
                fs::remove_file(&path)?;
            }
        }
        Self::scan(dir)
    }

    /// Reads the list of complete batches without touching anything
    pub fn scan(dir: impl AsRef<Path>) -> Result<Self, FetchError> {
        let dir = dir.as_ref().to_path_buf();
        let mut batches = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let last_height = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_batch_name);
                if let Some(last_height) = last_height {
                    batches.push(BatchFile { path, last_height });
                }
            }
        }
        batches.sort_by_key(|b| b.last_height);
        Ok(Self { dir, batches })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn batches(&self) -> &[BatchFile] {
        &self.batches
    }

    /// Last height of the last complete batch
    pub fn last_height(&self) -> Option<i64> {
        self.batches.last().map(|b| b.last_height)
    }

    /// Height a writer continues from
    pub fn resume_height(&self, start_height: i64) -> i64 {
        self.last_height().map_or(start_height, |h| h + 1)
    }

    /// Reader positioned at the first archived block `>= from`
    pub fn reader(&self, from: i64) -> ArchiveReader {
        let files = self
            .batches
            .iter()
            .filter(|b| b.last_height >= from)
            .cloned()
            .collect();
        ArchiveReader {
            files,
            current: None,
            from,
        }
    }
}

type BatchLines = Lines<BufReader<zstd::Decoder<'static, BufReader<File>>>>;

pub struct ArchiveReader {
    files: Vec<BatchFile>,
    current: Option<(BatchLines, i64)>,
    from: i64,
}

impl ArchiveReader {
    /// Next archived block and whether it closes its batch file
    pub fn next_block(&mut self) -> Result<Option<(Block, bool)>, FetchError> {
        loop {
            if self.current.is_none() {
                if self.files.is_empty() {
                    return Ok(None);
                }
                let batch = self.files.remove(0);
                debug!(path = %batch.path.display(), "Reading archive batch");
                let decoder = zstd::Decoder::new(File::open(&batch.path)?)?;
                self.current = Some((BufReader::new(decoder).lines(), batch.last_height));
            }
            let Some((lines, last_height)) = self.current.as_mut() else {
                continue;
            };
            let last_height = *last_height;
            match lines.next() {
                Some(line) => {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let block: Block = serde_json::from_str(&line)?;
                    if block.height < self.from {
                        continue;
                    }
                    let closes = block.height == last_height;
                    return Ok(Some((block, closes)));
                }
                None => self.current = None,
            }
        }
    }
}

/// Appends blocks to the archive, one batch at a time
pub struct ArchiveWriter {
    dir: PathBuf,
    blocks_per_file: usize,
    next_height: i64,
    current: Option<OpenBatch>,
}

struct OpenBatch {
    tmp_path: PathBuf,
    encoder: zstd::Encoder<'static, BufWriter<File>>,
    blocks: usize,
}

impl ArchiveWriter {
    pub fn new(dir: impl AsRef<Path>, blocks_per_file: usize, next_height: i64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            blocks_per_file: blocks_per_file.max(1),
            next_height,
            current: None,
        }
    }

    pub fn next_height(&self) -> i64 {
        self.next_height
    }

    /// Appends the next block; completes and publishes the batch when full
    pub fn append(&mut self, block: &Block) -> Result<(), FetchError> {
        if block.height != self.next_height {
            return Err(FetchError::HeightGap {
                expected: self.next_height,
                got: block.height,
            });
        }
        if self.current.is_none() {
            let expected_last = block.height + self.blocks_per_file as i64 - 1;
            let tmp_path = self
                .dir
                .join(format!("{}{}", batch_name(expected_last), TMP_SUFFIX));
            let file = BufWriter::new(File::create(&tmp_path)?);
            self.current = Some(OpenBatch {
                tmp_path,
                encoder: zstd::Encoder::new(file, COMPRESSION_LEVEL)?,
                blocks: 0,
            });
        }
        if let Some(batch) = self.current.as_mut() {
            serde_json::to_writer(&mut batch.encoder, block)?;
            batch.encoder.write_all(b"\n")?;
            batch.blocks += 1;
        }
        self.next_height += 1;

        let full = self
            .current
            .as_ref()
            .map_or(false, |b| b.blocks >= self.blocks_per_file);
        if full {
            self.finish_batch(block.height)?;
        }
        Ok(())
    }

    fn finish_batch(&mut self, last_height: i64) -> Result<(), FetchError> {
        let Some(batch) = self.current.take() else {
            return Ok(());
        };
        let mut file = batch.encoder.finish()?;
        file.flush()?;
        file.get_ref().sync_all()?;
        let final_path = self.dir.join(batch_name(last_height));
        fs::rename(&batch.tmp_path, &final_path)?;
        info!(last_height, blocks = batch.blocks, "Archive batch complete");
        Ok(())
    }

    /// Blocks written to the open, incomplete batch
    pub fn pending(&self) -> usize {
        self.current.as_ref().map_or(0, |b| b.blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tempfile::TempDir;

    fn block(height: i64) -> Block {
        Block {
            height,
            timestamp: DateTime::from_timestamp(1_600_000_000 + height, 0).unwrap(),
            hash: vec![height as u8],
            begin_events: vec![],
            txs: vec![],
            end_events: vec![],
        }
    }

    #[test]
    fn batches_are_named_by_last_height() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::new(dir.path(), 3, 1);
        for h in 1..=7 {
            writer.append(&block(h)).unwrap();
        }
        let archive = BlockArchive::scan(dir.path()).unwrap();
        let names: Vec<i64> = archive.batches().iter().map(|b| b.last_height).collect();
        assert_eq!(names, vec![3, 6]);
        assert_eq!(writer.pending(), 1);
        assert!(dir.path().join("000000000009.tmp").exists());
        assert!(writer.append(&block(9)).is_err());
    }

    #[test]
    fn reader_starts_mid_batch_and_flags_batch_ends() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::new(dir.path(), 3, 1);
        for h in 1..=6 {
            writer.append(&block(h)).unwrap();
        }
        let archive = BlockArchive::scan(dir.path()).unwrap();
        let mut reader = archive.reader(2);
        let mut seen = Vec::new();
        while let Some((block, end)) = reader.next_block().unwrap() {
            seen.push((block.height, end));
        }
        assert_eq!(seen, vec![(2, false), (3, true), (4, false), (5, false), (6, true)]);
    }
}
