//! Local buffered partition storage for task outputs.
//!
//! A store maps `(task name, partition)` to a byte stream plus a
//! record count. Writers follow a commit-or-discard contract: a
//! partition is either fully committed with its record count or leaves
//! no trace, never a partial file.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use furrow_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::reader::ByteStream;
use crate::task::TaskName;

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Metadata for one stored partition.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SliceInfo {
    /// Committed record count.
    pub records: i64,
    /// Size of the partition byte stream.
    pub bytes: u64,
}

/// A partition being written. Bytes become visible only on commit.
#[async_trait]
pub trait PartitionSink: Send {
    /// Append bytes to the partition.
    async fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Atomically publish the partition with its record count.
    async fn commit(self: Box<Self>, records: i64) -> Result<()>;
    /// Drop the partition, removing any bytes written so far.
    async fn discard(self: Box<Self>);
}

/// Keyed storage of task partition outputs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Metadata for a committed partition, or NotExist.
    async fn stat(&self, name: &TaskName, partition: usize) -> Result<SliceInfo>;
    /// Open a committed partition's byte stream at `offset`.
    async fn open(&self, name: &TaskName, partition: usize, offset: u64)
        -> Result<Box<dyn ByteStream>>;
    /// Begin writing a partition.
    async fn create(&self, name: &TaskName, partition: usize) -> Result<Box<dyn PartitionSink>>;
}

/// Directory-backed store with one file per (task, partition) and a
/// JSON sidecar carrying the committed metadata.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn base_path(&self, name: &TaskName, partition: usize) -> PathBuf {
        let op: String = name
            .op
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.dir.join(format!(
            "inv{:x}-{}-{}of{}-p{}",
            name.invocation, op, name.shard, name.num_shard, partition
        ))
    }

    fn info_path(base: &Path) -> PathBuf {
        base.with_extension("idx.json")
    }

    fn staged_path(base: &Path) -> PathBuf {
        base.with_extension("staged")
    }
}

#[async_trait]
impl Store for FileStore {
    async fn stat(&self, name: &TaskName, partition: usize) -> Result<SliceInfo> {
        let base = self.base_path(name, partition);
        let bytes = fs::read(Self::info_path(&base))
            .map_err(|_| Error::NotExist(format!("{name}:{partition}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Fatal(format!("partition index decode failed: {e}")))
    }

    async fn open(
        &self,
        name: &TaskName,
        partition: usize,
        offset: u64,
    ) -> Result<Box<dyn ByteStream>> {
        let base = self.base_path(name, partition);
        if !Self::info_path(&base).exists() {
            return Err(Error::NotExist(format!("{name}:{partition}")));
        }
        let mut file =
            File::open(&base).map_err(|_| Error::NotExist(format!("{name}:{partition}")))?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(FileByteStream { file }))
    }

    async fn create(&self, name: &TaskName, partition: usize) -> Result<Box<dyn PartitionSink>> {
        fs::create_dir_all(&self.dir)?;
        let base = self.base_path(name, partition);
        let staged = Self::staged_path(&base);
        let file = File::create(&staged)?;
        Ok(Box::new(FileSink {
            base,
            staged,
            writer: Some(BufWriter::new(file)),
            bytes: 0,
        }))
    }
}

struct FileByteStream {
    file: File,
}

#[async_trait]
impl ByteStream for FileByteStream {
    async fn next(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0_u8; READ_CHUNK_BYTES];
        let n = self.file.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

struct FileSink {
    base: PathBuf,
    staged: PathBuf,
    writer: Option<BufWriter<File>>,
    bytes: u64,
}

#[async_trait]
impl PartitionSink for FileSink {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Fatal("write to finished partition sink".to_string()))?;
        writer.write_all(data)?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>, records: i64) -> Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Fatal("commit of finished partition sink".to_string()))?;
        writer
            .into_inner()
            .map_err(|e| Error::Fatal(format!("partition flush failed: {e}")))?
            .sync_all()?;
        fs::rename(&self.staged, &self.base)?;
        let info = SliceInfo {
            records,
            bytes: self.bytes,
        };
        let encoded = serde_json::to_vec(&info)
            .map_err(|e| Error::Fatal(format!("partition index encode failed: {e}")))?;
        fs::write(FileStore::info_path(&self.base), encoded)?;
        Ok(())
    }

    async fn discard(mut self: Box<Self>) {
        self.writer.take();
        let _ = fs::remove_file(&self.staged);
    }
}
