//! Resumable streaming reads of remote task partitions.
//!
//! A partition byte stream is byte-addressable at arbitrary offsets,
//! so a consumer that loses its transport mid-stream reopens at the
//! current byte offset and continues. The decoder therefore sees a
//! byte stream whose length is exactly the bytes the producer encoded,
//! across any number of transport failures, as long as the source
//! partition file is intact. If the source worker is lost, reopening
//! fails and the error surfaces to the caller, which treats it as a
//! lost task rather than a reader error.

use std::collections::VecDeque;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use furrow_common::{BackoffPolicy, Result};
use furrow_frame::{BatchReader, Decoder};
use tracing::{debug, error};

use crate::machine::MachineRpc;
use crate::task::TaskName;

/// A pull-based stream of transport byte chunks. `next` returns
/// `Ok(None)` at end of stream.
#[async_trait]
pub trait ByteStream: Send {
    /// Pull the next chunk of bytes.
    async fn next(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Opens a partition byte stream at a given offset. Used to
/// re-establish streams lost to recoverable transport errors.
#[async_trait]
pub trait OpenerAt: Send + Sync {
    /// Open a stream positioned at `offset`.
    async fn open_at(&self, offset: u64) -> Result<Box<dyn ByteStream>>;
}

/// A byte stream that retries reads by reopening at the current byte
/// offset.
///
/// Mid-stream errors are retried blindly regardless of kind: transient
/// transport failures show up in many shapes, and the reopen call
/// surfaces any permanent error. Open errors are terminal. The retry
/// counter resets on every successful read so the backoff does not
/// grow over a long, occasionally-flaky stream. EOF is terminal.
pub struct RetryReader {
    name: String,
    opener: Box<dyn OpenerAt>,
    policy: BackoffPolicy,
    stream: Option<Box<dyn ByteStream>>,
    bytes: u64,
    retries: u32,
}

impl RetryReader {
    /// Create a reader over `opener` with the given backoff policy.
    pub fn new(name: String, opener: Box<dyn OpenerAt>, policy: BackoffPolicy) -> Self {
        Self {
            name,
            opener,
            policy,
            stream: None,
            bytes: 0,
            retries: 0,
        }
    }

    /// Pull the next chunk, reopening and retrying on mid-stream
    /// transport errors.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.stream.is_none() {
                if self.retries > 0 {
                    debug!(
                        reader = %self.name,
                        retries = self.retries,
                        offset = self.bytes,
                        "retrying stream from offset"
                    );
                }
                self.stream = Some(self.opener.open_at(self.bytes).await?);
            }
            match self.stream.as_mut().expect("stream set").next().await {
                Ok(Some(chunk)) => {
                    self.retries = 0;
                    self.bytes += chunk.len() as u64;
                    return Ok(Some(chunk));
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    error!(
                        reader = %self.name,
                        retries = self.retries,
                        offset = self.bytes,
                        error = %err,
                        "stream read error"
                    );
                    self.stream = None;
                    self.retries += 1;
                    tokio::time::sleep(self.policy.delay(self.retries)).await;
                }
            }
        }
    }

    /// Bytes successfully read so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

struct MachinePartitionOpener {
    machine: Arc<dyn MachineRpc>,
    name: TaskName,
    partition: usize,
}

#[async_trait]
impl OpenerAt for MachinePartitionOpener {
    async fn open_at(&self, offset: u64) -> Result<Box<dyn ByteStream>> {
        self.machine
            .read(self.name.clone(), self.partition, offset)
            .await
    }
}

/// Reads a task partition from a machine, decoding the byte stream
/// incrementally.
///
/// The read RPC is issued on the first `read` call so no data is
/// buffered for abandoned readers. The reader finishes itself at end
/// of stream, verifying the stream ended on a message boundary.
pub struct MachineReader {
    machine: Arc<dyn MachineRpc>,
    name: TaskName,
    partition: usize,
    policy: BackoffPolicy,
    rpc: Option<RetryReader>,
    decoder: Option<Decoder>,
    decoded: VecDeque<RecordBatch>,
    done: bool,
}

impl MachineReader {
    /// Create a reader over partition `partition` of `name` on
    /// `machine`.
    pub fn new(
        machine: Arc<dyn MachineRpc>,
        name: TaskName,
        partition: usize,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            machine,
            name,
            partition,
            policy,
            rpc: None,
            decoder: None,
            decoded: VecDeque::new(),
            done: false,
        }
    }
}

#[async_trait]
impl BatchReader for MachineReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if let Some(batch) = self.decoded.pop_front() {
                return Ok(Some(batch));
            }
            if self.done {
                return Ok(None);
            }
            if self.rpc.is_none() {
                let label = format!(
                    "read {}:{}:{}",
                    self.machine.addr(),
                    self.name,
                    self.partition
                );
                self.rpc = Some(RetryReader::new(
                    label,
                    Box::new(MachinePartitionOpener {
                        machine: Arc::clone(&self.machine),
                        name: self.name.clone(),
                        partition: self.partition,
                    }),
                    self.policy,
                ));
                self.decoder = Some(Decoder::new());
            }
            match self.rpc.as_mut().expect("rpc set").next_chunk().await? {
                Some(chunk) => {
                    let batches = self.decoder.as_mut().expect("decoder set").feed(&chunk)?;
                    self.decoded.extend(batches);
                }
                None => {
                    self.done = true;
                    self.decoder.take().expect("decoder set").finish()?;
                }
            }
        }
    }
}

/// Decodes a local byte stream (no retry) into batches.
pub struct StreamBatchReader {
    stream: Box<dyn ByteStream>,
    decoder: Option<Decoder>,
    decoded: VecDeque<RecordBatch>,
    done: bool,
}

impl StreamBatchReader {
    /// Create a reader decoding `stream`.
    pub fn new(stream: Box<dyn ByteStream>) -> Self {
        Self {
            stream,
            decoder: Some(Decoder::new()),
            decoded: VecDeque::new(),
            done: false,
        }
    }
}

#[async_trait]
impl BatchReader for StreamBatchReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        loop {
            if let Some(batch) = self.decoded.pop_front() {
                return Ok(Some(batch));
            }
            if self.done {
                return Ok(None);
            }
            match self.stream.next().await? {
                Some(chunk) => {
                    let batches = self.decoder.as_mut().expect("decoder set").feed(&chunk)?;
                    self.decoded.extend(batches);
                }
                None => {
                    self.done = true;
                    self.decoder.take().expect("decoder set").finish()?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use furrow_common::{BackoffPolicy, Error, Result};

    use super::{ByteStream, OpenerAt, RetryReader};

    // Serves `data` in single-byte chunks, failing two of every three
    // reads.
    struct FlakySource {
        data: Arc<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    struct FlakyStream {
        data: Arc<Vec<u8>>,
        offset: usize,
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl OpenerAt for FlakySource {
        async fn open_at(&self, offset: u64) -> Result<Box<dyn ByteStream>> {
            Ok(Box::new(FlakyStream {
                data: Arc::clone(&self.data),
                offset: offset as usize,
                reads: Arc::clone(&self.reads),
            }))
        }
    }

    #[async_trait]
    impl ByteStream for FlakyStream {
        async fn next(&mut self) -> Result<Option<Vec<u8>>> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 3 != 0 {
                return Err(Error::Net("synthetic transport failure".into()));
            }
            if self.offset >= self.data.len() {
                return Ok(None);
            }
            let chunk = vec![self.data[self.offset]];
            self.offset += 1;
            Ok(Some(chunk))
        }
    }

    #[tokio::test]
    async fn retry_reader_survives_systematic_failures() {
        const N: usize = 100;
        let data: Vec<u8> = (0..N as u8).collect();
        let opener = FlakySource {
            data: Arc::new(data.clone()),
            reads: Arc::new(AtomicUsize::new(0)),
        };
        let policy = BackoffPolicy {
            base: Duration::from_micros(1),
            max: Duration::from_millis(1),
            factor: 2.0,
        };
        let mut reader = RetryReader::new("test".into(), Box::new(opener), policy);

        // If the retry counter were not reset on successful reads, the
        // growing backoff would blow this deadline.
        let collected = tokio::time::timeout(Duration::from_secs(10), async {
            let mut collected = Vec::new();
            while let Some(chunk) = reader.next_chunk().await.unwrap() {
                collected.extend(chunk);
            }
            collected
        })
        .await
        .expect("retry backoff failed to reset");
        assert_eq!(collected, data);
        assert_eq!(reader.bytes(), N as u64);
    }

    struct FailingOpener;

    #[async_trait]
    impl OpenerAt for FailingOpener {
        async fn open_at(&self, _offset: u64) -> Result<Box<dyn ByteStream>> {
            Err(Error::Unavailable("machine is down".into()))
        }
    }

    #[tokio::test]
    async fn open_errors_are_terminal() {
        let mut reader = RetryReader::new(
            "down".into(),
            Box::new(FailingOpener),
            BackoffPolicy::default(),
        );
        let err = reader.next_chunk().await.unwrap_err();
        assert!(err.is_retryable());
    }
}
