//! Pull-based batch readers, the transport unit between operator stages.

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use furrow_common::{Error, Result};

/// A pull-based stream of record batches.
///
/// `read` returns `Ok(Some(batch))` for each batch in order,
/// `Ok(None)` exactly once at end of stream, and an error otherwise.
/// `read` is never invoked concurrently for a given reader.
#[async_trait]
pub trait BatchReader: Send {
    /// Pull the next batch, or `None` at end of stream.
    async fn read(&mut self) -> Result<Option<RecordBatch>>;
}

/// Reader over an in-memory sequence of batches.
pub struct BatchesReader {
    batches: std::vec::IntoIter<RecordBatch>,
}

impl BatchesReader {
    /// Create a reader yielding `batches` in order.
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches: batches.into_iter(),
        }
    }
}

#[async_trait]
impl BatchReader for BatchesReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        Ok(self.batches.next())
    }
}

/// Reader that fails every read with a fixed error.
pub struct ErrorReader {
    err: Error,
}

impl ErrorReader {
    /// Create a reader returning `err` on every read.
    pub fn new(err: Error) -> Self {
        Self { err }
    }
}

#[async_trait]
impl BatchReader for ErrorReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        Err(self.err.clone())
    }
}

/// Concatenates several readers into one stream.
pub struct MultiReader {
    readers: Vec<Box<dyn BatchReader>>,
    current: usize,
}

impl MultiReader {
    /// Create a reader yielding every batch of every input, in input order.
    pub fn new(readers: Vec<Box<dyn BatchReader>>) -> Self {
        Self {
            readers,
            current: 0,
        }
    }
}

#[async_trait]
impl BatchReader for MultiReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        while self.current < self.readers.len() {
            match self.readers[self.current].read().await? {
                Some(batch) => return Ok(Some(batch)),
                None => self.current += 1,
            }
        }
        Ok(None)
    }
}

/// Decorator accumulating the row count pulled through a reader.
pub struct CountingReader {
    inner: Box<dyn BatchReader>,
    counter: furrow_common::Counter,
}

impl CountingReader {
    /// Wrap `inner`, adding each batch's row count to `counter`.
    pub fn new(inner: Box<dyn BatchReader>, counter: furrow_common::Counter) -> Self {
        Self { inner, counter }
    }
}

#[async_trait]
impl BatchReader for CountingReader {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        let batch = self.inner.read().await?;
        if let Some(b) = &batch {
            self.counter.add(b.num_rows() as i64);
        }
        Ok(batch)
    }
}

/// Drain `reader` to completion, collecting every batch.
pub async fn read_all(reader: &mut dyn BatchReader) -> Result<Vec<RecordBatch>> {
    let mut out = Vec::new();
    while let Some(batch) = reader.read().await? {
        out.push(batch);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use furrow_common::StatsMap;

    use super::{read_all, BatchReader, BatchesReader, CountingReader, MultiReader};

    fn int_batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    #[tokio::test]
    async fn multi_reader_concatenates_in_order() {
        let a = Box::new(BatchesReader::new(vec![int_batch(vec![1]), int_batch(vec![2])]));
        let b = Box::new(BatchesReader::new(vec![]));
        let c = Box::new(BatchesReader::new(vec![int_batch(vec![3])]));
        let mut multi = MultiReader::new(vec![a, b, c]);
        let batches = read_all(&mut multi).await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(multi.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn counting_reader_accumulates_rows() {
        let stats = StatsMap::new();
        let inner = Box::new(BatchesReader::new(vec![
            int_batch(vec![1, 2, 3]),
            int_batch(vec![4]),
        ]));
        let mut reader = CountingReader::new(inner, stats.int("read"));
        read_all(&mut reader).await.unwrap();
        assert_eq!(stats.values()["read"], 4);
    }
}
