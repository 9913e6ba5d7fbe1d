//! Combine buffers: associative per-key accumulation during the
//! shuffle.
//!
//! Rows are keyed on the leading column. A combining frame is a
//! bounded key→accumulator table; the in-task frames combine hot keys
//! locally and spill their compacted contents into the per-partition
//! shared frames, which a commit drains to the store as ordinary
//! partition files.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use furrow_common::{Error, Result};
use furrow_frame::{rows_from_batch, rows_to_batch, Value};
use furrow_slice::Combiner;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::error;

use crate::store::Store;
use crate::task::TaskName;

/// A key→accumulator table combining rows with equal keys.
pub struct CombiningFrame {
    combiner: Arc<dyn Combiner>,
    cap: usize,
    groups: HashMap<Value, Vec<Value>>,
}

impl CombiningFrame {
    /// Create a frame with the given capacity target.
    pub fn new(combiner: Arc<dyn Combiner>, cap: usize) -> Self {
        Self {
            combiner,
            cap: cap.max(2),
            groups: HashMap::new(),
        }
    }

    /// Number of distinct keys held.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the frame holds no keys.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Capacity target.
    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Combine one row (key followed by value columns).
    pub fn combine_row(&mut self, row: &[Value]) -> Result<()> {
        let (key, values) = row
            .split_first()
            .ok_or_else(|| Error::Fatal("combined row has no columns".to_string()))?;
        match self.groups.get_mut(key) {
            Some(acc) => self.combiner.combine(acc, values)?,
            None => {
                self.groups.insert(key.clone(), values.to_vec());
            }
        }
        Ok(())
    }

    /// Combine a set of rows.
    pub fn combine_rows(&mut self, rows: &[Vec<Value>]) -> Result<()> {
        for row in rows {
            self.combine_row(row)?;
        }
        Ok(())
    }

    /// Combine every row of a batch.
    pub fn combine_batch(&mut self, batch: &RecordBatch) -> Result<()> {
        for row in rows_from_batch(batch)? {
            self.combine_row(&row)?;
        }
        Ok(())
    }

    /// Compact the frame, draining `fraction` of its keys as spillable
    /// rows. Iteration order is unspecified.
    pub fn compact(&mut self, fraction: f64) -> Vec<Vec<Value>> {
        let drain = ((self.groups.len() as f64 * fraction).ceil() as usize)
            .clamp(1, self.groups.len());
        let spill_keys: Vec<Value> = self.groups.keys().take(drain).cloned().collect();
        let mut rows = Vec::with_capacity(spill_keys.len());
        for key in spill_keys {
            let values = self.groups.remove(&key).expect("key present");
            let mut row = Vec::with_capacity(1 + values.len());
            row.push(key);
            row.extend(values);
            rows.push(row);
        }
        rows
    }

    /// Drain every key as output rows.
    pub fn drain_all(&mut self) -> Vec<Vec<Value>> {
        self.compact(1.0)
    }
}

/// The per-(combine key) shared accumulator: one combining frame per
/// partition, each owned through a one-slot mutex.
pub struct SharedCombiner {
    /// Name the committed output is stored and read under.
    pub name: TaskName,
    schema: SchemaRef,
    partitions: Vec<Arc<Mutex<CombiningFrame>>>,
}

impl SharedCombiner {
    /// Allocate frames for `num_partition` partitions.
    pub fn new(
        name: TaskName,
        schema: SchemaRef,
        combiner: Arc<dyn Combiner>,
        num_partition: usize,
        capacity: usize,
    ) -> Self {
        let partitions = (0..num_partition)
            .map(|_| Arc::new(Mutex::new(CombiningFrame::new(Arc::clone(&combiner), capacity))))
            .collect();
        Self {
            name,
            schema,
            partitions,
        }
    }

    /// Number of partitions.
    pub fn num_partition(&self) -> usize {
        self.partitions.len()
    }

    /// Acquire partition `p`'s frame, blocking until available.
    pub async fn acquire(&self, p: usize) -> OwnedMutexGuard<CombiningFrame> {
        Arc::clone(&self.partitions[p]).lock_owned().await
    }

    /// Try to acquire partition `p`'s frame without blocking.
    pub fn try_acquire(&self, p: usize) -> Option<OwnedMutexGuard<CombiningFrame>> {
        Arc::clone(&self.partitions[p]).try_lock_owned().ok()
    }

    /// Drain every partition to `store` as ordinary partition files,
    /// bounded by `limiter`. Any failure discards that partition's
    /// write and fails the commit.
    pub async fn write_to_store(&self, store: Arc<dyn Store>, limiter: Arc<Semaphore>) -> Result<()> {
        let mut writes = Vec::with_capacity(self.partitions.len());
        for p in 0..self.partitions.len() {
            let frame = Arc::clone(&self.partitions[p]);
            let store = Arc::clone(&store);
            let limiter = Arc::clone(&limiter);
            let name = self.name.clone();
            let schema = Arc::clone(&self.schema);
            writes.push(tokio::spawn(async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Canceled)?;
                let rows = frame.lock().await.drain_all();
                let batches = if rows.is_empty() {
                    Vec::new()
                } else {
                    vec![rows_to_batch(&schema, &rows)?]
                };
                let bytes = furrow_frame::encode_batches(&schema, &batches)?;
                let mut sink = store.create(&name, p).await?;
                if let Err(err) = sink.write(&bytes).await {
                    sink.discard().await;
                    return Err(err);
                }
                sink.commit(rows.len() as i64).await
            }));
        }
        let mut result = Ok(());
        for write in writes {
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(key = %self.name, error = %err, "combine buffer write failed");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(err) => {
                    if result.is_ok() {
                        result = Err(Error::Fatal(format!("combine write join error: {err}")));
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use furrow_frame::Value;
    use furrow_slice::FnCombiner;

    use super::CombiningFrame;

    fn sum_combiner() -> Arc<dyn furrow_slice::Combiner> {
        Arc::new(FnCombiner(|acc: &mut [Value], row: &[Value]| {
            if let (Value::Int64(a), Value::Int64(b)) = (&acc[0], &row[0]) {
                let sum = a + b;
                acc[0] = Value::Int64(sum);
            }
            Ok(())
        }))
    }

    #[test]
    fn combines_equal_keys() {
        let mut frame = CombiningFrame::new(sum_combiner(), 16);
        for i in 0..10_i64 {
            frame
                .combine_row(&[Value::Int64(i % 2), Value::Int64(i)])
                .unwrap();
        }
        assert_eq!(frame.len(), 2);
        let mut rows = frame.drain_all();
        rows.sort_by_key(|r| match r[0] {
            Value::Int64(k) => k,
            _ => unreachable!(),
        });
        assert_eq!(rows[0], vec![Value::Int64(0), Value::Int64(20)]);
        assert_eq!(rows[1], vec![Value::Int64(1), Value::Int64(25)]);
        assert!(frame.is_empty());
    }

    #[test]
    fn compact_drains_a_fraction() {
        let mut frame = CombiningFrame::new(sum_combiner(), 16);
        for i in 0..8_i64 {
            frame
                .combine_row(&[Value::Int64(i), Value::Int64(1)])
                .unwrap();
        }
        let spilled = frame.compact(0.75);
        assert_eq!(spilled.len(), 6);
        assert_eq!(frame.len(), 2);
    }
}
