//! Row hashing and shuffle partition routing.
//!
//! The hash of a row is the hash of its key prefix (the leading
//! columns); all machines compute identical hashes so partition
//! assignment agrees everywhere.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::UInt32Array;
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use furrow_common::{Error, Result};

use crate::value::{value_at, Value};

/// Hash one key tuple.
pub fn hash_key(key: &[Value]) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// Hash of the key prefix (`key_cols` leading columns) of every row.
pub fn row_hashes(batch: &RecordBatch, key_cols: usize) -> Result<Vec<u64>> {
    let key_cols = key_cols.min(batch.num_columns()).max(1);
    if batch.num_columns() == 0 {
        return Ok(vec![0; batch.num_rows()]);
    }
    let mut hashes = Vec::with_capacity(batch.num_rows());
    let mut key = Vec::with_capacity(key_cols);
    for row in 0..batch.num_rows() {
        key.clear();
        for col in 0..key_cols {
            key.push(value_at(batch.column(col), row)?);
        }
        hashes.push(hash_key(&key));
    }
    Ok(hashes)
}

/// Split `batch` into per-partition sub-batches by key hash modulo
/// `partitions`. Entries with no rows are `None`. Row order within one
/// partition follows the input order.
pub fn partition_batch(
    batch: &RecordBatch,
    key_cols: usize,
    partitions: usize,
) -> Result<Vec<Option<RecordBatch>>> {
    if partitions <= 1 {
        return Ok(vec![Some(batch.clone())]);
    }
    let hashes = row_hashes(batch, key_cols)?;
    let mut indices: Vec<Vec<u32>> = vec![Vec::new(); partitions];
    for (row, h) in hashes.iter().enumerate() {
        indices[(*h % partitions as u64) as usize].push(row as u32);
    }
    let mut out = Vec::with_capacity(partitions);
    for part_indices in indices {
        if part_indices.is_empty() {
            out.push(None);
            continue;
        }
        let idx = UInt32Array::from(part_indices);
        let columns = batch
            .columns()
            .iter()
            .map(|c| {
                take(c.as_ref(), &idx, None)
                    .map_err(|e| Error::Fatal(format!("partition take failed: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let taken = RecordBatch::try_new(batch.schema(), columns)
            .map_err(|e| Error::Fatal(format!("partition batch build failed: {e}")))?;
        out.push(Some(taken));
    }
    Ok(out)
}

/// Concatenate batches, preserving order. Errors on schema mismatch.
pub fn concat(schema: &arrow_schema::SchemaRef, batches: &[RecordBatch]) -> Result<RecordBatch> {
    arrow::compute::concat_batches(&Arc::clone(schema), batches)
        .map_err(|e| Error::Fatal(format!("concat batches failed: {e}")))
}
