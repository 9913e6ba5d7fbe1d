//! Shared fixtures for execution tests.
#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use furrow_common::Error;
use furrow_frame::Value;
use furrow_slice::{Combiner, FnCombiner};

pub fn int_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]))
}

pub fn string_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]))
}

pub fn kv_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

pub fn int_batch(values: Vec<i64>) -> RecordBatch {
    RecordBatch::try_new(int_schema(), vec![Arc::new(Int64Array::from(values))]).unwrap()
}

pub fn string_batch(values: Vec<String>) -> RecordBatch {
    RecordBatch::try_new(string_schema(), vec![Arc::new(StringArray::from(values))]).unwrap()
}

pub fn kv_batch(rows: Vec<(i64, i64)>) -> RecordBatch {
    let (keys, values): (Vec<_>, Vec<_>) = rows.into_iter().unzip();
    RecordBatch::try_new(
        kv_schema(),
        vec![
            Arc::new(Int64Array::from(keys)),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .unwrap()
}

/// Every int64 of column `col` across `batches`, sorted.
pub fn sorted_ints(batches: &[RecordBatch], col: usize) -> Vec<i64> {
    let mut out = Vec::new();
    for batch in batches {
        let a = batch
            .column(col)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        out.extend(a.values().iter().copied());
    }
    out.sort_unstable();
    out
}

/// Every string of column `col` across `batches`, sorted.
pub fn sorted_strings(batches: &[RecordBatch], col: usize) -> Vec<String> {
    let mut out = Vec::new();
    for batch in batches {
        let a = batch
            .column(col)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8 column");
        out.extend((0..a.len()).map(|i| a.value(i).to_string()));
    }
    out.sort();
    out
}

/// Sorted (key, value) pairs across `batches`.
pub fn sorted_pairs(batches: &[RecordBatch]) -> Vec<(i64, i64)> {
    let mut out = Vec::new();
    for batch in batches {
        let k = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 keys");
        let v = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 values");
        out.extend((0..batch.num_rows()).map(|i| (k.value(i), v.value(i))));
    }
    out.sort_unstable();
    out
}

pub fn sum_combiner() -> Arc<dyn Combiner> {
    Arc::new(FnCombiner(|acc: &mut [Value], row: &[Value]| {
        match (&acc[0], &row[0]) {
            (Value::Int64(a), Value::Int64(b)) => {
                acc[0] = Value::Int64(a + b);
                Ok(())
            }
            other => Err(Error::Fatal(format!("summing non-integers: {other:?}"))),
        }
    }))
}

/// Batch transform formatting an int column as strings.
pub fn int_to_string(batch: &RecordBatch) -> furrow_common::Result<RecordBatch> {
    let v = batch
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| Error::Fatal("expected int64 column".into()))?;
    let out: StringArray = v.iter().map(|x| x.map(|x| x.to_string())).collect();
    RecordBatch::try_new(string_schema(), vec![Arc::new(out)])
        .map_err(|e| Error::Fatal(e.to_string()))
}
