//! Dynamic row values used for hashing, routing, and combining.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Float64Array, Float64Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use furrow_common::{Error, Result};

/// One cell of a row, covering the column types the shuffle and combine
/// paths route on.
#[derive(Debug, Clone)]
pub enum Value {
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float, compared and hashed by bit pattern.
    Float64(f64),
    /// UTF-8 string.
    Utf8(String),
    /// Boolean.
    Boolean(bool),
    /// Null of any type.
    Null,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => a == b,
            // Bit equality, consistent with hashing.
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Null, Self::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Int64(v) => {
                0_u8.hash(state);
                v.hash(state);
            }
            Self::Float64(v) => {
                1_u8.hash(state);
                v.to_bits().hash(state);
            }
            Self::Utf8(v) => {
                2_u8.hash(state);
                v.hash(state);
            }
            Self::Boolean(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
            Self::Null => 4_u8.hash(state),
        }
    }
}

/// Read cell `row` of `array` into a [`Value`].
pub fn value_at(array: &ArrayRef, row: usize) -> Result<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    match array.data_type() {
        DataType::Int64 => {
            let a = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| Error::Fatal("int64 column downcast failed".to_string()))?;
            Ok(Value::Int64(a.value(row)))
        }
        DataType::Float64 => {
            let a = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| Error::Fatal("float64 column downcast failed".to_string()))?;
            Ok(Value::Float64(a.value(row)))
        }
        DataType::Utf8 => {
            let a = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| Error::Fatal("utf8 column downcast failed".to_string()))?;
            Ok(Value::Utf8(a.value(row).to_string()))
        }
        DataType::Boolean => {
            let a = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| Error::Fatal("boolean column downcast failed".to_string()))?;
            Ok(Value::Boolean(a.value(row)))
        }
        other => Err(Error::InvalidConfig(format!(
            "unsupported column type for row values: {other}"
        ))),
    }
}

/// Materialize every row of `batch` as a vector of values.
pub fn rows_from_batch(batch: &RecordBatch) -> Result<Vec<Vec<Value>>> {
    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut cells = Vec::with_capacity(batch.num_columns());
        for col in batch.columns() {
            cells.push(value_at(col, row)?);
        }
        rows.push(cells);
    }
    Ok(rows)
}

/// Build a batch from value rows under `schema`. Rows must match the
/// schema's column count and types.
pub fn rows_to_batch(schema: &SchemaRef, rows: &[Vec<Value>]) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (idx, field) in schema.fields().iter().enumerate() {
        let column: ArrayRef = match field.data_type() {
            DataType::Int64 => {
                let mut b = Int64Builder::with_capacity(rows.len());
                for row in rows {
                    match &row[idx] {
                        Value::Int64(v) => b.append_value(*v),
                        Value::Null => b.append_null(),
                        other => {
                            return Err(Error::Fatal(format!(
                                "value {other:?} does not fit int64 column '{}'",
                                field.name()
                            )))
                        }
                    }
                }
                Arc::new(b.finish())
            }
            DataType::Float64 => {
                let mut b = Float64Builder::with_capacity(rows.len());
                for row in rows {
                    match &row[idx] {
                        Value::Float64(v) => b.append_value(*v),
                        Value::Int64(v) => b.append_value(*v as f64),
                        Value::Null => b.append_null(),
                        other => {
                            return Err(Error::Fatal(format!(
                                "value {other:?} does not fit float64 column '{}'",
                                field.name()
                            )))
                        }
                    }
                }
                Arc::new(b.finish())
            }
            DataType::Utf8 => {
                let mut b = StringBuilder::new();
                for row in rows {
                    match &row[idx] {
                        Value::Utf8(v) => b.append_value(v),
                        Value::Null => b.append_null(),
                        other => {
                            return Err(Error::Fatal(format!(
                                "value {other:?} does not fit utf8 column '{}'",
                                field.name()
                            )))
                        }
                    }
                }
                Arc::new(b.finish())
            }
            DataType::Boolean => {
                let mut b = BooleanBuilder::new();
                for row in rows {
                    match &row[idx] {
                        Value::Boolean(v) => b.append_value(*v),
                        Value::Null => b.append_null(),
                        other => {
                            return Err(Error::Fatal(format!(
                                "value {other:?} does not fit boolean column '{}'",
                                field.name()
                            )))
                        }
                    }
                }
                Arc::new(b.finish())
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported column type for row values: {other}"
                )))
            }
        };
        columns.push(column);
    }
    RecordBatch::try_new(Arc::clone(schema), columns)
        .map_err(|e| Error::Fatal(format!("row batch build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};

    use super::{rows_from_batch, rows_to_batch, Value};

    #[test]
    fn roundtrips_rows() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Utf8, true),
            Field::new("v", DataType::Int64, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
                Arc::new(Int64Array::from(vec![1_i64, 2, 3])),
            ],
        )
        .unwrap();
        let rows = rows_from_batch(&batch).unwrap();
        assert_eq!(rows[1][0], Value::Null);
        assert_eq!(rows[2][1], Value::Int64(3));
        let rebuilt = rows_to_batch(&schema, &rows).unwrap();
        assert_eq!(rebuilt, batch);
    }
}
