use std::sync::Arc;

use arrow::array::Int64Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use furrow_common::{Error, Result, SessionConfig, StatsMap};
use furrow_frame::{BatchesReader, BatchReader};
use furrow_slice::Pragma;
use tempfile::tempdir;

use super::write_partitions;
use crate::store::{FileStore, Store};
use crate::task::{InvocationHandle, Task, TaskName};

fn kv_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

fn kv_batch(rows: Vec<(i64, i64)>) -> RecordBatch {
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

fn output_task(op: &str, num_partition: usize) -> Arc<Task> {
    Task::new(
        TaskName {
            invocation: 1,
            op: op.to_string(),
            shard: 0,
            num_shard: 1,
        },
        Arc::new(|_| Box::new(BatchesReader::new(Vec::new()))),
        kv_schema(),
        num_partition,
        Vec::new(),
        None,
        String::new(),
        Pragma::default(),
        InvocationHandle {
            index: 1,
            exclusive: false,
        },
    )
}

// Yields scripted batches then an error.
struct ThenFails {
    batches: Vec<RecordBatch>,
}

#[async_trait]
impl BatchReader for ThenFails {
    async fn read(&mut self) -> Result<Option<RecordBatch>> {
        if self.batches.is_empty() {
            Err(Error::Fatal("operator blew up mid-stream".into()))
        } else {
            Ok(Some(self.batches.remove(0)))
        }
    }
}

#[tokio::test]
async fn partition_counts_sum_to_produced_rows() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path()));
    let task = output_task("t", 7);
    let stats = StatsMap::new();
    let batches = vec![
        kv_batch((0..503).map(|i| (i * 31, i)).collect()),
        kv_batch((0..211).map(|i| (i * 7, i)).collect()),
    ];
    let out = Box::new(BatchesReader::new(batches));
    write_partitions(&task, out, &store, &stats, SessionConfig::default().chunk_size)
        .await
        .unwrap();

    let mut total = 0;
    for p in 0..7 {
        total += store.stat(&task.name, p).await.unwrap().records;
    }
    assert_eq!(total, 503 + 211);
    assert_eq!(stats.values()["write"], 503 + 211);
}

#[tokio::test]
async fn equal_keys_collapse_to_one_partition() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path()));
    let task = output_task("t", 5);
    let out = Box::new(BatchesReader::new(vec![kv_batch(
        (0..100).map(|i| (42, i)).collect(),
    )]));
    write_partitions(&task, out, &store, &StatsMap::new(), 1024)
        .await
        .unwrap();

    let mut populated = 0;
    for p in 0..5 {
        if store.stat(&task.name, p).await.unwrap().records > 0 {
            populated += 1;
        }
    }
    assert_eq!(populated, 1);
}

#[tokio::test]
async fn failure_leaves_no_partial_partitions() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path()));
    let task = output_task("t", 4);
    let out = Box::new(ThenFails {
        batches: vec![kv_batch((0..1000).map(|i| (i, i)).collect())],
    });
    let err = write_partitions(&task, out, &store, &StatsMap::new(), 1024)
        .await
        .unwrap_err();
    assert!(err.is_fatal());

    for p in 0..4 {
        assert!(matches!(
            store.stat(&task.name, p).await,
            Err(Error::NotExist(_))
        ));
    }
    assert_eq!(
        std::fs::read_dir(dir.path()).unwrap().count(),
        0,
        "failed task left files behind"
    );
}

#[tokio::test]
async fn empty_output_commits_empty_partitions() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(FileStore::new(dir.path()));
    let task = output_task("t", 3);
    let out = Box::new(BatchesReader::new(Vec::new()));
    write_partitions(&task, out, &store, &StatsMap::new(), 1024)
        .await
        .unwrap();

    for p in 0..3 {
        let info = store.stat(&task.name, p).await.unwrap();
        assert_eq!(info.records, 0);
        // The stream is a valid empty encoding, not a zero-byte file.
        assert!(info.bytes > 0);
    }
}
