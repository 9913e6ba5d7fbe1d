//! In-process executor: tasks run in this process against a local
//! store.
//!
//! Used for development and as the reference behavior distributed
//! execution must match: for deterministic user functions the two
//! executors produce equal result multisets.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use furrow_common::{panic_error, Result, SessionConfig, StatsMap};
use furrow_frame::{BatchReader, MultiReader};
use furrow_slice::Invocation;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::executor::Executor;
use crate::reader::StreamBatchReader;
use crate::store::{FileStore, Store};
use crate::task::{Task, TaskName, TaskState};
use crate::worker::write_partitions;

/// Executor that evaluates every task in-process.
pub struct LocalExecutor {
    config: SessionConfig,
    store: Arc<dyn Store>,
    stats: StatsMap,
    slots: Arc<Semaphore>,
    _dir: tempfile::TempDir,
}

impl LocalExecutor {
    /// Create a local executor with `config.parallelism` concurrent
    /// task slots.
    pub fn new(config: SessionConfig) -> Result<Arc<Self>> {
        let dir = tempfile::Builder::new().prefix("furrow-local-").tempdir()?;
        Ok(Arc::new(Self {
            store: Arc::new(FileStore::new(dir.path())),
            slots: Arc::new(Semaphore::new(config.parallelism.max(1))),
            stats: StatsMap::new(),
            config,
            _dir: dir,
        }))
    }

    async fn execute(&self, task: &Arc<Task>) -> Result<()> {
        let mut inputs: Vec<Box<dyn BatchReader>> = Vec::new();
        for dep in &task.deps {
            let mut readers: Vec<Box<dyn BatchReader>> = Vec::with_capacity(dep.num_task());
            for deptask in &dep.tasks {
                readers.push(Box::new(LazyStoreReader::new(
                    Arc::clone(&self.store),
                    deptask.name.clone(),
                    dep.partition,
                )));
            }
            if dep.expand {
                inputs.extend(readers);
            } else {
                inputs.push(Box::new(MultiReader::new(readers)));
            }
        }
        let out = (task.op)(inputs);
        if task.schema.fields().is_empty() {
            let mut out = out;
            while out.read().await?.is_some() {}
            return Ok(());
        }
        // Combiners are a shuffle-volume optimization; locally their
        // tasks partition like any other and the consuming fold
        // performs the reduction.
        write_partitions(task, out, &self.store, &self.stats, self.config.chunk_size).await
    }
}

impl Executor for LocalExecutor {
    fn register(&self, _inv: Invocation) {}

    fn run(self: Arc<Self>, task: Arc<Task>) {
        tokio::spawn(async move {
            let _permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .expect("executor slots closed");
            debug!(task = %task.name, "running task locally");
            task.set(TaskState::Running);
            match AssertUnwindSafe(self.execute(&task)).catch_unwind().await {
                Ok(Ok(())) => task.set(TaskState::Ok),
                Ok(Err(err)) => task.error(err),
                Err(payload) => task.error(panic_error(
                    &format!("evaluating task {}", task.name),
                    payload,
                )),
            }
        });
    }

    fn reader(&self, task: &Task, partition: usize) -> Box<dyn BatchReader> {
        Box::new(LazyStoreReader::new(
            Arc::clone(&self.store),
            task.name.clone(),
            partition,
        ))
    }
}

// Opens its store partition on first read so readers can be built
// synchronously.
struct LazyStoreReader {
    store: Arc<dyn Store>,
    name: TaskName,
    partition: usize,
    inner: Option<StreamBatchReader>,
}

impl LazyStoreReader {
    fn new(store: Arc<dyn Store>, name: TaskName, partition: usize) -> Self {
        Self {
            store,
            name,
            partition,
            inner: None,
        }
    }
}

#[async_trait]
impl BatchReader for LazyStoreReader {
    async fn read(&mut self) -> Result<Option<arrow::record_batch::RecordBatch>> {
        if self.inner.is_none() {
            let stream = self.store.open(&self.name, self.partition, 0).await?;
            self.inner = Some(StreamBatchReader::new(stream));
        }
        self.inner.as_mut().expect("reader opened").read().await
    }
}
