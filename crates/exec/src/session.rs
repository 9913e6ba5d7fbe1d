//! Sessions: the driver-side entry point tying funcs, compilation,
//! evaluation, and result read-back together.

use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use furrow_common::{Result, SessionConfig};
use furrow_frame::{read_all, BatchReader, MultiReader};
use furrow_slice::{invoke, Func, FuncArg, ResultRef, Slice};
use tracing::info;

use crate::cluster::ClusterExecutor;
use crate::compile::{compile, ResultCatalog};
use crate::eval::eval;
use crate::executor::Executor;
use crate::local::LocalExecutor;
use crate::machine::System;
use crate::task::{InvocationHandle, Task};

/// A driver session: invocations run against one executor, and their
/// results remain addressable for the session's lifetime so later
/// invocations can consume them without recomputation.
pub struct Session {
    config: SessionConfig,
    executor: Arc<dyn Executor>,
    results: Mutex<ResultCatalog>,
}

impl Session {
    /// A session evaluating everything in-process.
    ///
    /// Machine combiners are a per-machine shuffle optimization and
    /// are disabled locally.
    pub fn local(mut config: SessionConfig) -> Result<Session> {
        config.machine_combiners = false;
        Ok(Session {
            executor: LocalExecutor::new(config.clone())?,
            config,
            results: Mutex::new(ResultCatalog::new()),
        })
    }

    /// A session evaluating on machines provisioned from `system`.
    /// The system's workers must run with the same session
    /// configuration and func registry as the driver.
    pub fn cluster(system: Arc<dyn System>, config: SessionConfig) -> Session {
        Session {
            executor: ClusterExecutor::new(system, config.clone()),
            config,
            results: Mutex::new(ResultCatalog::new()),
        }
    }

    /// The session's executor.
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    /// Invoke `func` with `args`, evaluate the resulting task graph to
    /// completion, and return a handle over the materialized result.
    pub async fn run(&self, func: &Func, args: Vec<FuncArg>) -> Result<SliceResult> {
        let inv = func.invocation(args);
        let handle = InvocationHandle {
            index: inv.index,
            exclusive: inv.exclusive,
        };
        // Driver-side arguments carry their slices directly; workers
        // resolve invocation references instead.
        let slice = invoke(&inv, &|_| None)?;
        let tasks = {
            let results = self.results.lock().expect("results lock");
            compile(
                Arc::clone(&slice),
                handle,
                self.config.machine_combiners,
                &results,
            )?
        };
        info!(
            invocation = format_args!("{:x}", inv.index),
            roots = tasks.len(),
            "evaluating invocation"
        );
        self.executor.register(inv.clone());
        eval(Arc::clone(&self.executor), &tasks).await?;
        self.results
            .lock()
            .expect("results lock")
            .insert(&slice, tasks.clone());
        Ok(SliceResult {
            invocation: inv.index,
            slice,
            tasks,
            executor: Arc::clone(&self.executor),
        })
    }
}

/// A materialized invocation result: the slice, the tasks holding its
/// output, and the executor that can stream it back.
pub struct SliceResult {
    /// Index of the invocation that produced this result.
    pub invocation: u64,
    slice: Arc<dyn Slice>,
    tasks: Vec<Arc<Task>>,
    executor: Arc<dyn Executor>,
}

impl std::fmt::Debug for SliceResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceResult")
            .field("invocation", &self.invocation)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl SliceResult {
    /// The result's slice.
    pub fn slice(&self) -> Arc<dyn Slice> {
        Arc::clone(&self.slice)
    }

    /// The root tasks holding the result.
    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    /// Pass this result as an argument to a later invocation.
    pub fn as_arg(&self) -> FuncArg {
        FuncArg::Result(ResultRef {
            invocation: self.invocation,
            slice: Arc::clone(&self.slice),
        })
    }

    /// A reader over the result: every root task's partition 0, in
    /// shard order.
    pub fn reader(&self) -> Box<dyn BatchReader> {
        let readers = self
            .tasks
            .iter()
            .map(|task| self.executor.reader(task, 0))
            .collect();
        Box::new(MultiReader::new(readers))
    }

    /// Collect the entire result.
    pub async fn collect(&self) -> Result<Vec<RecordBatch>> {
        read_all(self.reader().as_mut()).await
    }
}
