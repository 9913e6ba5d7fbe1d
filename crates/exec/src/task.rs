//! Task model: the unit of scheduling.
//!
//! A task is one shard of one operator at runtime. Tasks form a DAG
//! shared between the evaluator, the executor, and (re-compiled) every
//! worker; stable [`TaskName`] identity keys all cross-component maps.
//!
//! State progresses Init → Waiting → Running → Ok and is monotone
//! except for the failure-recovery transitions Ok → Lost (machine
//! loss) and Lost → Init (resubmission). Every transition broadcasts
//! to waiters.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use arrow_schema::SchemaRef;
use furrow_common::{Error, Result};
use furrow_frame::BatchReader;
use furrow_slice::{Combiner, Pragma};
use tokio::sync::watch;
use tracing::debug;

/// Task lifecycle states, ordered by progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// Not yet scheduled.
    Init,
    /// Scheduled, waiting for a machine.
    Waiting,
    /// Executing on a machine.
    Running,
    /// Completed; output is materialized at the task's location.
    Ok,
    /// Output no longer available; the task must be recomputed.
    Lost,
    /// Failed terminally.
    Err,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Init => "INIT",
            TaskState::Waiting => "WAITING",
            TaskState::Running => "RUNNING",
            TaskState::Ok => "OK",
            TaskState::Lost => "LOST",
            TaskState::Err => "ERROR",
        };
        f.write_str(s)
    }
}

/// Stable composite task identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName {
    /// Index of the invocation the task was compiled from. Zero for
    /// combine keys, which are not tied to a single task.
    pub invocation: u64,
    /// Operator identifier within the invocation's graph.
    pub op: String,
    /// Shard number of this task.
    pub shard: usize,
    /// Total shards of the operator.
    pub num_shard: usize,
}

impl TaskName {
    /// The pseudo-name under which a shared combine buffer's output is
    /// stored and read.
    pub fn combine_key(key: &str) -> TaskName {
        TaskName {
            invocation: 0,
            op: key.to_string(),
            shard: 0,
            num_shard: 0,
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num_shard == 0 {
            write!(f, "{}", self.op)
        } else {
            write!(
                f,
                "inv{:x}/{}@{}:{}",
                self.invocation, self.op, self.num_shard, self.shard
            )
        }
    }
}

/// The invocation a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvocationHandle {
    /// Invocation index.
    pub index: u64,
    /// Whether the invocation requires machines dedicated to it.
    pub exclusive: bool,
}

/// A dependency on the outputs of one or more upstream tasks.
#[derive(Clone)]
pub struct TaskDep {
    /// Upstream tasks whose outputs are read.
    pub tasks: Vec<Arc<Task>>,
    /// Partition of each upstream output to read.
    pub partition: usize,
    /// Whether each upstream task becomes its own input reader instead
    /// of being merged into one.
    pub expand: bool,
    /// Shared combine key, when upstream outputs were accumulated into
    /// a machine-wide combine buffer. Empty when unused.
    pub combine_key: String,
}

impl TaskDep {
    /// Number of upstream tasks.
    pub fn num_task(&self) -> usize {
        self.tasks.len()
    }

    /// The `i`-th upstream task.
    pub fn task(&self, i: usize) -> &Arc<Task> {
        &self.tasks[i]
    }
}

/// The operation a task runs: given its materialized input readers (in
/// dependency order, expanded deps contributing one reader per
/// upstream task), returns the task's output stream.
pub type TaskOp = Arc<dyn Fn(Vec<Box<dyn BatchReader>>) -> Box<dyn BatchReader> + Send + Sync>;

/// Outcome of claiming a task for execution on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunClaim {
    /// The caller owns execution of the task.
    Execute,
    /// Another in-flight run owns the task; wait for its outcome.
    Wait,
    /// The task is already Ok.
    Done,
}

struct TaskMut {
    state: TaskState,
    error: Option<Error>,
}

/// A schedulable node of the compiled task graph.
pub struct Task {
    /// Stable identity.
    pub name: TaskName,
    /// The operation producing this task's output.
    pub op: TaskOp,
    /// Output schema. Zero fields marks a sink driven for effect.
    pub schema: SchemaRef,
    /// Fan-out of this task's shuffle: rows are hashed into this many
    /// partitions.
    pub num_partition: usize,
    /// Ordered dependencies.
    pub deps: Vec<TaskDep>,
    /// Combiner applied to this task's output during partitioning.
    pub combiner: Option<Arc<dyn Combiner>>,
    /// Shared combine key for this task's output; empty for per-task
    /// combine buffers (or no combiner).
    pub combine_key: String,
    /// Execution hints.
    pub pragma: Pragma,
    /// Owning invocation.
    pub invocation: InvocationHandle,

    state: Mutex<TaskMut>,
    watch: watch::Sender<TaskState>,
}

impl Task {
    /// Create a task in the initial state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: TaskName,
        op: TaskOp,
        schema: SchemaRef,
        num_partition: usize,
        deps: Vec<TaskDep>,
        combiner: Option<Arc<dyn Combiner>>,
        combine_key: String,
        pragma: Pragma,
        invocation: InvocationHandle,
    ) -> Arc<Task> {
        let (watch, _) = watch::channel(TaskState::Init);
        Arc::new(Task {
            name,
            op,
            schema,
            num_partition,
            deps,
            combiner,
            combine_key,
            pragma,
            invocation,
            state: Mutex::new(TaskMut {
                state: TaskState::Init,
                error: None,
            }),
            watch,
        })
    }

    /// Current state, from a single atomic read.
    pub fn state(&self) -> TaskState {
        self.state.lock().expect("task lock").state
    }

    /// Transition to `state`, broadcasting to waiters.
    pub fn set(&self, state: TaskState) {
        let mut inner = self.state.lock().expect("task lock");
        inner.state = state;
        self.watch.send_replace(state);
    }

    /// Record an error, transitioning to Lost when it is recoverable
    /// (network, unavailable, temporary) and to Err otherwise.
    pub fn error(&self, err: Error) {
        let state = if err.is_retryable() {
            TaskState::Lost
        } else {
            TaskState::Err
        };
        debug!(task = %self.name, state = %state, error = %err, "task error");
        let mut inner = self.state.lock().expect("task lock");
        inner.error = Some(err);
        inner.state = state;
        self.watch.send_replace(state);
    }

    /// The recorded error, if any.
    pub fn err(&self) -> Option<Error> {
        self.state.lock().expect("task lock").error.clone()
    }

    /// Atomically claim the task for scheduling: a Lost task is reset
    /// to Init (resubmission); an Init task moves to Waiting and
    /// `true` is returned. Any other state leaves the task untouched.
    pub fn begin_waiting(&self) -> bool {
        let mut inner = self.state.lock().expect("task lock");
        if inner.state == TaskState::Lost {
            debug!(task = %self.name, "resubmitting lost task");
            inner.state = TaskState::Init;
        }
        if inner.state == TaskState::Init {
            inner.state = TaskState::Waiting;
            self.watch.send_replace(TaskState::Waiting);
            true
        } else {
            false
        }
    }

    /// Atomically claim the task for execution on a worker. Init,
    /// Lost, and Err tasks are revived and claimed (moving to
    /// Running); Waiting and Running tasks are already claimed by an
    /// in-flight run; Ok tasks need no work.
    pub fn claim_run(&self) -> RunClaim {
        let mut inner = self.state.lock().expect("task lock");
        match inner.state {
            TaskState::Lost | TaskState::Err => {
                debug!(task = %self.name, state = %inner.state, "reviving task");
                inner.error = None;
                inner.state = TaskState::Running;
                self.watch.send_replace(TaskState::Running);
                RunClaim::Execute
            }
            TaskState::Init => {
                inner.state = TaskState::Running;
                self.watch.send_replace(TaskState::Running);
                RunClaim::Execute
            }
            TaskState::Waiting | TaskState::Running => RunClaim::Wait,
            TaskState::Ok => RunClaim::Done,
        }
    }

    /// Block until the state differs from `seen`, returning the new
    /// state.
    pub async fn wait_change(&self, seen: TaskState) -> Result<TaskState> {
        let mut rx = self.watch.subscribe();
        let state = *rx
            .wait_for(|s| *s != seen)
            .await
            .map_err(|_| Error::Canceled)?;
        Ok(state)
    }

    /// Block until the state reaches at least `target`, returning the
    /// state observed.
    pub async fn wait_state(&self, target: TaskState) -> Result<TaskState> {
        let mut rx = self.watch.subscribe();
        let state = *rx
            .wait_for(|s| *s >= target)
            .await
            .map_err(|_| Error::Canceled)?;
        Ok(state)
    }

    /// Collect the transitive closure of this task's graph into `all`,
    /// keyed by name.
    pub fn all(self: &Arc<Task>, all: &mut HashMap<TaskName, Arc<Task>>) {
        if all.contains_key(&self.name) {
            return;
        }
        all.insert(self.name.clone(), Arc::clone(self));
        for dep in &self.deps {
            for task in &dep.tasks {
                task.all(all);
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("num_partition", &self.num_partition)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use arrow_schema::Schema;
    use furrow_common::Error;
    use furrow_frame::BatchesReader;
    use furrow_slice::Pragma;

    use super::{InvocationHandle, Task, TaskName, TaskState};

    fn test_task(op: &str) -> Arc<Task> {
        Task::new(
            TaskName {
                invocation: 1,
                op: op.to_string(),
                shard: 0,
                num_shard: 1,
            },
            Arc::new(|_| Box::new(BatchesReader::new(Vec::new()))),
            Arc::new(Schema::empty()),
            1,
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

    #[tokio::test]
    async fn waiters_observe_transitions() {
        let task = test_task("t");
        let waiter = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.wait_state(TaskState::Ok).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.set(TaskState::Waiting);
        task.set(TaskState::Running);
        task.set(TaskState::Ok);
        assert_eq!(waiter.await.unwrap().unwrap(), TaskState::Ok);
    }

    #[tokio::test]
    async fn error_classification_sets_state() {
        let lost = test_task("lost");
        lost.error(Error::Unavailable("machine down".into()));
        assert_eq!(lost.state(), TaskState::Lost);

        let failed = test_task("failed");
        failed.error(Error::Fatal("panic".into()));
        assert_eq!(failed.state(), TaskState::Err);
        assert!(failed.err().unwrap().is_fatal());
    }

    #[tokio::test]
    async fn begin_waiting_claims_once() {
        let task = test_task("claim");
        assert!(task.begin_waiting());
        assert!(!task.begin_waiting());
        assert_eq!(task.state(), TaskState::Waiting);

        task.set(TaskState::Lost);
        assert!(task.begin_waiting());
        assert_eq!(task.state(), TaskState::Waiting);
    }

    #[tokio::test]
    async fn wait_state_returns_past_states() {
        let task = test_task("past");
        task.set(TaskState::Err);
        assert_eq!(
            task.wait_state(TaskState::Ok).await.unwrap(),
            TaskState::Err
        );
    }
}
