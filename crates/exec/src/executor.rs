//! The executor contract used by the evaluator.

use std::sync::Arc;

use furrow_frame::BatchReader;
use furrow_slice::Invocation;

use crate::task::Task;

/// Runs single tasks, partitions their outputs, and serves readers
/// over any task's output.
pub trait Executor: Send + Sync {
    /// Make an invocation known to the executor before its tasks are
    /// evaluated. Result-typed arguments are rewritten to invocation
    /// references and recorded as compile-time dependencies.
    fn register(&self, inv: Invocation);

    /// Run a task. The task enters in the Waiting state; the executor
    /// advances its state as it progresses and leaves it at Ok, Lost,
    /// or Err. Run returns immediately; completion is observed through
    /// the task's state.
    fn run(self: Arc<Self>, task: Arc<Task>);

    /// A reader over partition `partition` of `task`'s output.
    /// Problems surface through the returned reader, not here.
    fn reader(&self, task: &Task, partition: usize) -> Box<dyn BatchReader>;
}
