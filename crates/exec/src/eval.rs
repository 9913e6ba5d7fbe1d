//! The evaluator: drives a root set of tasks to completion.
//!
//! The evaluator maintains per-node waitlists so each task update
//! traverses only the required portion of the graph. When a task's
//! waitlist drains, the graph is re-walked from that task, which
//! reconciles state changes that happened between updates (a
//! dependency that slipped from Ok to Lost is re-enqueued then). The
//! evaluator does not watch tasks it is not waiting on, so a lost task
//! needed by a blocked waitlist is only discovered when that waitlist
//! drains; those cases are rare enough not to warrant the complexity
//! of watching everything.
//!
//! Waiting decisions are memoized per scheduling round from a single
//! atomic read of task state, giving each round a consistent view of
//! the graph without locking subgraphs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use furrow_common::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::executor::Executor;
use crate::task::{Task, TaskName, TaskState};

/// Evaluate the graphs rooted at `roots`, dispatching ready tasks to
/// `executor` and rescheduling lost ones, until every root is Ok or a
/// task fails terminally.
pub async fn eval(executor: Arc<dyn Executor>, roots: &[Arc<Task>]) -> Result<()> {
    let mut state = State::new();
    for task in roots {
        state.enqueue(task);
    }
    let (done_tx, mut done_rx) = mpsc::channel::<Arc<Task>>(8);
    // Watchers die with the evaluator: dropping the set cancels them.
    let mut watchers: JoinSet<()> = JoinSet::new();

    while !state.done() {
        while !state.done() && !state.todo() {
            let task = done_rx.recv().await.expect("done channel held open");
            state.return_task(&task);
        }
        for task in state.runnable() {
            if task.begin_waiting() {
                debug!(task = %task.name, "dispatching task");
                Arc::clone(&executor).run(Arc::clone(&task));
            }
            let done_tx = done_tx.clone();
            watchers.spawn(async move {
                // Err means every sender died, which cannot outlive us.
                let _ = task.wait_state(TaskState::Ok).await;
                let _ = done_tx.send(task).await;
            });
        }
    }
    state.into_err()
}

// Evaluation state: the task waitlist (deps/counts), the set of tasks
// scheduled but not yet returned (pending), the set ready to schedule
// (todo), and the per-round memo of waiting decisions.
struct State {
    deps: HashMap<TaskName, HashMap<TaskName, Arc<Task>>>,
    counts: HashMap<TaskName, usize>,
    todo: HashMap<TaskName, Arc<Task>>,
    pending: HashSet<TaskName>,
    wait: HashMap<TaskName, bool>,
    err: Option<Error>,
}

impl State {
    fn new() -> Self {
        Self {
            deps: HashMap::new(),
            counts: HashMap::new(),
            todo: HashMap::new(),
            pending: HashSet::new(),
            wait: HashMap::new(),
            err: None,
        }
    }

    // Enqueue all ready tasks in the graph rooted at `task`,
    // traversing only as much of it as necessary. Returns whether the
    // task still requires work (and so must be waited on).
    fn enqueue(&mut self, task: &Arc<Task>) -> bool {
        if let Some(wait) = self.wait.get(&task.name) {
            return *wait;
        }
        let wait = match task.state() {
            TaskState::Ok | TaskState::Err => false,
            TaskState::Waiting | TaskState::Running => {
                self.schedule(task);
                true
            }
            TaskState::Init | TaskState::Lost => {
                for dep in &task.deps {
                    for deptask in &dep.tasks {
                        if self.enqueue(deptask) {
                            self.add(deptask, task);
                        }
                    }
                }
                if self.ready(task) {
                    self.schedule(task);
                }
                true
            }
        };
        self.wait.insert(task.name.clone(), wait);
        wait
    }

    // Return a pending task, recomputing the state view and scheduling
    // follow-on tasks.
    fn return_task(&mut self, task: &Arc<Task>) {
        assert!(
            self.pending.remove(&task.name),
            "returned task {} was not pending",
            task.name
        );
        // Clear the memo between rounds: task states may have changed.
        self.wait.clear();
        match task.state() {
            TaskState::Err => {
                self.err = Some(task.err().unwrap_or_else(|| {
                    Error::Fatal(format!("task {} failed without an error", task.name))
                }));
            }
            TaskState::Ok => {
                for dst in self.waitlist_done(task) {
                    self.enqueue(&dst);
                }
            }
            TaskState::Lost => {
                // Re-enqueue immediately; the walk either reschedules
                // the task or recurses into lost ancestors.
                self.enqueue(task);
            }
            _ => {
                // Racing with another agent; reschedule until the task
                // reaches an actionable state.
                self.schedule(task);
            }
        }
    }

    // The current set of runnable tasks; drains todo into pending.
    fn runnable(&mut self) -> Vec<Arc<Task>> {
        let tasks: Vec<Arc<Task>> = self.todo.drain().map(|(_, t)| t).collect();
        for task in &tasks {
            self.pending.insert(task.name.clone());
        }
        tasks
    }

    fn todo(&self) -> bool {
        !self.todo.is_empty()
    }

    fn done(&self) -> bool {
        self.err.is_some() || (self.todo.is_empty() && self.pending.is_empty())
    }

    fn into_err(self) -> Result<()> {
        match self.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // Schedule a task unless it is already scheduled or pending.
    fn schedule(&mut self, task: &Arc<Task>) {
        if self.pending.contains(&task.name) {
            return;
        }
        self.todo.insert(task.name.clone(), Arc::clone(task));
    }

    // Record a waitlist edge src → dst.
    fn add(&mut self, src: &Arc<Task>, dst: &Arc<Task>) {
        let entry = self.deps.entry(src.name.clone()).or_default();
        if entry.insert(dst.name.clone(), Arc::clone(dst)).is_none() {
            *self.counts.entry(dst.name.clone()).or_insert(0) += 1;
        }
    }

    // Whether a task has no unsatisfied dependencies.
    fn ready(&self, task: &Arc<Task>) -> bool {
        self.counts.get(&task.name).copied().unwrap_or(0) == 0
    }

    // Drain src's waitlist, returning the tasks that became ready.
    fn waitlist_done(&mut self, src: &Arc<Task>) -> Vec<Arc<Task>> {
        let mut ready = Vec::new();
        if let Some(waiters) = self.deps.remove(&src.name) {
            for (name, dst) in waiters {
                let count = self.counts.entry(name).or_insert(1);
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push(dst);
                }
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use arrow_schema::Schema;
    use furrow_common::Error;
    use furrow_frame::{BatchesReader, BatchReader};
    use furrow_slice::Pragma;

    use super::eval;
    use crate::executor::Executor;
    use crate::task::{InvocationHandle, Task, TaskDep, TaskName, TaskState};

    // Executor that immediately resolves tasks according to a script:
    // the n-th run of a task takes the n-th scripted outcome, repeating
    // the last one.
    struct ScriptedExecutor {
        outcomes: Mutex<HashMap<TaskName, Vec<TaskState>>>,
        runs: Mutex<Vec<TaskName>>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: Vec<(TaskName, Vec<TaskState>)>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                runs: Mutex::new(Vec::new()),
            })
        }

        fn runs(&self) -> Vec<TaskName> {
            self.runs.lock().unwrap().clone()
        }
    }

    impl Executor for ScriptedExecutor {
        fn register(&self, _inv: furrow_slice::Invocation) {}

        fn run(self: Arc<Self>, task: Arc<Task>) {
            self.runs.lock().unwrap().push(task.name.clone());
            let outcome = {
                let mut outcomes = self.outcomes.lock().unwrap();
                let seq = outcomes.get_mut(&task.name).expect("scripted task");
                if seq.len() > 1 {
                    seq.remove(0)
                } else {
                    seq[0]
                }
            };
            tokio::spawn(async move {
                task.set(TaskState::Running);
                match outcome {
                    TaskState::Err => task.error(Error::Fatal("scripted failure".into())),
                    state => task.set(state),
                }
            });
        }

        fn reader(&self, _task: &Task, _partition: usize) -> Box<dyn BatchReader> {
            Box::new(BatchesReader::new(Vec::new()))
        }
    }

    fn name(op: &str) -> TaskName {
        TaskName {
            invocation: 1,
            op: op.to_string(),
            shard: 0,
            num_shard: 1,
        }
    }

    fn task(op: &str, deps: Vec<Arc<Task>>) -> Arc<Task> {
        Task::new(
            name(op),
            Arc::new(|_| Box::new(BatchesReader::new(Vec::new()))),
            Arc::new(Schema::empty()),
            1,
            if deps.is_empty() {
                Vec::new()
            } else {
                vec![TaskDep {
                    tasks: deps,
                    partition: 0,
                    expand: false,
                    combine_key: String::new(),
                }]
            },
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
    async fn evaluates_chain_bottom_up() {
        let a = task("a", Vec::new());
        let b = task("b", vec![Arc::clone(&a)]);
        let c = task("c", vec![Arc::clone(&b)]);
        let exec = ScriptedExecutor::new(vec![
            (name("a"), vec![TaskState::Ok]),
            (name("b"), vec![TaskState::Ok]),
            (name("c"), vec![TaskState::Ok]),
        ]);
        eval(Arc::clone(&exec) as Arc<dyn Executor>, &[Arc::clone(&c)])
            .await
            .unwrap();
        assert_eq!(exec.runs(), vec![name("a"), name("b"), name("c")]);
        assert_eq!(c.state(), TaskState::Ok);
    }

    #[tokio::test]
    async fn resubmits_lost_tasks() {
        let a = task("a", Vec::new());
        let exec = ScriptedExecutor::new(vec![(
            name("a"),
            vec![TaskState::Lost, TaskState::Lost, TaskState::Ok],
        )]);
        eval(Arc::clone(&exec) as Arc<dyn Executor>, &[Arc::clone(&a)])
            .await
            .unwrap();
        assert_eq!(exec.runs().len(), 3);
        assert_eq!(a.state(), TaskState::Ok);
    }

    #[tokio::test]
    async fn lost_dependency_is_recomputed() {
        // b depends on a. a completes, then while b runs it is lost;
        // when b reports lost, the evaluator re-walks and re-runs a.
        let a = task("a", Vec::new());
        let b = task("b", vec![Arc::clone(&a)]);

        struct LossyExecutor {
            a: Arc<Task>,
            b_runs: Mutex<usize>,
        }

        impl Executor for LossyExecutor {
            fn register(&self, _inv: furrow_slice::Invocation) {}

            fn run(self: Arc<Self>, task: Arc<Task>) {
                let is_b = task.name.op == "b";
                let a = Arc::clone(&self.a);
                let first_b = {
                    let mut runs = self.b_runs.lock().unwrap();
                    if is_b {
                        *runs += 1;
                    }
                    is_b && *runs == 1
                };
                tokio::spawn(async move {
                    task.set(TaskState::Running);
                    if first_b {
                        // The machine holding a's output died mid-run.
                        a.set(TaskState::Lost);
                        task.set(TaskState::Lost);
                    } else {
                        task.set(TaskState::Ok);
                    }
                });
            }

            fn reader(&self, _task: &Task, _partition: usize) -> Box<dyn BatchReader> {
                Box::new(BatchesReader::new(Vec::new()))
            }
        }

        let exec = Arc::new(LossyExecutor {
            a: Arc::clone(&a),
            b_runs: Mutex::new(0),
        });
        eval(exec as Arc<dyn Executor>, &[Arc::clone(&b)])
            .await
            .unwrap();
        assert_eq!(a.state(), TaskState::Ok);
        assert_eq!(b.state(), TaskState::Ok);
    }

    #[tokio::test]
    async fn first_error_stops_evaluation() {
        let a = task("a", Vec::new());
        let exec = ScriptedExecutor::new(vec![(name("a"), vec![TaskState::Err])]);
        let err = eval(exec as Arc<dyn Executor>, &[a]).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn shared_dependency_runs_once() {
        let a = task("a", Vec::new());
        let b = task("b", vec![Arc::clone(&a)]);
        let c = task("c", vec![Arc::clone(&a)]);
        let exec = ScriptedExecutor::new(vec![
            (name("a"), vec![TaskState::Ok]),
            (name("b"), vec![TaskState::Ok]),
            (name("c"), vec![TaskState::Ok]),
        ]);
        eval(Arc::clone(&exec) as Arc<dyn Executor>, &[b, c])
            .await
            .unwrap();
        let a_runs = exec.runs().iter().filter(|n| n.op == "a").count();
        assert_eq!(a_runs, 1);
    }
}
