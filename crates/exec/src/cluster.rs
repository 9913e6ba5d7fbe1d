//! The cluster executor: placing, compiling, and invoking tasks on a
//! machine fleet.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use furrow_common::{BackoffPolicy, Error, Result, SessionConfig};
use furrow_frame::{BatchReader, ErrorReader};
use furrow_slice::{FuncArg, Invocation};
use tracing::debug;

use crate::executor::Executor;
use crate::machine::{MachineManager, SliceMachine, System, TaskRunRequest};
use crate::reader::MachineReader;
use crate::task::{Task, TaskName, TaskState};

struct ClusterInner {
    locations: HashMap<TaskName, Arc<SliceMachine>>,
    invocations: HashMap<u64, Invocation>,
    invocation_deps: HashMap<u64, HashSet<u64>>,
    managers: HashMap<usize, Arc<MachineManager>>,
}

/// Executor running tasks on machines acquired from a [`System`].
///
/// Tasks are offered to one manager per cluster. Even cluster indices
/// share machines under the session max-load; odd indices are the
/// exclusive variants admitting one task per machine. Cluster 0 is the
/// shared default; invocation-exclusive funcs get their own even
/// cluster.
pub struct ClusterExecutor {
    system: Arc<dyn System>,
    config: SessionConfig,
    read_retry: BackoffPolicy,
    inner: Mutex<ClusterInner>,
}

impl ClusterExecutor {
    /// Create an executor over `system`.
    pub fn new(system: Arc<dyn System>, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            system,
            config,
            read_retry: BackoffPolicy::default(),
            inner: Mutex::new(ClusterInner {
                locations: HashMap::new(),
                invocations: HashMap::new(),
                invocation_deps: HashMap::new(),
                managers: HashMap::new(),
            }),
        })
    }

    fn manager(&self, cluster: usize) -> Arc<MachineManager> {
        let mut inner = self.inner.lock().expect("executor lock");
        if let Some(manager) = inner.managers.get(&cluster) {
            return Arc::clone(manager);
        }
        // Odd clusters admit one task per machine at a time.
        let max_load = if cluster % 2 == 1 {
            0.0
        } else {
            self.config.max_load
        };
        let manager = MachineManager::new(
            Arc::clone(&self.system),
            self.config.parallelism,
            max_load,
        );
        inner.managers.insert(cluster, Arc::clone(&manager));
        manager
    }

    fn location(&self, name: &TaskName) -> Option<Arc<SliceMachine>> {
        let inner = self.inner.lock().expect("executor lock");
        inner.locations.get(name).cloned()
    }

    fn set_location(&self, name: &TaskName, machine: Arc<SliceMachine>) {
        let mut inner = self.inner.lock().expect("executor lock");
        inner.locations.insert(name.clone(), machine);
    }

    // Ensure every invocation the task transitively depends on is
    // compiled on `machine`, bottom-up, at most once per
    // (machine, invocation).
    async fn compile_on(&self, machine: &Arc<SliceMachine>, index: u64) -> Result<()> {
        let ordered = {
            let inner = self.inner.lock().expect("executor lock");
            let mut todo = vec![index];
            let mut ordered = Vec::new();
            while let Some(i) = todo.pop() {
                let inv = inner
                    .invocations
                    .get(&i)
                    .ok_or_else(|| Error::Fatal(format!("invalid invocation {i:x}")))?
                    .clone();
                ordered.push(inv);
                if let Some(deps) = inner.invocation_deps.get(&i) {
                    todo.extend(deps.iter().copied());
                }
            }
            ordered
        };
        for inv in ordered.into_iter().rev() {
            let idx = inv.index;
            let rpc = machine.rpc();
            machine
                .compiles
                .do_once(idx, || async move { rpc.compile(inv).await })
                .await?;
        }
        Ok(())
    }

    async fn commit_on(machine: Arc<SliceMachine>, key: String) -> Result<()> {
        debug!(machine = %machine.addr(), key = %key, "committing combine key");
        let rpc = machine.rpc();
        machine
            .commits
            .do_once(key.clone(), || async move {
                rpc.commit_combiner(TaskName::combine_key(&key)).await
            })
            .await
    }

    // Build the run request: the location of every dependent task's
    // output, plus the combine keys that must be committed on their
    // source machines before dispatch.
    #[allow(clippy::type_complexity)]
    fn build_request(
        &self,
        task: &Arc<Task>,
    ) -> Result<(TaskRunRequest, Vec<(Arc<SliceMachine>, String)>)> {
        let inner = self.inner.lock().expect("executor lock");
        let mut machine_indices: HashMap<String, usize> = HashMap::new();
        let mut machines = Vec::new();
        let mut locations = Vec::new();
        let mut commits = Vec::new();
        for dep in &task.deps {
            for i in 0..dep.num_task() {
                let deptask = dep.task(i);
                let depm = inner.locations.get(&deptask.name).ok_or_else(|| {
                    Error::NotExist(format!("task {} has no location", deptask.name))
                })?;
                let addr = depm.addr();
                let j = *machine_indices.entry(addr.clone()).or_insert_with(|| {
                    machines.push(addr);
                    machines.len() - 1
                });
                locations.push(j);
                if !dep.combine_key.is_empty() {
                    commits.push((Arc::clone(depm), dep.combine_key.clone()));
                }
            }
        }
        Ok((
            TaskRunRequest {
                invocation: task.invocation.index,
                name: task.name.clone(),
                machines,
                locations,
            },
            commits,
        ))
    }

    async fn run_task(self: Arc<Self>, task: Arc<Task>) {
        // Use the shared default cluster unless the func or the task
        // pragma demands exclusivity.
        let mut cluster = 0;
        if task.invocation.exclusive {
            cluster = task.invocation.index as usize * 2;
        }
        if task.pragma.exclusive {
            cluster += 1;
        }
        let manager = self.manager(cluster);
        let offer = match manager.offer().await {
            Ok(offer) => offer,
            Err(err) => {
                task.error(err);
                return;
            }
        };
        let machine = Arc::clone(&offer.machine);
        debug!(task = %task.name, machine = %machine.addr(), cluster, "task placed");

        if let Err(err) = self.compile_on(&machine, task.invocation.index).await {
            if err.is_context() {
                // A racing run's cancellation was cached; forget it so
                // a later attempt recompiles.
                machine.compiles.forget(&task.invocation.index);
                task.error(err);
                return;
            }
            if err.is_retryable() {
                // Compilation runs no user code and has no data
                // dependencies, so a transport failure only means the
                // task should be rescheduled.
                debug!(task = %task.name, error = %err, "task lost while compiling func");
                task.set(TaskState::Lost);
                machine.done(Some(&err));
                return;
            }
            machine.done(Some(&err));
            task.error(Error::Fatal(format!(
                "failed to compile invocation on machine {}: {err}",
                machine.addr()
            )));
            return;
        }

        let (req, commits) = match self.build_request(&task) {
            Ok(built) => built,
            Err(err) => {
                task.error(err);
                return;
            }
        };
        let commit_results = futures::future::join_all(
            commits
                .into_iter()
                .map(|(m, key)| Self::commit_on(m, key)),
        )
        .await;
        for result in commit_results {
            if let Err(err) = result {
                task.error(Error::Fatal(format!("failed to commit combiner: {err}")));
                return;
            }
        }

        task.set(TaskState::Running);
        let result = machine.rpc().run(req).await;
        machine.done(result.as_ref().err());
        match result {
            Ok(()) => {
                self.set_location(&task.name, Arc::clone(&machine));
                machine.assign(&task);
                task.set(TaskState::Ok);
            }
            Err(err) if err.is_context() => task.error(err),
            Err(err) if err.is_fatal() => {
                // Fatal errors are not retryable; Unavailable-class
                // errors mean a machine (directly or transitively) is
                // gone and the task can be recomputed.
                task.error(err)
            }
            Err(err) => {
                debug!(task = %task.name, error = %err, "lost task during evaluation");
                task.set(TaskState::Lost);
            }
        }
    }
}

impl Executor for ClusterExecutor {
    fn register(&self, mut inv: Invocation) {
        let mut inner = self.inner.lock().expect("executor lock");
        // Substitute result arguments with invocation references and
        // record the dependency for bottom-up worker compilation.
        let mut deps = HashSet::new();
        for arg in inv.args.iter_mut() {
            if let FuncArg::Result(result) = arg {
                deps.insert(result.invocation);
                *arg = FuncArg::InvocationRef(result.invocation);
            }
        }
        if !deps.is_empty() {
            inner.invocation_deps.insert(inv.index, deps);
        }
        inner.invocations.insert(inv.index, inv);
    }

    fn run(self: Arc<Self>, task: Arc<Task>) {
        tokio::spawn(self.run_task(task));
    }

    fn reader(&self, task: &Task, partition: usize) -> Box<dyn BatchReader> {
        if !task.combine_key.is_empty() {
            return Box::new(ErrorReader::new(Error::InvalidConfig(format!(
                "read {}: cannot read tasks with combine keys",
                task.name
            ))));
        }
        match self.location(&task.name) {
            Some(machine) => Box::new(MachineReader::new(
                machine.rpc(),
                task.name.clone(),
                partition,
                self.read_retry,
            )),
            None => Box::new(ErrorReader::new(Error::NotExist(format!(
                "task {}",
                task.name
            )))),
        }
    }
}
