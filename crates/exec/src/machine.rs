//! Machines and capacity-aware machine management.
//!
//! One manager owns one cluster of machines. Clusters are selected by
//! invocation and task exclusivity: the shared default cluster admits
//! `max_load × maxprocs` concurrent tasks per machine, exclusive
//! clusters admit exactly one. Managers boot machines from the
//! provisioning substrate as load demands, probe keepalive, and mark
//! machines lost on probe failure, transitioning the tasks they host
//! out of Ok so the evaluator recomputes them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use furrow_common::{Error, Result, StatsMap};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::reader::ByteStream;
use crate::store::SliceInfo;
use crate::task::{Task, TaskName, TaskState};

/// How long an erroring machine is passed over before being offered
/// again.
const PROBATION_PERIOD: Duration = Duration::from_secs(30);

/// All data required to run an individual task on a worker.
#[derive(Debug, Clone)]
pub struct TaskRunRequest {
    /// The invocation the task was compiled from.
    pub invocation: u64,
    /// Name of the task within the invocation's graph.
    pub name: TaskName,
    /// Addresses of the machines referenced by `locations`.
    pub machines: Vec<String>,
    /// For the i-th dependent task (in dependency order), the index
    /// into `machines` of the machine holding its output. The task
    /// graph is identical to all viewers, so positional indexing is
    /// unambiguous.
    pub locations: Vec<usize>,
}

impl TaskRunRequest {
    /// Address of the machine holding the `task_index`-th dependent
    /// task's output.
    pub fn location(&self, task_index: usize) -> &str {
        &self.machines[self.locations[task_index]]
    }
}

/// The worker RPC surface. Concrete transports implement this; the
/// in-process system calls the worker directly.
#[async_trait]
pub trait MachineRpc: Send + Sync {
    /// Stable machine address.
    fn addr(&self) -> String;
    /// Number of processor slots on the machine.
    fn maxprocs(&self) -> usize;
    /// Compile an invocation; idempotent per invocation.
    async fn compile(&self, inv: furrow_slice::Invocation) -> Result<()>;
    /// Execute a task to completion.
    async fn run(&self, req: TaskRunRequest) -> Result<()>;
    /// Metadata for a stored partition.
    async fn stat(&self, name: TaskName, partition: usize) -> Result<SliceInfo>;
    /// Stream a stored partition from `offset`.
    async fn read(&self, name: TaskName, partition: usize, offset: u64)
        -> Result<Box<dyn ByteStream>>;
    /// Commit the combine buffer for `key`; idempotent.
    async fn commit_combiner(&self, key: TaskName) -> Result<()>;
    /// Counter snapshot aggregated across tasks run on this machine.
    async fn stats(&self) -> Result<HashMap<String, i64>>;
    /// Func registration locations, for registry verification.
    async fn func_locations(&self) -> Result<Vec<String>>;
    /// Liveness probe.
    async fn keepalive(&self) -> Result<()>;
}

/// Resolves machine addresses to live RPC handles. Workers dial their
/// peers through this to read dependency outputs.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the machine at `addr`.
    async fn dial(&self, addr: &str) -> Result<Arc<dyn MachineRpc>>;
}

/// The machine-provisioning substrate.
#[async_trait]
pub trait System: Dialer {
    /// Acquire a new machine running the worker service.
    async fn start_machine(&self) -> Result<Arc<dyn MachineRpc>>;
    /// Processor slots per machine.
    fn maxprocs(&self) -> usize;
    /// Interval between keepalive probes.
    fn keepalive_period(&self) -> Duration {
        Duration::from_secs(10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Ok,
    Probation,
    Lost,
}

struct MachineMut {
    health: Health,
    probation_until: Option<Instant>,
    running: usize,
    hosted: Vec<Arc<Task>>,
}

/// A managed machine: the RPC handle plus scheduling state.
pub struct SliceMachine {
    rpc: Arc<dyn MachineRpc>,
    capacity: usize,
    stats: StatsMap,
    state: Mutex<MachineMut>,
    /// Per-machine single-flight map of compiled invocations.
    pub compiles: furrow_common::OnceMap<u64>,
    /// Per-machine single-flight map of committed combine keys.
    pub commits: furrow_common::OnceMap<String>,
}

impl SliceMachine {
    fn new(rpc: Arc<dyn MachineRpc>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            rpc,
            capacity,
            stats: StatsMap::new(),
            state: Mutex::new(MachineMut {
                health: Health::Ok,
                probation_until: None,
                running: 0,
                hosted: Vec::new(),
            }),
            compiles: furrow_common::OnceMap::new(),
            commits: furrow_common::OnceMap::new(),
        })
    }

    /// The machine's RPC handle.
    pub fn rpc(&self) -> Arc<dyn MachineRpc> {
        Arc::clone(&self.rpc)
    }

    /// The machine's address.
    pub fn addr(&self) -> String {
        self.rpc.addr()
    }

    /// Per-machine counters ("tasks" tracks concurrent assignments).
    pub fn stats(&self) -> &StatsMap {
        &self.stats
    }

    /// Record that this machine now hosts `task`'s output.
    pub fn assign(&self, task: &Arc<Task>) {
        let mut state = self.state.lock().expect("machine lock");
        state.hosted.push(Arc::clone(task));
    }

    /// Report the outcome of a call against this machine. Errors put
    /// the machine on probation; success clears it.
    pub fn done(&self, err: Option<&Error>) {
        let mut state = self.state.lock().expect("machine lock");
        if state.health == Health::Lost {
            return;
        }
        match err {
            Some(err) if err.is_retryable() => {
                debug!(machine = %self.rpc.addr(), error = %err, "machine on probation");
                state.health = Health::Probation;
                state.probation_until = Some(Instant::now() + PROBATION_PERIOD);
            }
            _ => {
                state.health = Health::Ok;
                state.probation_until = None;
            }
        }
    }

    /// Whether the machine has been marked lost.
    pub fn lost(&self) -> bool {
        self.state.lock().expect("machine lock").health == Health::Lost
    }

    // Mark the machine lost and transition its hosted Ok tasks to
    // Lost so the evaluator recomputes them.
    fn mark_lost(&self) {
        let hosted = {
            let mut state = self.state.lock().expect("machine lock");
            if state.health == Health::Lost {
                return;
            }
            state.health = Health::Lost;
            std::mem::take(&mut state.hosted)
        };
        warn!(machine = %self.rpc.addr(), tasks = hosted.len(), "machine lost");
        for task in hosted {
            if task.state() == TaskState::Ok {
                task.set(TaskState::Lost);
            }
        }
    }

    fn available(&self) -> bool {
        let mut state = self.state.lock().expect("machine lock");
        match state.health {
            Health::Lost => false,
            Health::Probation => {
                let expired = state
                    .probation_until
                    .map(|t| Instant::now() >= t)
                    .unwrap_or(true);
                if expired {
                    state.health = Health::Ok;
                    state.probation_until = None;
                }
                expired && state.running < self.capacity
            }
            Health::Ok => state.running < self.capacity,
        }
    }
}

/// Releases one unit of machine capacity on drop.
pub struct MachineOffer {
    /// The offered machine.
    pub machine: Arc<SliceMachine>,
    notify: Arc<Notify>,
}

impl Drop for MachineOffer {
    fn drop(&mut self) {
        {
            let mut state = self.machine.state.lock().expect("machine lock");
            state.running = state.running.saturating_sub(1);
        }
        self.machine.stats.int("tasks").add(-1);
        self.notify.notify_waiters();
    }
}

struct ManagerMut {
    machines: Vec<Arc<SliceMachine>>,
    starting: usize,
}

/// Capacity-aware allocation of machines to tasks for one cluster.
pub struct MachineManager {
    system: Arc<dyn System>,
    parallelism: usize,
    capacity_per_machine: usize,
    state: Mutex<ManagerMut>,
    notify: Arc<Notify>,
}

impl MachineManager {
    /// Create a manager for a cluster. `max_load` of zero makes the
    /// cluster exclusive: one task per machine at a time.
    pub fn new(system: Arc<dyn System>, parallelism: usize, max_load: f64) -> Arc<Self> {
        let capacity_per_machine = if max_load <= 0.0 {
            1
        } else {
            ((system.maxprocs() as f64) * max_load).ceil().max(1.0) as usize
        };
        Arc::new(Self {
            system,
            parallelism: parallelism.max(1),
            capacity_per_machine,
            state: Mutex::new(ManagerMut {
                machines: Vec::new(),
                starting: 0,
            }),
            notify: Arc::new(Notify::new()),
        })
    }

    /// Wait for a machine with available capacity, booting new
    /// machines while the cluster is under its parallelism target.
    pub async fn offer(self: &Arc<Self>) -> Result<MachineOffer> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before inspecting state so a release
            // between the check and the await is not missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().expect("manager lock");
                if let Some(machine) = state.machines.iter().find(|m| m.available()).cloned() {
                    let mut ms = machine.state.lock().expect("machine lock");
                    ms.running += 1;
                    drop(ms);
                    machine.stats.int("tasks").add(1);
                    return Ok(MachineOffer {
                        machine,
                        notify: Arc::clone(&self.notify),
                    });
                }
                let live = state.machines.iter().filter(|m| !m.lost()).count();
                let capacity = (live + state.starting) * self.capacity_per_machine;
                if capacity < self.parallelism {
                    state.starting += 1;
                    drop(state);
                    self.spawn_boot();
                }
            }
            notified.await;
        }
    }

    fn spawn_boot(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let started = manager.system.start_machine().await;
            {
                let mut state = manager.state.lock().expect("manager lock");
                state.starting = state.starting.saturating_sub(1);
            }
            match started {
                Ok(rpc) => {
                    // A worker with a different func registry would
                    // compile different graphs; refuse it outright.
                    match rpc.func_locations().await {
                        Ok(locs) if locs == furrow_slice::func_locations() => {}
                        Ok(_) => {
                            warn!(machine = %rpc.addr(), "func registry mismatch; dropping machine");
                            manager.notify.notify_waiters();
                            return;
                        }
                        Err(err) => {
                            warn!(machine = %rpc.addr(), error = %err, "machine unreachable at startup");
                            manager.notify.notify_waiters();
                            return;
                        }
                    }
                    info!(machine = %rpc.addr(), "machine started");
                    let machine = SliceMachine::new(rpc, manager.capacity_per_machine);
                    let mut state = manager.state.lock().expect("manager lock");
                    state.machines.push(Arc::clone(&machine));
                    drop(state);
                    manager.spawn_keepalive(machine);
                }
                Err(err) => {
                    warn!(error = %err, "machine start failed");
                }
            }
            manager.notify.notify_waiters();
        });
    }

    fn spawn_keepalive(self: &Arc<Self>, machine: Arc<SliceMachine>) {
        let manager = Arc::clone(self);
        let period = self.system.keepalive_period();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if let Err(err) = machine.rpc().keepalive().await {
                    warn!(machine = %machine.addr(), error = %err, "keepalive failed");
                    machine.mark_lost();
                    let mut state = manager.state.lock().expect("manager lock");
                    state.machines.retain(|m| !Arc::ptr_eq(m, &machine));
                    drop(state);
                    manager.notify.notify_waiters();
                    return;
                }
            }
        });
    }
}
