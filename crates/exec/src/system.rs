//! In-process machine substrate.
//!
//! Machines are worker instances in this process, reached through the
//! same RPC trait a remote transport would implement. A killed machine
//! keeps its registry entry but fails every call with Unavailable,
//! which is exactly how a lost remote machine presents: readers fail,
//! tasks go lost, and the evaluator recomputes elsewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use furrow_common::{Error, Result, SessionConfig};
use tracing::info;

use crate::machine::{Dialer, MachineRpc, System, TaskRunRequest};
use crate::reader::ByteStream;
use crate::store::{FileStore, SliceInfo};
use crate::task::TaskName;
use crate::worker::Worker;

/// An in-process machine fleet.
pub struct InProcessSystem {
    config: SessionConfig,
    maxprocs: usize,
    keepalive_period: Duration,
    next_index: AtomicUsize,
    machines: Mutex<HashMap<String, Arc<InProcessMachine>>>,
    self_ref: Weak<InProcessSystem>,
}

impl InProcessSystem {
    /// Create a system whose machines carry `maxprocs` processor
    /// slots each.
    pub fn new(config: SessionConfig, maxprocs: usize) -> Arc<Self> {
        Self::with_keepalive(config, maxprocs, Duration::from_secs(10))
    }

    /// Create a system with an explicit keepalive probe interval
    /// (short intervals make loss detection fast in tests).
    pub fn with_keepalive(
        config: SessionConfig,
        maxprocs: usize,
        keepalive_period: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            maxprocs: maxprocs.max(1),
            keepalive_period,
            next_index: AtomicUsize::new(0),
            machines: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// Addresses of every machine started so far, sorted.
    pub fn addrs(&self) -> Vec<String> {
        let machines = self.machines.lock().expect("machines lock");
        let mut addrs: Vec<String> = machines.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Number of machines started so far.
    pub fn machine_count(&self) -> usize {
        self.machines.lock().expect("machines lock").len()
    }

    /// Kill the machine at `addr`: every subsequent call against it
    /// fails with Unavailable. Returns whether a machine was killed.
    pub fn kill(&self, addr: &str) -> bool {
        let machines = self.machines.lock().expect("machines lock");
        match machines.get(addr) {
            Some(machine) => {
                info!(machine = %addr, "killing machine");
                machine.killed.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Dialer for InProcessSystem {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn MachineRpc>> {
        let machines = self.machines.lock().expect("machines lock");
        machines
            .get(addr)
            .map(|m| Arc::clone(m) as Arc<dyn MachineRpc>)
            .ok_or_else(|| Error::Unavailable(format!("no machine at {addr}")))
    }
}

#[async_trait]
impl System for InProcessSystem {
    async fn start_machine(&self) -> Result<Arc<dyn MachineRpc>> {
        let dialer: Arc<dyn Dialer> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::Unavailable("system is shut down".to_string()))?;
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let addr = format!("inproc:{index}");
        let dir = tempfile::Builder::new()
            .prefix("furrow-worker-")
            .tempdir()?;
        let worker = Worker::new(
            addr.clone(),
            self.config.clone(),
            self.maxprocs,
            Arc::new(FileStore::new(dir.path())),
            dialer,
        );
        let machine = Arc::new(InProcessMachine {
            addr: addr.clone(),
            maxprocs: self.maxprocs,
            worker,
            killed: AtomicBool::new(false),
            _dir: dir,
        });
        self.machines
            .lock()
            .expect("machines lock")
            .insert(addr, Arc::clone(&machine));
        Ok(machine as Arc<dyn MachineRpc>)
    }

    fn maxprocs(&self) -> usize {
        self.maxprocs
    }

    fn keepalive_period(&self) -> Duration {
        self.keepalive_period
    }
}

struct InProcessMachine {
    addr: String,
    maxprocs: usize,
    worker: Arc<Worker>,
    killed: AtomicBool,
    _dir: tempfile::TempDir,
}

impl InProcessMachine {
    fn check_alive(&self) -> Result<()> {
        if self.killed.load(Ordering::SeqCst) {
            Err(Error::Unavailable(format!("machine {} is down", self.addr)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MachineRpc for InProcessMachine {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn maxprocs(&self) -> usize {
        self.maxprocs
    }

    async fn compile(&self, inv: furrow_slice::Invocation) -> Result<()> {
        self.check_alive()?;
        self.worker.compile(inv).await
    }

    async fn run(&self, req: TaskRunRequest) -> Result<()> {
        self.check_alive()?;
        self.worker.run(req).await
    }

    async fn stat(&self, name: TaskName, partition: usize) -> Result<SliceInfo> {
        self.check_alive()?;
        self.worker.store().stat(&name, partition).await
    }

    async fn read(
        &self,
        name: TaskName,
        partition: usize,
        offset: u64,
    ) -> Result<Box<dyn ByteStream>> {
        self.check_alive()?;
        self.worker.store().open(&name, partition, offset).await
    }

    async fn commit_combiner(&self, key: TaskName) -> Result<()> {
        self.check_alive()?;
        self.worker.commit_combiner(key).await
    }

    async fn stats(&self) -> Result<HashMap<String, i64>> {
        self.check_alive()?;
        Ok(self.worker.stats())
    }

    async fn func_locations(&self) -> Result<Vec<String>> {
        self.check_alive()?;
        Ok(furrow_slice::func_locations())
    }

    async fn keepalive(&self) -> Result<()> {
        self.check_alive()
    }
}
