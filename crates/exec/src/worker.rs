//! The worker service: task execution, shuffle partitioning, combine
//! buffers, and output serving.
//!
//! A worker compiles invocations locally (so the task graph never
//! crosses the wire), executes tasks against inputs gathered from its
//! own store or streamed from peers, hashes output rows into
//! partitions, and serves partition byte streams to downstream
//! readers.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use arrow::record_batch::RecordBatch;
use furrow_common::{panic_error, BackoffPolicy, Error, OnceMap, Result, SessionConfig, StatsMap};
use furrow_frame::{
    concat, hash_key, partition_batch, rows_from_batch, BatchReader, CountingReader, Encoder,
    MultiReader,
};
use furrow_slice::{invoke, Invocation, Slice};
use futures::FutureExt;
use rand::seq::SliceRandom;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::combiner::SharedCombiner;
use crate::compile::{compile, ResultCatalog};
use crate::machine::{Dialer, TaskRunRequest};
use crate::reader::{MachineReader, StreamBatchReader};
use crate::store::{PartitionSink, Store};
use crate::task::{InvocationHandle, RunClaim, Task, TaskName, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CombinerState {
    Idle(usize),
    Writing,
    Committed,
    Error,
}

struct CombinerEntry {
    state: CombinerState,
    shared: Option<Arc<SharedCombiner>>,
}

/// The worker runtime behind the machine RPC surface.
pub struct Worker {
    addr: String,
    config: SessionConfig,
    store: Arc<dyn Store>,
    dialer: Arc<dyn Dialer>,
    stats: StatsMap,
    read_retry: BackoffPolicy,

    tasks: Mutex<HashMap<u64, HashMap<TaskName, Arc<Task>>>>,
    slices: Mutex<HashMap<u64, Arc<dyn Slice>>>,
    results: Mutex<ResultCatalog>,
    compiles: OnceMap<u64>,

    combiners: Mutex<HashMap<TaskName, CombinerEntry>>,
    combiner_changed: Notify,
    commit_limiter: Arc<Semaphore>,
}

impl Worker {
    /// Create a worker serving `addr`, storing partitions in `store`
    /// and dialing peers through `dialer`. `maxprocs` bounds
    /// concurrent combine-buffer commits.
    pub fn new(
        addr: String,
        config: SessionConfig,
        maxprocs: usize,
        store: Arc<dyn Store>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Worker> {
        Arc::new(Worker {
            addr,
            config,
            store,
            dialer,
            stats: StatsMap::new(),
            read_retry: BackoffPolicy::default(),
            tasks: Mutex::new(HashMap::new()),
            slices: Mutex::new(HashMap::new()),
            results: Mutex::new(ResultCatalog::new()),
            compiles: OnceMap::new(),
            combiners: Mutex::new(HashMap::new()),
            combiner_changed: Notify::new(),
            commit_limiter: Arc::new(Semaphore::new(maxprocs.max(1))),
        })
    }

    /// The worker's store (serves `stat` and `read`).
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// Counter snapshot across tasks run on this worker.
    pub fn stats(&self) -> HashMap<String, i64> {
        self.stats.values()
    }

    /// Compile an invocation, materializing and caching its task
    /// graph. Idempotent per invocation. Invocation references among
    /// the arguments must already be compiled here (the executor
    /// compiles bottom-up).
    pub async fn compile(&self, inv: Invocation) -> Result<()> {
        let index = inv.index;
        self.compiles
            .do_once(index, || async move {
                let handle = InvocationHandle {
                    index: inv.index,
                    exclusive: inv.exclusive,
                };
                let slice = {
                    let slices = &self.slices;
                    let resolve = |idx: u64| slices.lock().expect("slices lock").get(&idx).cloned();
                    match std::panic::catch_unwind(AssertUnwindSafe(|| invoke(&inv, &resolve))) {
                        Ok(result) => result?,
                        Err(payload) => return Err(panic_error("invoking func", payload)),
                    }
                };
                let tasks = {
                    let results = self.results.lock().expect("results lock");
                    compile(
                        Arc::clone(&slice),
                        handle,
                        self.config.machine_combiners,
                        &results,
                    )?
                };
                let mut all = HashMap::new();
                for task in &tasks {
                    task.all(&mut all);
                }
                info!(
                    machine = %self.addr,
                    invocation = format_args!("{index:x}"),
                    tasks = all.len(),
                    "compiled invocation"
                );
                self.tasks
                    .lock()
                    .expect("tasks lock")
                    .insert(index, all);
                self.results
                    .lock()
                    .expect("results lock")
                    .insert(&slice, tasks);
                self.slices
                    .lock()
                    .expect("slices lock")
                    .insert(index, slice);
                Ok(())
            })
            .await
    }

    /// Execute the named task to completion, leaving its partitioned
    /// output in the local store. Concurrent runs of one task
    /// coalesce; a task already Ok returns immediately.
    pub async fn run(&self, req: TaskRunRequest) -> Result<()> {
        let task = {
            let tasks = self.tasks.lock().expect("tasks lock");
            let named = tasks.get(&req.invocation).ok_or_else(|| {
                Error::Fatal(format!("invocation {:x} not compiled", req.invocation))
            })?;
            named
                .get(&req.name)
                .cloned()
                .ok_or_else(|| Error::Fatal(format!("task {} not found", req.name)))?
        };

        match task.claim_run() {
            RunClaim::Done => return Ok(()),
            RunClaim::Wait => {
                debug!(task = %task.name, "already running; waiting for outcome");
                let state = task.wait_state(TaskState::Ok).await?;
                return match task.err() {
                    Some(err) if state != TaskState::Ok => Err(err),
                    _ => Ok(()),
                };
            }
            RunClaim::Execute => {}
        }

        let result = match AssertUnwindSafe(self.execute(&task, &req)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(panic_error(
                &format!("evaluating task {}", task.name),
                payload,
            )),
        };
        match &result {
            Ok(()) => task.set(TaskState::Ok),
            Err(err) => {
                warn!(task = %task.name, error = %err, "task error");
                task.error(err.clone());
            }
        }
        result
    }

    async fn execute(&self, task: &Arc<Task>, req: &TaskRunRequest) -> Result<()> {
        let inputs = self.gather_inputs(task, req).await?;
        let out = (task.op)(inputs);
        if task.combiner.is_some() {
            return self.run_combine(task, out).await;
        }
        if task.schema.fields().is_empty() {
            return drain(out).await;
        }
        write_partitions(
            task,
            out,
            &self.store,
            &self.stats,
            self.config.chunk_size,
        )
        .await
    }

    // Assemble input readers, one per dependency (or per upstream task
    // for expanded dependencies), in dependency order. Local store
    // hits skip the network; remote partitions are stat'ed first and
    // then streamed with retry. Per-task reader order is shuffled to
    // avoid reading partitions sequentially from the same ordered
    // machine list.
    async fn gather_inputs(
        &self,
        task: &Arc<Task>,
        req: &TaskRunRequest,
    ) -> Result<Vec<Box<dyn BatchReader>>> {
        let total_in = self.stats.int("inrecords");
        let read_counter = self.stats.int("read");
        let mut inputs: Vec<Box<dyn BatchReader>> = Vec::new();
        let mut task_index = 0_usize;
        for dep in &task.deps {
            if !dep.combine_key.is_empty() {
                // Outputs were combined machine-wide: read the combine
                // key's committed output once per distinct machine.
                // The executor has already committed those buffers.
                let mut seen = HashSet::new();
                let mut addrs = Vec::new();
                for _ in 0..dep.num_task() {
                    let addr = req.location(task_index).to_string();
                    task_index += 1;
                    if seen.insert(addr.clone()) {
                        addrs.push(addr);
                    }
                }
                let mut readers: Vec<Box<dyn BatchReader>> = Vec::with_capacity(addrs.len());
                for addr in addrs {
                    let machine = self.dialer.dial(&addr).await?;
                    let reader = MachineReader::new(
                        machine,
                        TaskName::combine_key(&dep.combine_key),
                        dep.partition,
                        self.read_retry,
                    );
                    readers.push(Box::new(CountingReader::new(
                        Box::new(reader),
                        read_counter.clone(),
                    )));
                }
                if self.config.shuffle_readers {
                    readers.shuffle(&mut rand::thread_rng());
                }
                inputs.push(Box::new(MultiReader::new(readers)));
            } else {
                let mut readers: Vec<Box<dyn BatchReader>> = Vec::with_capacity(dep.num_task());
                for j in 0..dep.num_task() {
                    let deptask = dep.task(j);
                    if let Ok(info) = self.store.stat(&deptask.name, dep.partition).await {
                        if let Ok(stream) =
                            self.store.open(&deptask.name, dep.partition, 0).await
                        {
                            readers.push(Box::new(StreamBatchReader::new(stream)));
                            total_in.add(info.records);
                            task_index += 1;
                            continue;
                        }
                    }
                    let addr = req.location(task_index).to_string();
                    task_index += 1;
                    let machine = self.dialer.dial(&addr).await?;
                    let info = machine.stat(deptask.name.clone(), dep.partition).await?;
                    total_in.add(info.records);
                    let reader = MachineReader::new(
                        machine,
                        deptask.name.clone(),
                        dep.partition,
                        self.read_retry,
                    );
                    readers.push(Box::new(CountingReader::new(
                        Box::new(reader),
                        read_counter.clone(),
                    )));
                }
                if self.config.shuffle_readers {
                    readers.shuffle(&mut rand::thread_rng());
                }
                if dep.expand {
                    inputs.extend(readers);
                } else {
                    inputs.push(Box::new(MultiReader::new(readers)));
                }
            }
        }
        Ok(inputs)
    }

    // The combine path: rows are hashed into per-partition in-task
    // combining frames; a frame past half capacity spills its
    // compacted contents into the machine-wide shared frame. The
    // shared buffer is acquired opportunistically while the in-task
    // frame is small and blockingly once it has grown.
    async fn run_combine(&self, task: &Arc<Task>, mut input: Box<dyn BatchReader>) -> Result<()> {
        let key = if task.combine_key.is_empty() {
            task.name.clone()
        } else {
            TaskName::combine_key(&task.combine_key)
        };
        let combiner = Arc::clone(task.combiner.as_ref().expect("combine path has combiner"));
        let ccfg = self.config.combiner;
        let shared = {
            let mut map = self.combiners.lock().expect("combiners lock");
            match map.get_mut(&key) {
                Some(entry) => match entry.state {
                    CombinerState::Writing
                    | CombinerState::Committed
                    | CombinerState::Error => {
                        // Committed buffers cannot be written again;
                        // reschedule the task so it lands on a machine
                        // with a fresh buffer.
                        return Err(Error::Temporary(format!(
                            "combine key {key} already committed"
                        )));
                    }
                    CombinerState::Idle(n) => {
                        entry.state = CombinerState::Idle(n + 1);
                        Arc::clone(entry.shared.as_ref().expect("idle combiner has buffers"))
                    }
                },
                None => {
                    let shared = Arc::new(SharedCombiner::new(
                        key.clone(),
                        Arc::clone(&task.schema),
                        Arc::clone(&combiner),
                        task.num_partition,
                        self.config.chunk_size * ccfg.shared_capacity_factor,
                    ));
                    map.insert(
                        key.clone(),
                        CombinerEntry {
                            state: CombinerState::Idle(1),
                            shared: Some(Arc::clone(&shared)),
                        },
                    );
                    shared
                }
            }
        };

        let result = self.combine_loop(task, &mut input, &shared).await;

        {
            let mut map = self.combiners.lock().expect("combiners lock");
            if let Some(entry) = map.get_mut(&key) {
                if let CombinerState::Idle(n) = entry.state {
                    entry.state = CombinerState::Idle(n.saturating_sub(1));
                }
            }
        }
        match result {
            // A task-scoped buffer commits implicitly when its run
            // finishes; shared keys are committed by the executor.
            Ok(()) if task.combine_key.is_empty() => self.commit_combiner(key).await,
            other => other,
        }
    }

    async fn combine_loop(
        &self,
        task: &Arc<Task>,
        input: &mut Box<dyn BatchReader>,
        shared: &Arc<SharedCombiner>,
    ) -> Result<()> {
        let ccfg = self.config.combiner;
        let combiner = Arc::clone(task.combiner.as_ref().expect("combine path has combiner"));
        let nparts = task.num_partition;
        let write_counter = self.stats.int("write");
        let mut local: Vec<crate::combiner::CombiningFrame> = (0..nparts)
            .map(|_| crate::combiner::CombiningFrame::new(Arc::clone(&combiner), ccfg.local_capacity))
            .collect();
        while let Some(batch) = input.read().await? {
            let rows = rows_from_batch(&batch)?;
            let n = rows.len();
            for row in rows {
                let p = (hash_key(&row[..1]) % nparts as u64) as usize;
                local[p].combine_row(&row)?;
                if local[p].len() <= local[p].cap() / 2 {
                    continue;
                }
                let guard = if local[p].len() >= ccfg.block_spill_threshold {
                    Some(shared.acquire(p).await)
                } else {
                    shared.try_acquire(p)
                };
                // Contended and still small: keep accumulating locally.
                let Some(mut guard) = guard else { continue };
                let spilled = local[p].compact(ccfg.spill_fraction);
                guard.combine_rows(&spilled)?;
            }
            write_counter.add(n as i64);
        }
        for (p, frame) in local.iter_mut().enumerate() {
            let rows = frame.drain_all();
            let mut guard = shared.acquire(p).await;
            guard.combine_rows(&rows)?;
        }
        Ok(())
    }

    /// Commit the combine buffer for `key`, publishing its partitions
    /// to the store. Idempotent; concurrent calls for one key coalesce
    /// on the in-flight write.
    pub async fn commit_combiner(&self, key: TaskName) -> Result<()> {
        loop {
            let notified = self.combiner_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let shared = {
                let mut map = self.combiners.lock().expect("combiners lock");
                match map.get_mut(&key) {
                    None => return Err(Error::NotExist(format!("invalid combiner key {key}"))),
                    Some(entry) => match entry.state {
                        CombinerState::Committed => return Ok(()),
                        CombinerState::Error => {
                            return Err(Error::Fatal(format!(
                                "error while writing combine buffer {key}"
                            )))
                        }
                        CombinerState::Writing => None,
                        CombinerState::Idle(0) => {
                            entry.state = CombinerState::Writing;
                            Some(entry.shared.take().expect("idle combiner has buffers"))
                        }
                        CombinerState::Idle(_) => {
                            return Err(Error::Temporary(format!("combiner key {key} busy")))
                        }
                    },
                }
            };
            let Some(shared) = shared else {
                // Another commit is writing; wait for it to finish.
                notified.await;
                continue;
            };
            debug!(machine = %self.addr, key = %key, "committing combine buffer");
            let result = shared
                .write_to_store(Arc::clone(&self.store), Arc::clone(&self.commit_limiter))
                .await;
            {
                let mut map = self.combiners.lock().expect("combiners lock");
                let entry = map.get_mut(&key).expect("writing combiner entry");
                entry.state = match &result {
                    Ok(()) => CombinerState::Committed,
                    Err(_) => CombinerState::Error,
                };
            }
            self.combiner_changed.notify_waiters();
            return result;
        }
    }
}

// Drive a sink task: no output columns, read for effect only.
async fn drain(mut out: Box<dyn BatchReader>) -> Result<()> {
    while out.read().await?.is_some() {}
    Ok(())
}

// A growable byte buffer shared with an encoder, drained to a
// partition sink after each encode.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().expect("buffer lock"))
    }
}

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct PartitionWriter {
    sink: Box<dyn PartitionSink>,
    encoder: Encoder<SharedBuf>,
    buf: SharedBuf,
    pending: Vec<RecordBatch>,
    pending_rows: usize,
    count: i64,
}

impl PartitionWriter {
    async fn flush_pending(&mut self, schema: &arrow_schema::SchemaRef) -> Result<()> {
        if self.pending_rows == 0 {
            return Ok(());
        }
        let batch = if self.pending.len() == 1 {
            self.pending.pop().expect("one pending batch")
        } else {
            concat(schema, &self.pending)?
        };
        self.pending.clear();
        self.pending_rows = 0;
        self.encoder.encode(&batch)?;
        self.sink.write(&self.buf.drain()).await
    }
}

// Partition a task's output stream by key hash and encode each
// partition into the store. Any failure discards every partition not
// yet committed, so no partial partition files remain.
pub(crate) async fn write_partitions(
    task: &Arc<Task>,
    out: Box<dyn BatchReader>,
    store: &Arc<dyn Store>,
    stats: &StatsMap,
    chunk_size: usize,
) -> Result<()> {
    let nparts = task.num_partition;
    let mut parts: Vec<Option<PartitionWriter>> = Vec::with_capacity(nparts);
    for p in 0..nparts {
        let sink = match store.create(&task.name, p).await {
            Ok(sink) => sink,
            Err(err) => {
                discard_all(&mut parts).await;
                return Err(err);
            }
        };
        let buf = SharedBuf::default();
        let encoder = match Encoder::new(buf.clone(), &task.schema) {
            Ok(encoder) => encoder,
            Err(err) => {
                sink.discard().await;
                discard_all(&mut parts).await;
                return Err(err);
            }
        };
        parts.push(Some(PartitionWriter {
            sink,
            encoder,
            buf,
            pending: Vec::new(),
            pending_rows: 0,
            count: 0,
        }));
    }

    match drive_partitions(task, out, &mut parts, stats, chunk_size).await {
        Ok(()) => Ok(()),
        Err(err) => {
            discard_all(&mut parts).await;
            Err(err)
        }
    }
}

async fn drive_partitions(
    task: &Arc<Task>,
    mut out: Box<dyn BatchReader>,
    parts: &mut [Option<PartitionWriter>],
    stats: &StatsMap,
    chunk_size: usize,
) -> Result<()> {
    let nparts = parts.len();
    let scratch = (chunk_size / 100).max(1);
    let write_counter = stats.int("write");
    while let Some(batch) = out.read().await? {
        let rows = batch.num_rows();
        if nparts == 1 {
            let part = parts[0].as_mut().expect("live partition writer");
            part.encoder.encode(&batch)?;
            part.sink.write(&part.buf.drain()).await?;
            part.count += rows as i64;
        } else {
            for (p, sub) in partition_batch(&batch, 1, nparts)?.into_iter().enumerate() {
                let Some(sub) = sub else { continue };
                let part = parts[p].as_mut().expect("live partition writer");
                part.count += sub.num_rows() as i64;
                part.pending_rows += sub.num_rows();
                part.pending.push(sub);
                if part.pending_rows >= scratch {
                    part.flush_pending(&task.schema).await?;
                }
            }
        }
        write_counter.add(rows as i64);
    }
    for slot in parts.iter_mut() {
        let mut part = slot.take().expect("live partition writer");
        if let Err(err) = part.flush_pending(&task.schema).await {
            part.sink.discard().await;
            return Err(err);
        }
        let PartitionWriter {
            mut sink,
            encoder,
            buf,
            count,
            ..
        } = part;
        if let Err(err) = encoder.finish() {
            sink.discard().await;
            return Err(err);
        }
        if let Err(err) = sink.write(&buf.drain()).await {
            sink.discard().await;
            return Err(err);
        }
        sink.commit(count).await?;
    }
    Ok(())
}

async fn discard_all(parts: &mut [Option<PartitionWriter>]) {
    for slot in parts.iter_mut() {
        if let Some(part) = slot.take() {
            part.sink.discard().await;
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
