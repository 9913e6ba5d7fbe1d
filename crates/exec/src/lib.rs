//! Distributed task evaluation and the worker runtime.
//!
//! Architecture role:
//! - [`compile`]: slice graphs → task graphs (pipelining, shuffle
//!   cuts, prior-result reuse)
//! - [`eval`]: the failure-recovering graph walker driving tasks
//!   through their state machine
//! - [`machine`]: capacity-aware machine management over an abstract
//!   provisioning substrate
//! - [`worker`]: task execution, shuffle partitioning, combine
//!   buffers, and partition serving
//! - [`cluster`] / [`local`]: the two executors
//! - [`store`], [`reader`], [`combiner`]: partition storage, resumable
//!   remote reads, combine-buffer plumbing
//! - [`session`]: the driver entry point
//!
//! The in-process substrate in [`system`] stands in for a real
//! transport; production systems implement [`machine::System`] and
//! [`machine::MachineRpc`] over theirs.

pub mod cluster;
pub mod combiner;
pub mod compile;
pub mod eval;
pub mod executor;
pub mod local;
pub mod machine;
pub mod reader;
pub mod session;
pub mod store;
pub mod system;
pub mod task;
pub mod worker;

pub use cluster::ClusterExecutor;
pub use compile::{compile as compile_slice, ResultCatalog};
pub use eval::eval;
pub use executor::Executor;
pub use local::LocalExecutor;
pub use machine::{Dialer, MachineManager, MachineRpc, System, TaskRunRequest};
pub use reader::{ByteStream, MachineReader, OpenerAt, RetryReader};
pub use session::{Session, SliceResult};
pub use store::{FileStore, PartitionSink, SliceInfo, Store};
pub use system::InProcessSystem;
pub use task::{InvocationHandle, RunClaim, Task, TaskDep, TaskName, TaskState};
pub use worker::Worker;
