//! Func registry and invocations.
//!
//! A func is a registered, deterministic function from arguments to a
//! slice graph. Funcs are registered identically in every process (the
//! driver and each worker run the same binary), so an invocation, a
//! func index plus arguments, reproduces the same slice graph on any
//! machine that receives it. Prior results are passed by
//! invocation reference on the wire and substituted with the locally
//! materialized slice on the receiving worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use furrow_common::{Error, Result};

use crate::Slice;

/// A slice-producing function over invocation arguments.
pub type SliceFn = Arc<dyn Fn(&[FuncArg]) -> Result<Arc<dyn Slice>> + Send + Sync>;

struct FuncEntry {
    f: SliceFn,
    location: String,
}

fn registry() -> &'static Mutex<Vec<FuncEntry>> {
    static REGISTRY: OnceLock<Mutex<Vec<FuncEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

fn next_invocation_index() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A prior result passed as an argument: the materialized slice plus
/// the invocation that produced it.
#[derive(Clone)]
pub struct ResultRef {
    /// Index of the invocation that produced this result.
    pub invocation: u64,
    /// The materialized slice.
    pub slice: Arc<dyn Slice>,
}

/// One argument of an invocation.
#[derive(Clone)]
pub enum FuncArg {
    /// Integer argument.
    Int(i64),
    /// String argument.
    Str(String),
    /// A prior result. Rewritten to [`FuncArg::InvocationRef`] before
    /// transmission to a worker.
    Result(ResultRef),
    /// Wire form of a prior result; resolved to the local materialized
    /// slice during worker compilation.
    InvocationRef(u64),
}

impl FuncArg {
    /// The slice carried by a result argument.
    pub fn as_slice(&self) -> Result<Arc<dyn Slice>> {
        match self {
            FuncArg::Result(r) => Ok(Arc::clone(&r.slice)),
            FuncArg::InvocationRef(idx) => Err(Error::Fatal(format!(
                "unresolved invocation reference {idx:x}"
            ))),
            _ => Err(Error::Fatal("argument is not a result".to_string())),
        }
    }

    /// The integer carried by an int argument.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            FuncArg::Int(v) => Ok(*v),
            _ => Err(Error::Fatal("argument is not an integer".to_string())),
        }
    }
}

/// A registered slice-producing function.
#[derive(Clone, Copy)]
pub struct Func {
    index: usize,
    exclusive: bool,
}

impl Func {
    /// Register a func. Registration order must be identical in every
    /// process; register funcs at startup, before any session runs.
    #[track_caller]
    pub fn new(f: SliceFn) -> Func {
        let location = std::panic::Location::caller().to_string();
        let mut reg = registry().lock().expect("func registry lock");
        reg.push(FuncEntry { f, location });
        Func {
            index: reg.len() - 1,
            exclusive: false,
        }
    }

    /// Mark the func exclusive: all tasks of its invocations run on
    /// machines dedicated to the invocation.
    pub fn exclusive(mut self) -> Func {
        self.exclusive = true;
        self
    }

    /// Create an invocation of this func with the given arguments.
    pub fn invocation(&self, args: Vec<FuncArg>) -> Invocation {
        Invocation {
            index: next_invocation_index(),
            func: self.index,
            args,
            exclusive: self.exclusive,
        }
    }
}

/// The identified call of a func. Invoking the same invocation on any
/// machine deterministically produces the same slice graph.
#[derive(Clone)]
pub struct Invocation {
    /// Session-unique invocation index.
    pub index: u64,
    /// Registry index of the func.
    pub func: usize,
    /// Arguments, possibly containing invocation references.
    pub args: Vec<FuncArg>,
    /// Whether tasks of this invocation require dedicated machines.
    pub exclusive: bool,
}

/// Invoke `inv`, resolving invocation references through `resolve`
/// (the receiving worker's table of materialized prior results).
pub fn invoke(
    inv: &Invocation,
    resolve: &dyn Fn(u64) -> Option<Arc<dyn Slice>>,
) -> Result<Arc<dyn Slice>> {
    let f = {
        let reg = registry().lock().expect("func registry lock");
        let entry = reg.get(inv.func).ok_or_else(|| {
            Error::Fatal(format!("invalid func index {}", inv.func))
        })?;
        Arc::clone(&entry.f)
    };
    let mut args = Vec::with_capacity(inv.args.len());
    for arg in &inv.args {
        match arg {
            FuncArg::InvocationRef(idx) => {
                let slice = resolve(*idx).ok_or_else(|| {
                    Error::Fatal(format!("invalid invocation reference {idx:x}"))
                })?;
                args.push(FuncArg::Result(ResultRef {
                    invocation: *idx,
                    slice,
                }));
            }
            other => args.push(other.clone()),
        }
    }
    f(&args)
}

/// Source locations of every registered func, in registration order.
/// Used to verify that two processes share an identical registry.
pub fn func_locations() -> Vec<String> {
    registry()
        .lock()
        .expect("func registry lock")
        .iter()
        .map(|e| e.location.clone())
        .collect()
}
