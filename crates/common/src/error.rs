use thiserror::Error;

/// Canonical furrow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`Error::Fatal`]: user-code panics, contract violations, and other
///   failures that must terminate the task (and the evaluation)
/// - [`Error::Unavailable`] / [`Error::Net`] / [`Error::Temporary`]:
///   transport or machine failures from which the evaluator recovers by
///   resubmitting the task
/// - [`Error::NotExist`]: a requested task output is not present
/// - [`Error::Canceled`] / [`Error::Timeout`]: context exhaustion;
///   propagated to the caller without reclassification
/// - [`Error::InvalidConfig`]: session/store/operator contract violations
///   discovered before any user code runs
#[derive(Debug, Error)]
pub enum Error {
    /// A task output, invocation, or combine key is not present.
    #[error("does not exist: {0}")]
    NotExist(String),

    /// A machine or its worker service cannot be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A network-level transport failure.
    #[error("network error: {0}")]
    Net(String),

    /// A transient failure expected to clear on retry.
    #[error("temporary error: {0}")]
    Temporary(String),

    /// A non-retryable failure; ends the task in the error state.
    ///
    /// Examples:
    /// - user-function panic (message carries the captured payload and stack)
    /// - invocation or task lookup contract violations on a worker
    #[error("fatal: {0}")]
    Fatal(String),

    /// The governing context was canceled.
    #[error("canceled")]
    Canceled,

    /// The governing context deadline was exhausted.
    #[error("timeout")]
    Timeout,

    /// Invalid or inconsistent session/store/operator configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the evaluator should reclassify the owning task as lost
    /// and resubmit it, rather than failing the evaluation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Unavailable(_) | Error::Net(_) | Error::Temporary(_) | Error::Io(_)
        )
    }

    /// Whether the error terminates its task unconditionally.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }

    /// Whether the error reflects context cancellation or exhaustion.
    pub fn is_context(&self) -> bool {
        matches!(self, Error::Canceled | Error::Timeout)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::NotExist(m) => Error::NotExist(m.clone()),
            Error::Unavailable(m) => Error::Unavailable(m.clone()),
            Error::Net(m) => Error::Net(m.clone()),
            Error::Temporary(m) => Error::Temporary(m.clone()),
            Error::Fatal(m) => Error::Fatal(m.clone()),
            Error::Canceled => Error::Canceled,
            Error::Timeout => Error::Timeout,
            Error::InvalidConfig(m) => Error::InvalidConfig(m.clone()),
            Error::Io(e) => Error::Net(format!("io error: {e}")),
        }
    }
}

/// Standard furrow result alias.
pub type Result<T> = std::result::Result<T, Error>;
