//! Keyed single-flight execution.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::{Error, Result};

/// Runs at most one successful action per key.
///
/// Concurrent callers for the same key wait for the in-flight action;
/// a successful completion is cached, a failure is not, so the next
/// caller retries. [`OnceMap::forget`] drops the cached completion so
/// a later call re-runs the action (used after cancellation, where the
/// cached outcome reflects an abandoned attempt).
#[derive(Debug, Default)]
pub struct OnceMap<K> {
    cells: Mutex<HashMap<K, Arc<OnceCell<()>>>>,
}

impl<K: Eq + Hash + Clone> OnceMap<K> {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key` unless a prior call already succeeded.
    pub async fn do_once<F, Fut>(&self, key: K, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let cell = {
            let mut cells = self.cells.lock().expect("once map lock");
            Arc::clone(cells.entry(key).or_default())
        };
        cell.get_or_try_init(f).await.map(|_| ())
    }

    /// Forget the completion recorded for `key`.
    pub fn forget(&self, key: &K) {
        let mut cells = self.cells.lock().expect("once map lock");
        cells.remove(key);
    }
}

/// Convert a captured panic payload into a fatal error.
pub fn panic_error(context: &str, payload: Box<dyn std::any::Any + Send>) -> Error {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    Error::Fatal(format!("panic while {context}: {msg}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::OnceMap;
    use crate::error::{Error, Result};

    #[tokio::test]
    async fn runs_once_per_key() {
        let map = OnceMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let count = Arc::clone(&count);
            map.do_once(7_u64, move || async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let map = OnceMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        let attempt = |fail: bool| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::Unavailable("first attempt".into()))
                } else {
                    Ok(())
                }
            }
        };
        let got: Result<()> = map.do_once("k", || attempt(true)).await;
        assert!(got.is_err());
        map.do_once("k", || attempt(false)).await.unwrap();
        map.do_once("k", || attempt(false)).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forget_allows_rerun() {
        let map = OnceMap::new();
        let count = Arc::new(AtomicUsize::new(0));
        let run = || {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        };
        map.do_once(1_u64, run).await.unwrap();
        map.forget(&1);
        map.do_once(1_u64, run).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
