//! Named counters aggregated across tasks and machines.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// A shared handle to one named counter.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicI64>);

impl Counter {
    /// Add `n` to the counter.
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current counter value.
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A map of named counters. Cloning shares the underlying counters.
#[derive(Clone, Debug, Default)]
pub struct StatsMap {
    counters: Arc<Mutex<HashMap<String, Counter>>>,
}

impl StatsMap {
    /// Create an empty stats map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter registered under `name`, creating it if needed.
    pub fn int(&self, name: &str) -> Counter {
        let mut counters = self.counters.lock().expect("stats lock");
        counters.entry(name.to_string()).or_default().clone()
    }

    /// Snapshot of every counter value.
    pub fn values(&self) -> HashMap<String, i64> {
        let counters = self.counters.lock().expect("stats lock");
        counters.iter().map(|(k, c)| (k.clone(), c.get())).collect()
    }

    /// Merge another snapshot into this map, summing counters by name.
    pub fn add_all(&self, values: &HashMap<String, i64>) {
        for (name, v) in values {
            self.int(name).add(*v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StatsMap;

    #[test]
    fn counters_accumulate_and_merge() {
        let stats = StatsMap::new();
        stats.int("read").add(5);
        stats.int("read").add(3);
        stats.int("write").add(1);
        assert_eq!(stats.values()["read"], 8);
        assert_eq!(stats.values()["write"], 1);

        let other = StatsMap::new();
        other.add_all(&stats.values());
        other.int("read").add(2);
        assert_eq!(other.values()["read"], 10);
    }
}
