use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session-level execution configuration shared by executors and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Target total task slots across the machine fleet.
    pub parallelism: usize,
    /// Cap on concurrent tasks per machine, as a fraction of its procs.
    pub max_load: f64,
    /// Whether shuffle-stage combiners share one accumulator per machine
    /// (a shared combine key) instead of one per task.
    pub machine_combiners: bool,
    /// Target rows per frame pulled through operator pipelines.
    pub chunk_size: usize,
    /// Whether per-task readers are shuffled within one multi-read to
    /// avoid thundering-herd reads. Disable for deterministic tests.
    pub shuffle_readers: bool,
    /// Combine-buffer tuning.
    pub combiner: CombinerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            parallelism: 8,
            max_load: 0.95,
            machine_combiners: false,
            chunk_size: 1024,
            shuffle_readers: true,
            combiner: CombinerConfig::default(),
        }
    }
}

/// Combine-buffer tuning knobs.
///
/// The spill thresholds are heuristics, not derivable from first
/// principles; they are configuration rather than constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CombinerConfig {
    /// Capacity of the in-task combining frame, per partition.
    pub local_capacity: usize,
    /// In-task frame length at which acquiring the shared buffer blocks
    /// instead of being attempted opportunistically.
    pub block_spill_threshold: usize,
    /// Fraction of the in-task frame drained per spill.
    pub spill_fraction: f64,
    /// Shared-buffer capacity as a multiple of the session chunk size.
    pub shared_capacity_factor: usize,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            local_capacity: 16,
            block_spill_threshold: 8,
            spill_fraction: 0.75,
            shared_capacity_factor: 100,
        }
    }
}

/// Exponential backoff policy governing inter-retry delays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Multiplier applied per retry.
    pub factor: f64,
}

impl BackoffPolicy {
    /// Delay before retry number `retries` (1-based).
    pub fn delay(&self, retries: u32) -> Duration {
        let exp = retries.saturating_sub(1).min(32);
        let scaled = self.base.as_secs_f64() * self.factor.powi(exp as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            factor: 1.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BackoffPolicy;
    use std::time::Duration;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
            factor: 2.0,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(10), Duration::from_millis(500));
    }
}
