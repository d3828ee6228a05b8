use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The two background worker kinds. Each is a unique, single-flight job;
/// they may run concurrently with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    DataSync,
    MediaUpload,
}

/// Outcome of one worker invocation. The invocation as a whole is reported
/// failed when any mutation in the batch failed to reach a terminal success
/// state, so the hosting scheduler can apply its retry policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerSummary {
    /// Mutations the run attempted.
    pub processed: usize,
    /// Mutations that ended in a failure state this run.
    pub failed: usize,
    /// Mutations handed off to the media phase (data-phase runs only).
    pub routed_to_media: usize,
}

impl WorkerSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Backoff policy for re-enqueueing media uploads that are awaiting retry.
/// The engine only defines the lawful retry edge; cadence is decided by the
/// caller using this policy (typically on a connectivity-regained or timer
/// trigger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: 30,
            max_delay_secs: 1800,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for the given retry count, capped at the maximum.
    pub fn delay_for(&self, retry_count: i64) -> Duration {
        let capped_retries = retry_count.clamp(0, 32) as u32;
        let factor = u64::from(self.multiplier).saturating_pow(capped_retries);
        let secs = self
            .initial_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Most mutations one data-phase run will attempt.
    pub data_batch_limit: usize,
    /// Most mutations one media-phase run will attempt.
    pub media_batch_limit: usize,
    pub media_retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_batch_limit: 1000,
            media_batch_limit: 100,
            media_retry: RetryPolicy::default(),
        }
    }
}
