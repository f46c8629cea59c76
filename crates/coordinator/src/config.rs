use ingest_store::RetryPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Backoff between failed discovery steps; the batch fails once exhausted
    pub step_retry: RetryPolicy,

    /// Batches with at most this many files are discovered inside `finalize`
    pub sync_max_files: usize,

    /// ...and at most this many text files
    pub sync_max_text_files: usize,

    /// Pause between successful scheduled steps
    pub step_interval_ms: u64,

    /// Command queue depth per batch actor
    pub mailbox_capacity: usize,

    /// An actor with no pending work stops after this long without commands;
    /// the next call for its batch reloads the record
    pub idle_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_retry: RetryPolicy::new(1_000, 30_000, 5),
            sync_max_files: 100,
            sync_max_text_files: 200,
            step_interval_ms: 0,
            mailbox_capacity: 64,
            idle_timeout_ms: 300_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.step_retry.validate()?;
        if self.mailbox_capacity == 0 {
            return Err("mailbox_capacity must be positive".to_string());
        }
        if self.idle_timeout_ms == 0 {
            return Err("idle_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}
