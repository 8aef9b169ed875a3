//! Engine tuning knobs.

use std::time::Duration;

/// Configuration for a [`crate::SyncEngine`].
///
/// The defaults match what the engine was tuned against in practice; tests
/// mostly shrink the delays to keep runs fast.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the well-known remote root folder to sync under.
    pub root_folder_name: String,
    /// Remote folder name holding binary attachments; skipped entirely.
    pub attachments_dir: String,
    /// How long a cached listing or content entry stays fresh.
    pub cache_ttl: Duration,
    /// Entries larger than this are kept in memory only.
    pub max_entry_bytes: usize,
    /// Durable cache budget; `cleanup` evicts down toward this.
    pub max_cache_bytes: u64,
    /// Notes fetched per content batch.
    pub batch_size: usize,
    /// Remote requests allowed in flight at once.
    pub concurrency_limit: usize,
    /// Pause after each queued request completes.
    pub request_delay: Duration,
    /// Pause between content batches.
    pub batch_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root_folder_name: "Notes".to_string(),
            attachments_dir: "Images".to_string(),
            cache_ttl: Duration::from_secs(5 * 60),
            max_entry_bytes: 3 * 1024 * 1024,
            max_cache_bytes: 50 * 1024 * 1024,
            batch_size: 10,
            concurrency_limit: 3,
            request_delay: Duration::from_millis(100),
            batch_delay: Duration::from_millis(100),
        }
    }
}

impl SyncConfig {
    /// A config with all pacing delays removed, for tests.
    #[cfg(test)]
    pub(crate) fn immediate() -> Self {
        Self {
            request_delay: Duration::ZERO,
            batch_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}
