//! Source of the current network epoch

use std::sync::atomic::{AtomicU64, Ordering};

/// Provides the current epoch for expiration checks.
pub trait EpochState: Send + Sync {
    fn current_epoch(&self) -> u64;
}

impl EpochState for AtomicU64 {
    fn current_epoch(&self) -> u64 {
        self.load(Ordering::Relaxed)
    }
}
