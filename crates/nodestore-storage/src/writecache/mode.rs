use super::{CacheInner, CacheState, WriteCache};
use nodestore_common::{Mode, Result};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Poll period while waiting for queued flush tasks to drain
const DRAIN_POLL: Duration = Duration::from_millis(100);

impl WriteCache {
    pub fn mode(&self) -> Mode {
        self.inner.state.read().mode
    }

    /// Switch the cache mode.
    ///
    /// The mode lock is held for the whole transition. Leaving the metabase
    /// behind flushes everything buffered first; a running recovery is
    /// cancelled and restarted once the stores reopen.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut state = self.inner.state.write();
        self.inner.set_mode_locked(&mut state, mode)
    }
}

impl CacheInner {
    fn set_mode_locked(self: &Arc<Self>, state: &mut CacheState, mode: Mode) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            state.mode = mode;
            return Ok(());
        }

        let disable_metabase = mode.no_metabase();
        if disable_metabase && !state.mode.no_metabase() {
            self.flush_all(state, true)?;
        }

        let restart = !self.initialized.load(Ordering::Acquire);
        self.stop_init.lock().stop();
        if let Some(handle) = self.init_handle.lock().take()
            && handle.join().is_err()
        {
            error!("Write-cache recovery thread panicked");
        }

        state.db = None;
        state.fs_tree = None;

        while !self.flush_tx.is_empty() && !self.closed.load(Ordering::Acquire) {
            info!("Waiting for write-cache flush queue to drain");
            thread::sleep(DRAIN_POLL);
        }

        if disable_metabase {
            state.mode = mode;
            info!("Write-cache switched to {} mode", mode);
            return Ok(());
        }

        self.open_stores(state)?;
        if let Some(fs) = &state.fs_tree {
            fs.set_read_only(mode.read_only());
        }
        state.mode = mode;
        if restart {
            self.start_recovery(state)?;
        }

        info!("Write-cache switched to {} mode", mode);
        Ok(())
    }
}
