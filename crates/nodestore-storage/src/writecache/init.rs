//! Recovery scans run when the cache opens or leaves a mode transition.

use super::{CacheInner, CacheState, WriteCache, decrement};
use crate::fstree::{FsTree, IteratePrm};
use crate::smallstore::SmallStore;
use crate::stop::StopSignal;
use crate::storagelog::{self, WRITE_CACHE};
use nodestore_common::{Address, Error, Result};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::{debug, error, info, warn};

impl CacheInner {
    /// Start both tier scans and the thread that joins them.
    ///
    /// The caller holds the mode lock. The cache becomes initialized once
    /// both scans complete without a stop request.
    pub(super) fn start_recovery(self: &Arc<Self>, state: &CacheState) -> Result<()> {
        let (Some(db), Some(fs)) = (state.db.clone(), state.fs_tree.clone()) else {
            return Ok(());
        };
        let writable = !state.mode.read_only();

        let stop = StopSignal::new();
        *self.stop_init.lock() = stop.clone();
        self.initialized.store(false, Ordering::Release);

        let cache = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("wc-recovery".to_string())
            .spawn(move || cache.run_recovery(db, fs, stop, writable))?;
        *self.init_handle.lock() = Some(handle);
        Ok(())
    }

    fn run_recovery(
        self: Arc<Self>,
        db: Arc<SmallStore>,
        fs: Arc<FsTree>,
        stop: StopSignal,
        writable: bool,
    ) {
        info!("Write-cache recovery started");

        let fs_scan = {
            let cache = Arc::clone(&self);
            let stop = stop.clone();
            thread::Builder::new()
                .name("wc-recovery-fs".to_string())
                .spawn(move || cache.recover_fs_tree(&fs, &stop, writable))
        };
        let db_scan = {
            let cache = Arc::clone(&self);
            let stop = stop.clone();
            thread::Builder::new()
                .name("wc-recovery-db".to_string())
                .spawn(move || cache.recover_small_db(&db, &stop, writable))
        };

        let mut failed = false;
        for (tier, scan) in [("fstree", fs_scan), ("db", db_scan)] {
            let outcome = match scan {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::internal("recovery scan panicked"))),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                error!("Write-cache {} recovery failed: {}", tier, e);
                failed = true;
            }
        }

        if stop.is_stopped() {
            info!("Write-cache recovery interrupted");
            return;
        }
        if failed {
            warn!("Write-cache recovery finished with errors");
        }
        self.initialized.store(true, Ordering::Release);
        info!("Write-cache recovery finished");
    }

    /// Whether main storage holds the object, and whether the cached copy
    /// can be dropped now.
    ///
    /// Removed and expired objects count as flushed.
    pub(super) fn flush_status(&self, addr: &Address, writable: bool) -> (bool, bool) {
        match self.metabase.exists(addr) {
            Err(e) if e.is_removed() => return (true, writable),
            Ok(true) => {}
            Ok(false) => return (false, false),
            Err(e) => {
                debug!("Can't check {} in the metabase: {}", addr, e);
                return (false, false);
            }
        }

        // A failed lookup falls back to searching every sub-storage
        let storage_id = self
            .metabase
            .storage_id(addr)
            .ok()
            .map(Option::unwrap_or_default);
        match self.blobstor.exists(addr, storage_id.as_deref()) {
            Ok(present) => (present, present && writable),
            Err(e) => {
                debug!("Can't check {} in blob storage: {}", addr, e);
                (false, false)
            }
        }
    }

    fn recover_small_db(&self, db: &SmallStore, stop: &StopSignal, writable: bool) -> Result<()> {
        let batch = self.config.flush_batch_size;
        let mut last: Option<String> = None;

        loop {
            if stop.is_stopped() {
                return Ok(());
            }
            let keys = db.keys_from(last.as_deref(), batch)?;
            let Some(tail) = keys.last().cloned() else {
                return Ok(());
            };

            let mut removable = Vec::new();
            for key in keys {
                let addr = match Address::decode_str(&key) {
                    Ok(addr) => addr,
                    Err(e) => {
                        debug!("Skipping undecodable cache key {}: {}", key, e);
                        continue;
                    }
                };
                let (flushed, remove) = self.flush_status(&addr, writable);
                if flushed {
                    self.flushed.insert(key.clone());
                }
                if remove {
                    removable.push(key);
                }
            }

            if !removable.is_empty() {
                match db.delete_batch(&removable) {
                    Ok(()) => {
                        for key in &removable {
                            decrement(&self.db_count);
                            self.flushed.remove(key);
                            storagelog::write(key, WRITE_CACHE, "db DELETE");
                        }
                    }
                    Err(e) => warn!("Can't purge flushed objects from the cache db: {}", e),
                }
            }
            last = Some(tail);
        }
    }

    fn recover_fs_tree(&self, fs: &FsTree, stop: &StopSignal, writable: bool) -> Result<()> {
        let prm = IteratePrm::lazy(|addr, _| {
            if stop.is_stopped() {
                return Err(Error::IterationStopped);
            }
            let (flushed, remove) = self.flush_status(addr, writable);
            if !flushed {
                return Ok(());
            }

            let key = addr.encode_to_string();
            self.flushed.insert(key.clone());
            if remove {
                match fs.delete(addr) {
                    Ok(()) => {
                        decrement(&self.fs_count);
                        self.flushed.remove(&key);
                        self.compress_flags.lock().remove(&key);
                        storagelog::write(&key, WRITE_CACHE, "fstree DELETE");
                    }
                    Err(e) => warn!("Can't purge flushed object {} from the cache fstree: {}", addr, e),
                }
            }
            Ok(())
        })
        .ignore_errors(true);

        match fs.iterate(prm) {
            Err(Error::IterationStopped) => Ok(()),
            res => res,
        }
    }
}

#[cfg(test)]
impl WriteCache {
    /// Stop a running recovery and wait for it to exit.
    ///
    /// Returns true if the cache was left uninitialized.
    pub(crate) fn interrupt_recovery(&self) -> bool {
        self.inner.stop_init.lock().stop();
        if let Some(handle) = self.inner.init_handle.lock().take() {
            handle.join().unwrap();
        }
        !self.is_initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{Fixture, cache_put, object_of};

    #[test]
    fn test_recovery_purges_objects_present_in_main_storage() {
        let f = Fixture::new();
        let confirmed: Vec<_> = [10, 20, 4096].into_iter().map(object_of).collect();
        let inhumed = object_of(30);
        let pending = [object_of(40), object_of(8192)];
        {
            let cache = f.open_cache(f.config());
            for obj in confirmed.iter().chain(&pending).chain([&inhumed]) {
                cache_put(&cache, obj).unwrap();
            }
            assert_eq!(cache.object_counts(), (4, 2));
        }

        for obj in &confirmed {
            f.put_main(obj);
        }
        f.metabase
            .inhume(&object_of(1).address(), &[inhumed.address()])
            .unwrap();

        let cache = f.open_cache(f.config());
        assert_eq!(cache.object_counts(), (1, 1));
        for obj in &pending {
            assert_eq!(cache.get(&obj.address()).unwrap(), *obj);
        }
        for obj in confirmed.iter().chain([&inhumed]) {
            assert!(!cache.exists(&obj.address()).unwrap());
        }
    }

    #[test]
    fn test_flush_status() {
        let f = Fixture::new();
        let cache = f.open_cache(f.config());
        let inner = &cache.inner;

        let stored = object_of(10);
        f.put_main(&stored);
        assert_eq!(inner.flush_status(&stored.address(), true), (true, true));
        assert_eq!(inner.flush_status(&stored.address(), false), (true, false));

        let absent = object_of(10);
        assert_eq!(inner.flush_status(&absent.address(), true), (false, false));

        // Indexed but missing from blob storage
        let lost = object_of(10);
        f.metabase.put(&lost, &[]).unwrap();
        assert_eq!(inner.flush_status(&lost.address(), true), (false, false));

        f.metabase
            .inhume(&object_of(1).address(), &[absent.address()])
            .unwrap();
        assert_eq!(inner.flush_status(&absent.address(), true), (true, true));
    }
}
