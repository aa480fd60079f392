use super::{CacheInner, CacheState, WriteCache};
use crate::storagelog::{self, WRITE_CACHE};
use nodestore_common::{Error, Object, Result};
use std::sync::atomic::Ordering;

impl WriteCache {
    /// Buffer an object.
    ///
    /// Fails with `ReadOnly` when the cache does not accept writes,
    /// `NotInitialized` while recovery is running, `TooLarge` above
    /// `max_object_size` and `OutOfSpace` when the estimated cache usage
    /// would exceed `max_cache_size`. Nothing is written on failure.
    pub fn put(&self, object: &Object, raw: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state.read();
        if state.mode.read_only() || state.mode.no_metabase() {
            return Err(Error::ReadOnly);
        }
        if !inner.initialized.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }

        let size = raw.len() as u64;
        if size > inner.config.max_object_size {
            return Err(Error::TooLarge {
                size,
                max: inner.config.max_object_size,
            });
        }

        if size <= inner.config.small_object_size {
            inner.put_small(&state, object, raw)
        } else {
            inner.put_big(&state, object, raw)
        }
    }
}

impl CacheInner {
    /// Usage estimate from tier counts: every small object is charged a full
    /// `small_object_size`, every large one a full `max_object_size`.
    fn estimate_cache_size(&self) -> u64 {
        let db = self.db_count.load(Ordering::Relaxed);
        let fs = self.fs_count.load(Ordering::Relaxed);
        db.saturating_mul(self.config.small_object_size)
            .saturating_add(fs.saturating_mul(self.config.max_object_size))
    }

    fn check_budget(&self, charge: u64) -> Result<()> {
        if self.estimate_cache_size().saturating_add(charge) > self.config.max_cache_size {
            return Err(Error::OutOfSpace);
        }
        Ok(())
    }

    fn put_small(&self, state: &CacheState, object: &Object, raw: &[u8]) -> Result<()> {
        self.check_budget(self.config.small_object_size)?;
        let db = state.db.as_ref().ok_or(Error::NotInitialized)?;

        let key = object.address().encode_to_string();
        if db.put_batched(&key, raw)? {
            self.db_count.fetch_add(1, Ordering::Relaxed);
        }
        storagelog::write(&key, WRITE_CACHE, "db PUT");
        Ok(())
    }

    fn put_big(&self, state: &CacheState, object: &Object, raw: &[u8]) -> Result<()> {
        self.check_budget(self.config.max_object_size)?;
        let fs = state.fs_tree.as_ref().ok_or(Error::NotInitialized)?;

        let addr = object.address();
        let key = addr.encode_to_string();
        let fresh = !fs.exists(&addr)?;
        fs.put(&addr, raw, true)?;

        if self.blobstor.needs_compression(object.header()) {
            self.compress_flags.lock().insert(key.clone());
        }
        if fresh {
            self.fs_count.fetch_add(1, Ordering::Relaxed);
        }
        storagelog::write(&key, WRITE_CACHE, "fstree PUT");
        Ok(())
    }
}
