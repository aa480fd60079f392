use super::Shard;
use nodestore_common::{Address, Error, Result};
use std::collections::HashMap;
use tracing::{debug, warn};

impl Shard {
    /// Physically remove objects from every component.
    ///
    /// Per-address failures are logged and skipped. A failing metabase
    /// delete aborts the call before blob storage is touched. Without a
    /// metabase there are no storage IDs, so only the filesystem tree is
    /// cleaned.
    pub fn delete(&self, addrs: &[Address]) -> Result<()> {
        let mode = self.mode();
        if mode.read_only() {
            return Err(Error::ReadOnly);
        }

        let mut storage_ids = HashMap::with_capacity(addrs.len());
        for addr in addrs {
            if let Some(wc) = &self.write_cache
                && let Err(e) = wc.delete(addr)
                && !e.is_not_found()
            {
                debug!("Can't delete {} from the write-cache: {}", addr, e);
            }

            match self.metabase.storage_id(addr) {
                Ok(storage_id) => {
                    storage_ids.insert(*addr, storage_id.unwrap_or_default());
                }
                Err(Error::MetabaseDisabled) => {
                    storage_ids.insert(*addr, Vec::new());
                }
                Err(e) => debug!("Can't get storage ID of {}: {}", addr, e),
            }
        }

        if !mode.no_metabase() {
            self.metabase.delete(addrs)?;
        }

        for addr in addrs {
            let Some(storage_id) = storage_ids.get(addr) else {
                continue;
            };
            if let Err(e) = self.blobstor.delete(addr, Some(storage_id)) {
                debug!("Can't delete {} from blob storage: {}", addr, e);
            }
        }
        Ok(())
    }

    /// Mark victims as removed by a tombstone.
    ///
    /// Nothing changes if any victim is locked.
    pub fn inhume(&self, tombstone: &Address, victims: &[Address]) -> Result<()> {
        let mode = self.mode();
        if mode.read_only() {
            return Err(Error::ReadOnly);
        }
        if mode.no_metabase() {
            return Err(Error::MetabaseDisabled);
        }

        for victim in victims {
            if self.metabase.is_locked(victim)? {
                return Err(Error::Locked(*victim));
            }
        }

        if let Some(wc) = &self.write_cache {
            for victim in victims {
                if let Err(e) = wc.delete(victim)
                    && !e.is_not_found()
                {
                    warn!("Can't delete {} from the write-cache: {}", victim, e);
                }
            }
        }
        self.metabase.inhume(tombstone, victims)
    }
}
