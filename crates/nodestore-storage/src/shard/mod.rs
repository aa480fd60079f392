//! Shard: one metabase, one blob store and an optional write-cache.
//!
//! The shard is the single point of mode control. Mode changes are applied
//! to the write-cache first, so its flush can still reach a writable
//! metabase, then to the metabase and the blob store.

mod delete;
mod get;
mod put;

use crate::blobstor::BlobStor;
use crate::writecache::WriteCache;
use nodestore_common::config::ShardConfig;
use nodestore_common::{Address, Error, Mode, Result};
use nodestore_metabase::{EpochState, Metabase};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Local storage unit coordinating its components
pub struct Shard {
    id: Uuid,
    mode: RwLock<Mode>,
    metabase: Arc<Metabase>,
    blobstor: Arc<BlobStor>,
    write_cache: Option<WriteCache>,
}

impl Shard {
    /// Open every component of the shard and apply the configured mode
    pub fn open(config: &ShardConfig, epoch: Arc<dyn EpochState>) -> Result<Self> {
        config.validate()?;

        let metabase = Arc::new(Metabase::open(&config.metabase.path, epoch)?);
        let blobstor = Arc::new(BlobStor::open(&config.blobstor)?);
        let write_cache = config
            .write_cache
            .clone()
            .map(|wc| WriteCache::open(wc, Arc::clone(&metabase), Arc::clone(&blobstor)))
            .transpose()?;

        let shard = Self {
            id: Uuid::new_v4(),
            mode: RwLock::new(Mode::ReadWrite),
            metabase,
            blobstor,
            write_cache,
        };
        if config.mode != Mode::ReadWrite {
            shard.set_mode(config.mode)?;
        }

        info!(
            "Opened shard {} (write-cache: {})",
            shard.id,
            if shard.write_cache.is_some() { "on" } else { "off" }
        );
        Ok(shard)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    pub fn write_cache(&self) -> Option<&WriteCache> {
        self.write_cache.as_ref()
    }

    /// Switch every component to the given mode
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut current = self.mode.write();

        if let Some(wc) = &self.write_cache {
            wc.set_mode(mode)?;
        }
        self.metabase.set_mode(mode)?;
        self.blobstor.set_mode(mode)?;

        *current = mode;
        info!("Shard {} switched to {} mode", self.id, mode);
        Ok(())
    }

    /// Flush the write-cache into main storage
    pub fn flush_write_cache(&self, ignore_errors: bool) -> Result<()> {
        let mode = self.mode();
        if mode.read_only() {
            return Err(Error::ReadOnly);
        }
        if mode.no_metabase() {
            return Err(Error::MetabaseDisabled);
        }
        match &self.write_cache {
            Some(wc) => wc.flush(ignore_errors),
            None => Ok(()),
        }
    }

    /// Objects marked for relocation to another shard
    pub fn movable(&self) -> Result<Vec<Address>> {
        self.metabase.movable()
    }

    pub fn to_move_it(&self, addr: &Address) -> Result<()> {
        self.metabase.to_move_it(addr)
    }

    pub fn do_not_move(&self, addr: &Address) -> Result<()> {
        self.metabase.do_not_move(addr)
    }

    /// Close the write-cache, the metabase and the blob store in order
    pub fn close(&self) {
        if let Some(wc) = &self.write_cache {
            wc.close();
        }
        self.metabase.close();
        self.blobstor.close();
        info!("Closed shard {}", self.id);
    }
}
