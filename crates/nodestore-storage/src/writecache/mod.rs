//! Write-back cache in front of the main storage.
//!
//! Objects are buffered in two tiers under the cache directory: small
//! objects in an embedded database (`small.redb`), larger ones in a
//! filesystem tree (`fstree/`). A background loop hands buffered objects to
//! flush workers that write them into the blob store and metabase, and
//! purges entries once they are confirmed flushed.
//!
//! On open, two recovery scans (one per tier) mark objects that already
//! reached main storage. Puts are rejected with `NotInitialized` until both
//! scans finish.

mod flush;
mod init;
mod mode;
mod put;

use crate::blobstor::BlobStor;
use crate::compression::Compressor;
use crate::fstree::FsTree;
use crate::smallstore::SmallStore;
use crate::stop::StopSignal;
use crate::storagelog::{self, WRITE_CACHE};
use crossbeam_channel::{Receiver, Sender};
use dashmap::{DashMap, DashSet};
use flush::FlushTask;
use nodestore_common::config::{FsTreeConfig, WriteCacheConfig};
use nodestore_common::{Address, Error, Mode, Object, Result};
use nodestore_metabase::Metabase;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{error, info};

/// File name of the small-object tier inside the cache directory
const SMALL_DB_NAME: &str = "small.redb";

/// Directory name of the large-object tier inside the cache directory
const FSTREE_DIR_NAME: &str = "fstree";

/// Write-back cache of a shard
pub struct WriteCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    config: WriteCacheConfig,
    metabase: Arc<Metabase>,
    blobstor: Arc<BlobStor>,

    /// Mode lock: operations hold the read side, mode transitions the write side
    state: RwLock<CacheState>,

    /// Set once both recovery scans finished without being stopped
    initialized: AtomicBool,
    stop_init: Mutex<StopSignal>,
    init_handle: Mutex<Option<JoinHandle<()>>>,

    /// Encoded addresses already present in main storage
    flushed: DashSet<String>,
    /// Encoded addresses queued for or being processed by a flush worker.
    /// The worker holds the slot while flushing; a set slot means the
    /// object was deleted from the cache and must not be flushed.
    in_flight: DashMap<String, Arc<Mutex<bool>>>,
    /// Large objects that main storage should compress when flushed
    compress_flags: Mutex<HashSet<String>>,

    db_count: AtomicU64,
    fs_count: AtomicU64,

    flush_tx: Sender<FlushTask>,
    /// Dropped on close; every background thread watches the receiver
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    closed: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

struct CacheState {
    mode: Mode,
    db: Option<Arc<SmallStore>>,
    fs_tree: Option<Arc<FsTree>>,
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

impl WriteCache {
    /// Open the cache directory, start flush workers and recovery scans.
    pub fn open(
        config: WriteCacheConfig,
        metabase: Arc<Metabase>,
        blobstor: Arc<BlobStor>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.path)?;

        let (flush_tx, flush_rx) = crossbeam_channel::bounded(config.flush_workers);
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);

        let inner = Arc::new(CacheInner {
            config,
            metabase,
            blobstor,
            state: RwLock::new(CacheState {
                mode: Mode::ReadWrite,
                db: None,
                fs_tree: None,
            }),
            initialized: AtomicBool::new(false),
            stop_init: Mutex::new(StopSignal::new()),
            init_handle: Mutex::new(None),
            flushed: DashSet::new(),
            in_flight: DashMap::new(),
            compress_flags: Mutex::new(HashSet::new()),
            db_count: AtomicU64::new(0),
            fs_count: AtomicU64::new(0),
            flush_tx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            closed: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });

        {
            let mut state = inner.state.write();
            inner.open_stores(&mut state)?;
            inner.start_recovery(&state)?;
        }

        let threads = inner.spawn_background(&flush_rx)?;
        *inner.threads.lock() = threads;

        info!(
            "Opened write-cache at {} ({} small, {} large objects)",
            inner.config.path.display(),
            inner.db_count.load(Ordering::Relaxed),
            inner.fs_count.load(Ordering::Relaxed)
        );
        Ok(Self { inner })
    }

    /// True once recovery completed
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    /// Objects currently held by the small and the large tier
    pub fn object_counts(&self) -> (u64, u64) {
        (
            self.inner.db_count.load(Ordering::Relaxed),
            self.inner.fs_count.load(Ordering::Relaxed),
        )
    }

    /// Read a cached object, small tier first
    pub fn get(&self, addr: &Address) -> Result<Object> {
        let state = self.inner.state.read();
        if let Some(db) = &state.db {
            if let Some(raw) = db.get(&addr.encode_to_string())? {
                return Object::unmarshal(&raw);
            }
        }
        if let Some(fs) = &state.fs_tree {
            match fs.get(addr) {
                Err(e) if e.is_not_found() => {}
                res => return res,
            }
        }
        Err(Error::NotFound(*addr))
    }

    /// Check whether the object is cached in either tier
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        let state = self.inner.state.read();
        if let Some(db) = &state.db {
            if db.exists(&addr.encode_to_string())? {
                return Ok(true);
            }
        }
        if let Some(fs) = &state.fs_tree {
            return fs.exists(addr);
        }
        Ok(false)
    }

    /// Remove a cached object from whichever tier holds it
    pub fn delete(&self, addr: &Address) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state.read();
        if state.mode.read_only() || state.mode.no_metabase() {
            return Err(Error::ReadOnly);
        }

        let key = addr.encode_to_string();
        // Waits for a worker flushing the object right now
        let slot = inner.in_flight.get(&key).map(|e| Arc::clone(e.value()));
        if let Some(slot) = slot {
            *slot.lock() = true;
        }

        if let Some(db) = &state.db {
            if db.delete(&key)? {
                decrement(&inner.db_count);
                inner.flushed.remove(&key);
                storagelog::write(&key, WRITE_CACHE, "db DELETE");
                return Ok(());
            }
        }
        if let Some(fs) = &state.fs_tree {
            fs.delete(addr)?;
            decrement(&inner.fs_count);
            inner.flushed.remove(&key);
            inner.compress_flags.lock().remove(&key);
            storagelog::write(&key, WRITE_CACHE, "fstree DELETE");
            return Ok(());
        }
        Err(Error::NotFound(*addr))
    }

    /// Stop background work and release the storage handles
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        inner.stop_init.lock().stop();
        if let Some(handle) = inner.init_handle.lock().take() {
            if handle.join().is_err() {
                error!("Write-cache recovery thread panicked");
            }
        }

        drop(inner.close_tx.lock().take());
        for handle in inner.threads.lock().drain(..) {
            if handle.join().is_err() {
                error!("Write-cache background thread panicked");
            }
        }

        let mut state = inner.state.write();
        state.db = None;
        state.fs_tree = None;
        info!("Closed write-cache at {}", inner.config.path.display());
    }
}

impl Drop for WriteCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl CacheInner {
    fn fs_tree_config(&self) -> FsTreeConfig {
        FsTreeConfig {
            path: self.config.path.join(FSTREE_DIR_NAME),
            depth: self.config.fstree_depth,
            no_sync: self.config.no_sync,
            ..FsTreeConfig::default()
        }
    }

    /// Open both tiers and recount the objects they hold
    fn open_stores(&self, state: &mut CacheState) -> Result<()> {
        let db = SmallStore::open(self.config.path.join(SMALL_DB_NAME), self.config.no_sync)?;
        let fs = FsTree::new(&self.fs_tree_config(), Compressor::disabled())?;
        fs.init()?;

        self.db_count.store(db.len()?, Ordering::Relaxed);
        self.fs_count
            .store(fs.number_of_objects()?, Ordering::Relaxed);

        state.db = Some(Arc::new(db));
        state.fs_tree = Some(Arc::new(fs));
        Ok(())
    }
}
