//! Moving buffered objects into main storage.
//!
//! A flush loop wakes every `flush_interval_ms`, purges entries already
//! marked flushed and queues the rest for the worker pool. Workers write
//! each object into the blob store and then the metabase.

use super::{CacheInner, CacheState, WriteCache, decrement};
use crate::fstree::{FsTree, IteratePrm};
use crate::smallstore::SmallStore;
use crate::storagelog::{self, WRITE_CACHE};
use crossbeam_channel::{Receiver, select, tick};
use nodestore_common::{Address, Error, Object, Result};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Cache tier an object was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tier {
    Small,
    Large,
}

/// Object handed to a flush worker
pub(super) struct FlushTask {
    key: String,
    raw: Vec<u8>,
    tier: Tier,
}

impl WriteCache {
    /// Synchronously write every unflushed object into main storage.
    ///
    /// With `ignore_errors` failed objects are logged and skipped, otherwise
    /// the first failure is returned.
    pub fn flush(&self, ignore_errors: bool) -> Result<()> {
        let state = self.inner.state.read();
        if state.mode.read_only() {
            return Err(Error::ReadOnly);
        }
        self.inner.flush_all(&state, ignore_errors)
    }
}

impl CacheInner {
    /// Spawn the flush workers and the periodic flush loop
    pub(super) fn spawn_background(
        self: &Arc<Self>,
        tasks: &Receiver<FlushTask>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(self.config.flush_workers + 1);

        for i in 0..self.config.flush_workers {
            let cache = Arc::clone(self);
            let tasks = tasks.clone();
            let handle = thread::Builder::new()
                .name(format!("wc-flush-{i}"))
                .spawn(move || cache.run_worker(&tasks))?;
            handles.push(handle);
        }

        let cache = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("wc-flush-loop".to_string())
            .spawn(move || cache.run_flush_loop())?;
        handles.push(handle);

        info!(
            "Started write-cache flush loop with {} workers",
            self.config.flush_workers
        );
        Ok(handles)
    }

    fn run_worker(&self, tasks: &Receiver<FlushTask>) {
        loop {
            select! {
                recv(tasks) -> task => match task {
                    Ok(task) => self.process(task),
                    Err(_) => return,
                },
                recv(self.close_rx) -> _ => return,
            }
        }
    }

    fn run_flush_loop(&self) {
        let ticker = tick(Duration::from_millis(self.config.flush_interval_ms));
        loop {
            select! {
                recv(ticker) -> _ => self.flush_pass(),
                recv(self.close_rx) -> _ => {
                    info!("Write-cache flush loop stopped");
                    return;
                }
            }
        }
    }

    /// One background pass over both tiers
    fn flush_pass(&self) {
        let state = self.state.read();
        if !self.initialized.load(Ordering::Acquire)
            || state.mode.read_only()
            || state.mode.no_metabase()
        {
            return;
        }

        if let Some(db) = &state.db
            && let Err(e) = self.flush_small_db(db)
        {
            warn!("Write-cache db flush pass failed: {}", e);
        }
        if let Some(fs) = &state.fs_tree
            && let Err(e) = self.flush_fs_tree(fs)
        {
            warn!("Write-cache fstree flush pass failed: {}", e);
        }
    }

    fn flush_small_db(&self, db: &SmallStore) -> Result<()> {
        let mut last: Option<String> = None;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            let keys = db.keys_from(last.as_deref(), self.config.flush_batch_size)?;
            let Some(tail) = keys.last().cloned() else {
                return Ok(());
            };

            let mut purge = Vec::new();
            for key in keys {
                if self.flushed.contains(&key) {
                    purge.push(key);
                    continue;
                }
                if self.in_flight.contains_key(&key) {
                    continue;
                }
                let Some(raw) = db.get(&key)? else {
                    continue;
                };
                if !self.schedule(FlushTask {
                    key,
                    raw,
                    tier: Tier::Small,
                }) {
                    return Ok(());
                }
            }

            if !purge.is_empty() {
                db.delete_batch(&purge)?;
                for key in &purge {
                    decrement(&self.db_count);
                    self.flushed.remove(key);
                    storagelog::write(key, WRITE_CACHE, "db DELETE");
                }
            }
            last = Some(tail);
        }
    }

    fn flush_fs_tree(&self, fs: &FsTree) -> Result<()> {
        let prm = IteratePrm::lazy(|addr, load| {
            let key = addr.encode_to_string();
            if self.flushed.contains(&key) {
                match fs.delete(addr) {
                    Ok(()) => {
                        decrement(&self.fs_count);
                        self.flushed.remove(&key);
                        self.compress_flags.lock().remove(&key);
                        storagelog::write(&key, WRITE_CACHE, "fstree DELETE");
                    }
                    Err(e) => warn!("Can't purge flushed object {} from the cache fstree: {}", addr, e),
                }
                return Ok(());
            }
            if self.in_flight.contains_key(&key) {
                return Ok(());
            }

            let raw = match load() {
                Ok(raw) => raw,
                Err(e) => {
                    debug!("Can't read cached object {}: {}", addr, e);
                    return Ok(());
                }
            };
            if self.schedule(FlushTask {
                key,
                raw,
                tier: Tier::Large,
            }) {
                Ok(())
            } else {
                Err(Error::IterationStopped)
            }
        })
        .ignore_errors(true);

        match fs.iterate(prm) {
            Err(Error::IterationStopped) => Ok(()),
            res => res,
        }
    }

    /// Queue a task for the workers; false once the cache is closing
    fn schedule(&self, task: FlushTask) -> bool {
        let key = task.key.clone();
        self.in_flight.insert(key.clone(), Arc::default());
        let sent = select! {
            send(self.flush_tx, task) -> res => res.is_ok(),
            recv(self.close_rx) -> _ => false,
        };
        if !sent {
            self.in_flight.remove(&key);
        }
        sent
    }

    fn process(&self, task: FlushTask) {
        let Some(slot) = self.in_flight.get(&task.key).map(|e| Arc::clone(e.value())) else {
            return;
        };
        {
            let removed = slot.lock();
            if *removed {
                debug!("Object {} left the cache before flush", task.key);
            } else {
                match self.flush_object(&task.key, &task.raw, task.tier) {
                    Ok(()) => {
                        self.flushed.insert(task.key.clone());
                    }
                    Err(e) => error!("Can't flush object {}: {}", task.key, e),
                }
            }
        }
        self.in_flight.remove(&task.key);
    }

    /// Write one object into the blob store and the metabase
    fn flush_object(&self, key: &str, raw: &[u8], tier: Tier) -> Result<()> {
        let object = Object::unmarshal(raw)?;
        let dont_compress = match tier {
            Tier::Small => !self.blobstor.needs_compression(object.header()),
            Tier::Large => !self.compress_flags.lock().contains(key),
        };

        let storage_id = self.blobstor.put(&object, raw, dont_compress)?;
        match self.metabase.put(&object, &storage_id) {
            Err(e) if e.is_removed() => {
                debug!("Flushed object {} was already removed", key);
                Ok(())
            }
            res => res,
        }
    }

    /// Flush every unmarked object of both tiers on the calling thread.
    ///
    /// Entries stay in the cache; the flush loop purges them later.
    pub(super) fn flush_all(&self, state: &CacheState, ignore_errors: bool) -> Result<()> {
        if let Some(db) = &state.db {
            let mut last: Option<String> = None;
            loop {
                let keys = db.keys_from(last.as_deref(), self.config.flush_batch_size)?;
                let Some(tail) = keys.last().cloned() else {
                    break;
                };
                for key in keys {
                    if self.flushed.contains(&key) {
                        continue;
                    }
                    let Some(raw) = db.get(&key)? else {
                        continue;
                    };
                    let res = self.flush_object(&key, &raw, Tier::Small);
                    self.finish_sync_flush(key, res, ignore_errors)?;
                }
                last = Some(tail);
            }
        }

        if let Some(fs) = &state.fs_tree {
            let prm = IteratePrm::eager(|element| {
                let key = element.address.encode_to_string();
                if self.flushed.contains(&key) {
                    return Ok(());
                }
                let res = self.flush_object(&key, &element.data, Tier::Large);
                self.finish_sync_flush(key, res, ignore_errors)
            })
            .ignore_errors(ignore_errors)
            .on_error(|addr: &Address, e| {
                warn!("Can't read cached object {}: {}", addr, e);
                Ok(())
            });
            fs.iterate(prm)?;
        }
        Ok(())
    }

    fn finish_sync_flush(&self, key: String, res: Result<()>, ignore_errors: bool) -> Result<()> {
        match res {
            Ok(()) => {
                self.flushed.insert(key);
                Ok(())
            }
            Err(e) if ignore_errors => {
                warn!("Can't flush object {}: {}", key, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
