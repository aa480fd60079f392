//! Embedded key-value storage for small objects.
//!
//! A single redb table maps encoded addresses to stored object bytes. Used
//! both as an embedded blob sub-storage and as the small-object tier of the
//! write-cache.
//!
//! Concurrent writers of the write-cache go through [`SmallStore::put_batched`],
//! which groups pending puts into a single redb commit.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use nodestore_common::{Error, Result};
use parking_lot::Mutex;
use redb::{
    Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction,
};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// Key: encoded address, Value: stored object bytes
const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Most puts committed by one batched transaction
pub const MAX_BATCH_SIZE: usize = 1000;

/// Put waiting for the next batched commit
struct PendingPut {
    key: String,
    data: Vec<u8>,
    reply: Sender<Result<bool>>,
}

/// Small-object store backed by a redb database file
pub struct SmallStore {
    path: PathBuf,
    db: Database,
    no_sync: bool,

    pending_tx: Sender<PendingPut>,
    pending_rx: Receiver<PendingPut>,
    /// Held by the writer committing the pending batch
    commit_lock: Mutex<()>,
}

impl SmallStore {
    /// Open (or create) the store at the given path.
    ///
    /// With `no_sync` commits skip the fsync of the database file.
    pub fn open(path: impl AsRef<Path>, no_sync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(OBJECTS)?;
        }
        write_txn.commit()?;

        let (pending_tx, pending_rx) = crossbeam_channel::bounded(MAX_BATCH_SIZE);
        info!("Opened small-object store at {}", path.display());
        Ok(Self {
            path,
            db,
            no_sync,
            pending_tx,
            pending_rx,
            commit_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin_write(&self) -> Result<WriteTransaction> {
        let mut write_txn = self.db.begin_write()?;
        if self.no_sync {
            write_txn.set_durability(Durability::None);
        }
        Ok(write_txn)
    }

    /// Store data under the key. Returns `true` if the key was new.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<bool> {
        let write_txn = self.begin_write()?;
        let fresh = {
            let mut table = write_txn.open_table(OBJECTS)?;
            let previous = table.insert(key, data)?;
            previous.is_none()
        };
        write_txn.commit()?;
        Ok(fresh)
    }

    /// Like [`SmallStore::put`], but shares one commit with the puts of
    /// other threads queued at the same time.
    ///
    /// Whoever takes the commit lock drains the queue and commits it; the
    /// rest find their result waiting once the lock is released.
    pub fn put_batched(&self, key: &str, data: &[u8]) -> Result<bool> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let mut entry = PendingPut {
            key: key.to_string(),
            data: data.to_vec(),
            reply: reply_tx,
        };
        loop {
            match self.pending_tx.try_send(entry) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    entry = back;
                    let _guard = self.commit_lock.lock();
                    self.commit_pending();
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(Error::internal("small-object batch queue is closed"));
                }
            }
        }

        loop {
            if let Ok(res) = reply_rx.try_recv() {
                return res;
            }
            let _guard = self.commit_lock.lock();
            if let Ok(res) = reply_rx.try_recv() {
                return res;
            }
            self.commit_pending();
        }
    }

    /// Commit up to [`MAX_BATCH_SIZE`] queued puts in one transaction.
    /// Caller holds `commit_lock`.
    fn commit_pending(&self) {
        let batch: Vec<PendingPut> = self.pending_rx.try_iter().take(MAX_BATCH_SIZE).collect();
        if batch.is_empty() {
            return;
        }

        let res = self.write_batch(&batch);
        debug!("Committed {} batched puts to {}", batch.len(), self.path.display());
        match res {
            Ok(fresh) => {
                for (entry, fresh) in batch.into_iter().zip(fresh) {
                    let _ = entry.reply.send(Ok(fresh));
                }
            }
            Err(e) => {
                for entry in batch {
                    let _ = entry.reply.send(Err(Error::Database(e.to_string())));
                }
            }
        }
    }

    fn write_batch(&self, batch: &[PendingPut]) -> Result<Vec<bool>> {
        let write_txn = self.begin_write()?;
        let fresh = {
            let mut table = write_txn.open_table(OBJECTS)?;
            let mut fresh = Vec::with_capacity(batch.len());
            for entry in batch {
                let previous = table.insert(entry.key.as_str(), entry.data.as_slice())?;
                fresh.push(previous.is_none());
            }
            fresh
        };
        write_txn.commit()?;
        Ok(fresh)
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;
        let data = table.get(key)?.map(|v| v.value().to_vec());
        Ok(data)
    }

    pub fn exists(&self, key: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;
        let found = table.get(key)?.is_some();
        Ok(found)
    }

    /// Remove the key. Returns `true` if it was present.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let write_txn = self.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(OBJECTS)?;
            let previous = table.remove(key)?;
            previous.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Remove several keys in one transaction
    pub fn delete_batch(&self, keys: &[String]) -> Result<()> {
        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS)?;
            for key in keys {
                table.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Up to `limit` keys in order, strictly after `after` when given
    pub fn keys_from(&self, after: Option<&str>, limit: usize) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;
        let start = after.map_or(Bound::Unbounded, Bound::Excluded);

        let mut keys = Vec::with_capacity(limit);
        for entry in table.range::<&str>((start, Bound::Unbounded))? {
            if keys.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    /// Number of stored entries
    pub fn len(&self) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
