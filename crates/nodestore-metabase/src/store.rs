//! Metabase backed by redb.
//!
//! Every mutation runs in a single write transaction that is committed only
//! when all of its steps succeed; a failing step drops the transaction and
//! leaves the index untouched.

use crate::epoch::EpochState;
use crate::tables;
use nodestore_common::{
    Address, Error, Mode, Object, ObjectHeader, ObjectId, ObjectType, Result, SplitInfo,
};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, ReadableTableMetadata, WriteTransaction};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Transactional object index of a shard
pub struct Metabase {
    path: PathBuf,
    epoch: Arc<dyn EpochState>,
    state: RwLock<MetaState>,
}

struct MetaState {
    mode: Mode,
    db: Option<Database>,
}

fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::create(path)?;

    // Create all tables eagerly so later read txns don't fail
    let write_txn = db.begin_write()?;
    {
        let _t = write_txn.open_table(tables::OBJECTS)?;
        let _t = write_txn.open_table(tables::GRAVEYARD)?;
        let _t = write_txn.open_table(tables::MOVABLE)?;
        let _t = write_txn.open_table(tables::STORAGE_IDS)?;
        let _t = write_txn.open_table(tables::PARENTS)?;
        let _t = write_txn.open_table(tables::LOCKS)?;
    }
    write_txn.commit()?;
    Ok(db)
}

/// Key of a parent link: parent address key followed by the child object ID
fn parent_link(parent: &Address, child: &ObjectId) -> Vec<u8> {
    let mut key = Vec::with_capacity(Address::KEY_LEN + child.as_bytes().len());
    key.extend_from_slice(&parent.to_key());
    key.extend_from_slice(child.as_bytes());
    key
}

/// Stored parts of a virtual parent
fn parts_of(
    parents: &impl ReadableTable<&'static [u8], ()>,
    parent: &Address,
) -> Result<Vec<ObjectId>> {
    let prefix = parent.to_key();
    let mut parts = Vec::new();
    for entry in parents.range::<&[u8]>(prefix.as_slice()..)? {
        let (key, _) = entry?;
        let key = key.value();
        if !key.starts_with(&prefix) {
            break;
        }
        parts.push(ObjectId::from_slice(&key[Address::KEY_LEN..])?);
    }
    Ok(parts)
}

fn record_locks(txn: &WriteTransaction, locker_key: &[u8], locked: &[Address]) -> Result<()> {
    let mut locks = txn.open_table(tables::LOCKS)?;
    for addr in locked {
        locks.insert(addr.to_key().as_slice(), locker_key)?;
    }
    Ok(())
}

impl Metabase {
    /// Open (or create) the metabase at the given path in read-write mode.
    pub fn open(path: impl AsRef<Path>, epoch: Arc<dyn EpochState>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let db = open_database(&path)?;
        info!("Opened metabase at {}", path.display());

        Ok(Self {
            path,
            epoch,
            state: RwLock::new(MetaState {
                mode: Mode::ReadWrite,
                db: Some(db),
            }),
        })
    }

    /// Current mode
    pub fn mode(&self) -> Mode {
        self.state.read().mode
    }

    /// Switch mode. Modes without a metabase close the database; leaving
    /// them reopens it.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut state = self.state.write();
        if mode.no_metabase() {
            state.db = None;
        } else if state.db.is_none() {
            state.db = Some(open_database(&self.path)?);
        }
        state.mode = mode;
        info!("Metabase {} switched to {} mode", self.path.display(), mode);
        Ok(())
    }

    /// Release the database. Later calls fail with `MetabaseDisabled`.
    pub fn close(&self) {
        let mut state = self.state.write();
        if state.db.take().is_some() {
            info!("Closed metabase at {}", self.path.display());
        }
    }

    fn view<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        let db = state.db.as_ref().ok_or(Error::MetabaseDisabled)?;
        f(db)
    }

    fn update<T>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T>) -> Result<T> {
        let state = self.state.read();
        let db = state.db.as_ref().ok_or(Error::MetabaseDisabled)?;
        if state.mode.read_only() {
            return Err(Error::ReadOnly);
        }
        let txn = db.begin_write()?;
        let out = f(&txn)?;
        txn.commit()?;
        Ok(out)
    }

    fn check_expiration(&self, addr: &Address, header: &ObjectHeader) -> Result<()> {
        match header.expiration_epoch() {
            Some(epoch) if epoch < self.epoch.current_epoch() => Err(Error::Expired(*addr)),
            _ => Ok(()),
        }
    }

    /// Check whether an object is stored and alive.
    ///
    /// Graveyard hits, expired objects and virtual parents are reported as
    /// errors; an unknown address is `Ok(false)`.
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        self.view(|db| {
            let txn = db.begin_read()?;
            let key = addr.to_key();

            let graveyard = txn.open_table(tables::GRAVEYARD)?;
            let buried = graveyard.get(key.as_slice())?.is_some();
            if buried {
                return Err(Error::AlreadyRemoved(*addr));
            }

            let objects = txn.open_table(tables::OBJECTS)?;
            if let Some(raw) = objects.get(key.as_slice())? {
                let header: ObjectHeader = bincode::deserialize(raw.value())?;
                self.check_expiration(addr, &header)?;
                return Ok(true);
            }

            let parts = parts_of(&txn.open_table(tables::PARENTS)?, addr)?;
            if !parts.is_empty() {
                return Err(Error::SplitInfo(Box::new(SplitInfo {
                    parent: *addr,
                    parts,
                })));
            }
            Ok(false)
        })
    }

    /// Index a stored object. Storing an already indexed object only updates
    /// its storage ID.
    pub fn put(&self, object: &Object, storage_id: &[u8]) -> Result<()> {
        let addr = object.address();
        let key = addr.to_key();
        let header = bincode::serialize(object.header())?;

        self.update(|txn| {
            {
                let graveyard = txn.open_table(tables::GRAVEYARD)?;
                let buried = graveyard.get(key.as_slice())?.is_some();
                if buried {
                    return Err(Error::AlreadyRemoved(addr));
                }
            }

            let mut objects = txn.open_table(tables::OBJECTS)?;
            objects.insert(key.as_slice(), header.as_slice())?;

            let mut storage_ids = txn.open_table(tables::STORAGE_IDS)?;
            if storage_id.is_empty() {
                storage_ids.remove(key.as_slice())?;
            } else {
                storage_ids.insert(key.as_slice(), storage_id)?;
            }

            if let Some(parent) = object.parent_address() {
                let mut parents = txn.open_table(tables::PARENTS)?;
                parents.insert(parent_link(&parent, &addr.object).as_slice(), ())?;
            }

            if object.object_type() == ObjectType::Lock {
                record_locks(txn, &key, &object.member_addresses())?;
            }
            Ok(())
        })?;

        debug!("Indexed object {}", addr);
        Ok(())
    }

    /// Protect objects from inhumation by the given lock object.
    ///
    /// Fails with `AlreadyRemoved` if any of them is graveyard-marked.
    pub fn lock(&self, locker: &Address, locked: &[Address]) -> Result<()> {
        let locker_key = locker.to_key();
        self.update(|txn| {
            {
                let graveyard = txn.open_table(tables::GRAVEYARD)?;
                for addr in locked {
                    let buried = graveyard.get(addr.to_key().as_slice())?.is_some();
                    if buried {
                        return Err(Error::AlreadyRemoved(*addr));
                    }
                }
            }
            record_locks(txn, &locker_key, locked)
        })?;

        debug!("Locked {} objects by {}", locked.len(), locker);
        Ok(())
    }

    /// Mark victims as removed by the given tombstone.
    ///
    /// All graveyard entries are written in one transaction; if any victim
    /// is locked nothing is written.
    pub fn inhume(&self, tombstone: &Address, victims: &[Address]) -> Result<()> {
        let ts_key = tombstone.to_key();
        self.update(|txn| {
            let locks = txn.open_table(tables::LOCKS)?;
            let mut graveyard = txn.open_table(tables::GRAVEYARD)?;
            for victim in victims {
                let key = victim.to_key();
                let locked = locks.get(key.as_slice())?.is_some();
                if locked {
                    return Err(Error::Locked(*victim));
                }
                graveyard.insert(key.as_slice(), ts_key.as_slice())?;
            }
            Ok(())
        })?;

        debug!("Inhumed {} objects by tombstone {}", victims.len(), tombstone);
        Ok(())
    }

    /// Physically drop index rows of the given addresses.
    ///
    /// A virtual parent can only be dropped once every stored part is either
    /// graveyard-marked or dropped in the same call. Unknown addresses are
    /// ignored.
    pub fn delete(&self, addrs: &[Address]) -> Result<()> {
        let batch: HashSet<Address> = addrs.iter().copied().collect();

        self.update(|txn| {
            let mut objects = txn.open_table(tables::OBJECTS)?;
            let mut graveyard = txn.open_table(tables::GRAVEYARD)?;
            let mut movable = txn.open_table(tables::MOVABLE)?;
            let mut storage_ids = txn.open_table(tables::STORAGE_IDS)?;
            let mut parents = txn.open_table(tables::PARENTS)?;
            let mut locks = txn.open_table(tables::LOCKS)?;

            for addr in addrs {
                let key = addr.to_key();
                let header = objects
                    .remove(key.as_slice())?
                    .map(|raw| bincode::deserialize::<ObjectHeader>(raw.value()))
                    .transpose()?;

                match header {
                    Some(header) => {
                        if let Some(parent) = header.parent {
                            let parent = Address::new(addr.container, parent);
                            parents.remove(parent_link(&parent, &addr.object).as_slice())?;
                        }
                        if header.object_type == ObjectType::Lock {
                            for member in &header.members {
                                let member_key = Address::new(addr.container, *member).to_key();
                                let held = locks
                                    .get(member_key.as_slice())?
                                    .is_some_and(|locker| locker.value() == key.as_slice());
                                if held {
                                    locks.remove(member_key.as_slice())?;
                                }
                            }
                        }
                    }
                    None => {
                        let parts = parts_of(&parents, addr)?;
                        for part in &parts {
                            let child = Address::new(addr.container, *part);
                            let buried = graveyard.get(child.to_key().as_slice())?.is_some();
                            if !buried && !batch.contains(&child) {
                                return Err(Error::LiveChildren(*addr));
                            }
                        }
                        for part in &parts {
                            parents.remove(parent_link(addr, part).as_slice())?;
                        }
                    }
                }

                graveyard.remove(key.as_slice())?;
                movable.remove(key.as_slice())?;
                storage_ids.remove(key.as_slice())?;
                locks.remove(key.as_slice())?;
            }
            Ok(())
        })?;

        debug!("Deleted {} objects from the index", addrs.len());
        Ok(())
    }

    /// Addresses queued for migration between tiers
    pub fn movable(&self) -> Result<Vec<Address>> {
        self.view(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(tables::MOVABLE)?;
            let mut result = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                result.push(Address::from_key(key.value())?);
            }
            Ok(result)
        })
    }

    /// Queue an address for migration
    pub fn to_move_it(&self, addr: &Address) -> Result<()> {
        self.update(|txn| {
            let mut table = txn.open_table(tables::MOVABLE)?;
            table.insert(addr.to_key().as_slice(), ())?;
            Ok(())
        })
    }

    /// Remove an address from the migration queue
    pub fn do_not_move(&self, addr: &Address) -> Result<()> {
        self.update(|txn| {
            let mut table = txn.open_table(tables::MOVABLE)?;
            table.remove(addr.to_key().as_slice())?;
            Ok(())
        })
    }

    /// Storage ID recorded for an object, `None` for the filesystem tier
    pub fn storage_id(&self, addr: &Address) -> Result<Option<Vec<u8>>> {
        self.view(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(tables::STORAGE_IDS)?;
            let id = table
                .get(addr.to_key().as_slice())?
                .map(|v| v.value().to_vec());
            Ok(id)
        })
    }

    /// Check whether a lock object protects the address
    pub fn is_locked(&self, addr: &Address) -> Result<bool> {
        self.view(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(tables::LOCKS)?;
            let locked = table.get(addr.to_key().as_slice())?.is_some();
            Ok(locked)
        })
    }

    /// Number of indexed objects
    pub fn object_count(&self) -> Result<u64> {
        self.view(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(tables::OBJECTS)?;
            Ok(table.len()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodestore_common::{ATTRIBUTE_EXPIRATION_EPOCH, ContainerId, OWNER_ID_SIZE, OwnerId};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        epoch: Arc<AtomicU64>,
        mb: Metabase,
    }

    fn open_metabase() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let epoch = Arc::new(AtomicU64::new(0));
        let mb = Metabase::open(dir.path().join("meta.redb"), epoch.clone()).unwrap();
        Fixture {
            _dir: dir,
            epoch,
            mb,
        }
    }

    fn owner() -> OwnerId {
        OwnerId::from_bytes([1u8; OWNER_ID_SIZE])
    }

    fn random_object(cnr: ContainerId) -> Object {
        Object::builder(cnr, owner())
            .payload(rand::random::<[u8; 16]>().to_vec())
            .build()
            .unwrap()
    }

    fn random_address() -> Address {
        Address::new(
            ContainerId::from_bytes(rand::random()),
            ObjectId::from_bytes(rand::random()),
        )
    }

    fn child_of(cnr: ContainerId, parent: ObjectId) -> Object {
        Object::builder(cnr, owner())
            .parent(parent)
            .payload(rand::random::<[u8; 16]>().to_vec())
            .build()
            .unwrap()
    }

    #[test]
    fn test_put_exists() {
        let f = open_metabase();
        let obj = random_object(ContainerId::from_bytes(rand::random()));

        assert!(!f.mb.exists(&obj.address()).unwrap());
        f.mb.put(&obj, &[]).unwrap();
        assert!(f.mb.exists(&obj.address()).unwrap());

        // Idempotent
        f.mb.put(&obj, &[]).unwrap();
        assert_eq!(f.mb.object_count().unwrap(), 1);
    }

    #[test]
    fn test_inhume_hides_object() {
        let f = open_metabase();
        let obj = random_object(ContainerId::from_bytes(rand::random()));
        let ts = random_address();

        f.mb.put(&obj, &[]).unwrap();
        f.mb.inhume(&ts, &[obj.address()]).unwrap();

        assert!(matches!(
            f.mb.exists(&obj.address()),
            Err(Error::AlreadyRemoved(_))
        ));
        assert!(matches!(f.mb.put(&obj, &[]), Err(Error::AlreadyRemoved(_))));
    }

    #[test]
    fn test_expired_object() {
        let f = open_metabase();
        let obj = Object::builder(ContainerId::from_bytes(rand::random()), owner())
            .attribute(ATTRIBUTE_EXPIRATION_EPOCH, "10")
            .build()
            .unwrap();
        f.mb.put(&obj, &[]).unwrap();

        f.epoch.store(10, Ordering::Relaxed);
        assert!(f.mb.exists(&obj.address()).unwrap());

        f.epoch.store(11, Ordering::Relaxed);
        assert!(matches!(f.mb.exists(&obj.address()), Err(Error::Expired(_))));
    }

    #[test]
    fn test_virtual_parent_split_info() {
        let f = open_metabase();
        let cnr = ContainerId::from_bytes(rand::random());
        let parent = Address::new(cnr, ObjectId::from_bytes(rand::random()));
        let child = child_of(cnr, parent.object);

        f.mb.put(&child, &[]).unwrap();

        match f.mb.exists(&parent) {
            Err(Error::SplitInfo(info)) => {
                assert_eq!(info.parent, parent);
                assert_eq!(info.parts, vec![child.id()]);
            }
            other => panic!("expected split info, got {other:?}"),
        }
    }

    #[test]
    fn test_delete_virtual_parent_with_live_child() {
        let f = open_metabase();
        let cnr = ContainerId::from_bytes(rand::random());
        let parent = Address::new(cnr, ObjectId::from_bytes(rand::random()));
        let child = child_of(cnr, parent.object);
        f.mb.put(&child, &[]).unwrap();

        assert!(matches!(
            f.mb.delete(&[parent]),
            Err(Error::LiveChildren(_))
        ));
        // Nothing was committed
        assert!(f.mb.exists(&child.address()).unwrap());

        // Removing the part and the parent together succeeds
        f.mb.delete(&[parent, child.address()]).unwrap();
        assert!(!f.mb.exists(&parent).unwrap());
        assert!(!f.mb.exists(&child.address()).unwrap());
    }

    #[test]
    fn test_delete_virtual_parent_with_buried_child() {
        let f = open_metabase();
        let cnr = ContainerId::from_bytes(rand::random());
        let parent = Address::new(cnr, ObjectId::from_bytes(rand::random()));
        let child = child_of(cnr, parent.object);
        f.mb.put(&child, &[]).unwrap();
        f.mb.inhume(&random_address(), &[child.address()]).unwrap();

        f.mb.delete(&[parent]).unwrap();
    }

    #[test]
    fn test_delete_all_children_removes_parent() {
        let f = open_metabase();
        let cnr = ContainerId::from_bytes(rand::random());
        let parent = Address::new(cnr, ObjectId::from_bytes(rand::random()));
        let children: Vec<_> = (0..3).map(|_| child_of(cnr, parent.object)).collect();
        for child in &children {
            f.mb.put(child, &[]).unwrap();
        }

        let addrs: Vec<_> = children.iter().map(Object::address).collect();
        f.mb.delete(&addrs).unwrap();

        assert!(!f.mb.exists(&parent).unwrap());
    }

    #[test]
    fn test_inhume_unknown_then_delete() {
        let f = open_metabase();
        let addr = random_address();

        f.mb.inhume(&random_address(), &[addr]).unwrap();
        assert!(matches!(f.mb.exists(&addr), Err(Error::AlreadyRemoved(_))));

        f.mb.delete(&[addr]).unwrap();
        assert!(!f.mb.exists(&addr).unwrap());
    }

    #[test]
    fn test_delete_unknown_is_noop() {
        let f = open_metabase();
        f.mb.delete(&[random_address(), random_address()]).unwrap();
    }

    #[test]
    fn test_lock_blocks_inhume() {
        let f = open_metabase();
        let cnr = ContainerId::from_bytes(rand::random());
        let obj = random_object(cnr);
        let lock = Object::builder(cnr, owner())
            .object_type(ObjectType::Lock)
            .members([obj.id()])
            .build()
            .unwrap();

        f.mb.put(&obj, &[]).unwrap();
        f.mb.put(&lock, &[]).unwrap();
        assert!(f.mb.is_locked(&obj.address()).unwrap());

        let other = random_object(cnr);
        f.mb.put(&other, &[]).unwrap();
        assert!(matches!(
            f.mb.inhume(&random_address(), &[other.address(), obj.address()]),
            Err(Error::Locked(_))
        ));
        // The whole batch was rejected
        assert!(f.mb.exists(&other.address()).unwrap());

        f.mb.delete(&[lock.address()]).unwrap();
        assert!(!f.mb.is_locked(&obj.address()).unwrap());
        f.mb.inhume(&random_address(), &[obj.address()]).unwrap();
    }

    #[test]
    fn test_lock_without_lock_object() {
        let f = open_metabase();
        let victim = random_address();
        let buried = random_address();
        f.mb.inhume(&random_address(), &[buried]).unwrap();

        assert!(matches!(
            f.mb.lock(&random_address(), &[victim, buried]),
            Err(Error::AlreadyRemoved(_))
        ));
        assert!(!f.mb.is_locked(&victim).unwrap());

        f.mb.lock(&random_address(), &[victim]).unwrap();
        assert!(matches!(
            f.mb.inhume(&random_address(), &[victim]),
            Err(Error::Locked(_))
        ));
    }

    #[test]
    fn test_storage_id() {
        let f = open_metabase();
        let cnr = ContainerId::from_bytes(rand::random());
        let small = random_object(cnr);
        let large = random_object(cnr);

        f.mb.put(&small, b"blobovnicza").unwrap();
        f.mb.put(&large, &[]).unwrap();

        assert_eq!(
            f.mb.storage_id(&small.address()).unwrap().as_deref(),
            Some(&b"blobovnicza"[..])
        );
        assert_eq!(f.mb.storage_id(&large.address()).unwrap(), None);

        f.mb.delete(&[small.address()]).unwrap();
        assert_eq!(f.mb.storage_id(&small.address()).unwrap(), None);
    }

    #[test]
    fn test_movable_queue() {
        let f = open_metabase();
        let a = random_address();
        let b = random_address();

        f.mb.to_move_it(&a).unwrap();
        f.mb.to_move_it(&b).unwrap();
        let mut queued = f.mb.movable().unwrap();
        queued.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(queued, expected);

        f.mb.do_not_move(&a).unwrap();
        assert_eq!(f.mb.movable().unwrap(), vec![b]);

        f.mb.delete(&[b]).unwrap();
        assert!(f.mb.movable().unwrap().is_empty());
    }

    #[test]
    fn test_read_only_mode() {
        let f = open_metabase();
        let obj = random_object(ContainerId::from_bytes(rand::random()));
        f.mb.put(&obj, &[]).unwrap();

        f.mb.set_mode(Mode::ReadOnly).unwrap();
        let other = random_object(ContainerId::from_bytes(rand::random()));
        assert!(matches!(f.mb.put(&other, &[]), Err(Error::ReadOnly)));
        assert!(matches!(f.mb.delete(&[obj.address()]), Err(Error::ReadOnly)));
        assert!(f.mb.exists(&obj.address()).unwrap());
    }

    #[test]
    fn test_degraded_mode_disables_metabase() {
        let f = open_metabase();
        let obj = random_object(ContainerId::from_bytes(rand::random()));
        f.mb.put(&obj, &[]).unwrap();

        f.mb.set_mode(Mode::Degraded).unwrap();
        assert!(matches!(
            f.mb.exists(&obj.address()),
            Err(Error::MetabaseDisabled)
        ));
        assert!(matches!(f.mb.movable(), Err(Error::MetabaseDisabled)));

        f.mb.set_mode(Mode::ReadWrite).unwrap();
        assert!(f.mb.exists(&obj.address()).unwrap());
    }

    #[test]
    fn test_close() {
        let f = open_metabase();
        f.mb.close();
        assert!(matches!(
            f.mb.exists(&random_address()),
            Err(Error::MetabaseDisabled)
        ));
    }
}
