//! Main blob storage of a shard.
//!
//! Objects are routed to the first sub-storage that accepts their raw size;
//! the last sub-storage is always a filesystem tree accepting any size. The
//! storage ID returned by `put` names the sub-storage that took the object
//! and is empty for the filesystem tree.

use crate::compression::Compressor;
use crate::fstree::{self, FsTree};
use crate::smallstore::SmallStore;
use crate::storagelog;
use nodestore_common::config::{BlobStorConfig, EmbeddedConfig, SubStorageConfig};
use nodestore_common::{Address, Error, Mode, Object, ObjectHeader, Result};
use parking_lot::RwLock;
use std::borrow::Cow;
use tracing::{debug, info};

/// Embedded small-object sub-storage
pub struct EmbeddedStorage {
    id: String,
    max_object_size: u64,
    store: SmallStore,
}

impl EmbeddedStorage {
    pub fn open(config: &EmbeddedConfig) -> Result<Self> {
        Ok(Self {
            id: config.id.clone(),
            max_object_size: config.max_object_size,
            store: SmallStore::open(&config.path, false)?,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Sub-storage of a blob store, selected by configuration
pub enum SubStorage {
    Embedded(EmbeddedStorage),
    FsTree(FsTree),
}

impl SubStorage {
    fn open(config: &SubStorageConfig, compressor: &Compressor) -> Result<Self> {
        match config {
            SubStorageConfig::Embedded(cfg) => Ok(Self::Embedded(EmbeddedStorage::open(cfg)?)),
            SubStorageConfig::FsTree(cfg) => {
                let tree = FsTree::new(cfg, compressor.clone())?;
                tree.init()?;
                Ok(Self::FsTree(tree))
            }
        }
    }

    /// Storage type reported in audit records
    pub fn storage_type(&self) -> &str {
        match self {
            Self::Embedded(s) => &s.id,
            Self::FsTree(_) => fstree::TYPE,
        }
    }

    /// Storage ID recorded for objects held here
    fn storage_id(&self) -> &[u8] {
        match self {
            Self::Embedded(s) => s.id.as_bytes(),
            Self::FsTree(_) => &[],
        }
    }

    fn accepts(&self, size: u64) -> bool {
        match self {
            Self::Embedded(s) => size <= s.max_object_size,
            Self::FsTree(_) => true,
        }
    }
}

/// Blob storage: ordered sub-storages sharing one compression policy
pub struct BlobStor {
    storages: Vec<SubStorage>,
    compressor: Compressor,
    mode: RwLock<Mode>,
}

impl BlobStor {
    /// Open every configured sub-storage
    pub fn open(config: &BlobStorConfig) -> Result<Self> {
        if !matches!(config.storages.last(), Some(SubStorageConfig::FsTree(_))) {
            return Err(Error::configuration(
                "the last blob sub-storage must be an fstree",
            ));
        }
        let compressor = Compressor::new(&config.compression);
        let storages = config
            .storages
            .iter()
            .map(|cfg| SubStorage::open(cfg, &compressor))
            .collect::<Result<Vec<_>>>()?;

        info!("Opened blob storage with {} sub-storages", storages.len());
        Ok(Self {
            storages,
            compressor,
            mode: RwLock::new(Mode::ReadWrite),
        })
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut current = self.mode.write();
        for storage in &self.storages {
            if let SubStorage::FsTree(tree) = storage {
                tree.set_read_only(mode.read_only());
            }
        }
        *current = mode;
        info!("Blob storage switched to {} mode", mode);
        Ok(())
    }

    /// Whether the compression policy applies to an object
    pub fn needs_compression(&self, header: &ObjectHeader) -> bool {
        self.compressor.needs_compression(header)
    }

    /// Sub-storages an operation with the given storage ID applies to.
    ///
    /// No ID means every sub-storage, an empty ID means the filesystem tree.
    fn select(&self, storage_id: Option<&[u8]>) -> impl Iterator<Item = &SubStorage> {
        self.storages
            .iter()
            .filter(move |s| storage_id.is_none_or(|id| s.storage_id() == id))
    }

    /// Store the raw form of an object and return its storage ID
    pub fn put(&self, object: &Object, raw: &[u8], dont_compress: bool) -> Result<Vec<u8>> {
        if self.mode().read_only() {
            return Err(Error::ReadOnly);
        }

        let addr = object.address();
        let size = raw.len() as u64;
        let storage = self
            .storages
            .iter()
            .find(|s| s.accepts(size))
            .ok_or_else(|| Error::internal("no sub-storage accepts the object"))?;

        match storage {
            SubStorage::Embedded(s) => {
                let data = if dont_compress {
                    Cow::Borrowed(raw)
                } else {
                    self.compressor.compress(raw)?
                };
                s.store.put(&addr.encode_to_string(), &data)?;
            }
            SubStorage::FsTree(tree) => tree.put(&addr, raw, dont_compress)?,
        }

        storagelog::write(&addr.encode_to_string(), storage.storage_type(), "PUT");
        Ok(storage.storage_id().to_vec())
    }

    /// Decompressed raw form of an object
    pub fn get_raw(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<Vec<u8>> {
        let key = addr.encode_to_string();
        for storage in self.select(storage_id) {
            let found = match storage {
                SubStorage::Embedded(s) => s
                    .store
                    .get(&key)?
                    .map(|data| self.compressor.decompress(&data).map(|d| d.into_owned()))
                    .transpose()?,
                SubStorage::FsTree(tree) => match tree.get_raw(addr) {
                    Ok(data) => Some(data),
                    Err(e) if e.is_not_found() => None,
                    Err(e) => return Err(e),
                },
            };
            if let Some(data) = found {
                return Ok(data);
            }
        }
        Err(Error::NotFound(*addr))
    }

    pub fn get(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<Object> {
        Object::unmarshal(&self.get_raw(addr, storage_id)?)
    }

    /// Payload bytes `[offset, offset + length)`
    pub fn get_range(
        &self,
        addr: &Address,
        storage_id: Option<&[u8]>,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let object = self.get(addr, storage_id)?;
        Ok(object.payload_range(offset, length)?.to_vec())
    }

    pub fn exists(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<bool> {
        let key = addr.encode_to_string();
        for storage in self.select(storage_id) {
            let found = match storage {
                SubStorage::Embedded(s) => s.store.exists(&key)?,
                SubStorage::FsTree(tree) => tree.exists(addr)?,
            };
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Remove an object; `NotFound` if no selected sub-storage held it
    pub fn delete(&self, addr: &Address, storage_id: Option<&[u8]>) -> Result<()> {
        if self.mode().read_only() {
            return Err(Error::ReadOnly);
        }

        let key = addr.encode_to_string();
        let mut removed = false;
        for storage in self.select(storage_id) {
            let hit = match storage {
                SubStorage::Embedded(s) => s.store.delete(&key)?,
                SubStorage::FsTree(tree) => match tree.delete(addr) {
                    Ok(()) => true,
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e),
                },
            };
            if hit {
                storagelog::write(&key, storage.storage_type(), "DELETE");
                removed = true;
            }
        }

        if removed {
            Ok(())
        } else {
            debug!("Object {} is absent from blob storage", addr);
            Err(Error::NotFound(*addr))
        }
    }

    pub fn close(&self) {
        info!("Closed blob storage");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodestore_common::config::{CompressionConfig, ShardConfig};
    use nodestore_common::{ContainerId, OWNER_ID_SIZE, OwnerId};

    fn open_blobstor(compression: bool) -> (tempfile::TempDir, BlobStor) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ShardConfig::with_root(dir.path()).blobstor;
        config.compression = CompressionConfig {
            enabled: compression,
            ..CompressionConfig::default()
        };
        let bs = BlobStor::open(&config).unwrap();
        (dir, bs)
    }

    fn object_of(size: usize) -> Object {
        Object::builder(
            ContainerId::from_bytes(rand::random()),
            OwnerId::from_bytes([6u8; OWNER_ID_SIZE]),
        )
        .payload(vec![0x5a; size])
        .build()
        .unwrap()
    }

    fn put(bs: &BlobStor, obj: &Object) -> Vec<u8> {
        let raw = obj.marshal().unwrap();
        bs.put(obj, &raw, !bs.needs_compression(obj.header()))
            .unwrap()
    }

    #[test]
    fn test_routing_by_size() {
        let (_dir, bs) = open_blobstor(false);
        let small = object_of(1024);
        let large = object_of(512 * 1024);

        assert_eq!(put(&bs, &small), b"blobovnicza".to_vec());
        assert!(put(&bs, &large).is_empty());

        assert!(bs.exists(&small.address(), Some(&b"blobovnicza"[..])).unwrap());
        assert!(!bs.exists(&small.address(), Some(&[][..])).unwrap());
        assert!(bs.exists(&large.address(), Some(&[][..])).unwrap());
        assert!(bs.exists(&large.address(), None).unwrap());

        assert_eq!(bs.get(&small.address(), None).unwrap(), small);
        assert_eq!(bs.get(&large.address(), Some(&[][..])).unwrap(), large);
    }

    #[test]
    fn test_compressed_roundtrip_in_every_storage() {
        let (_dir, bs) = open_blobstor(true);
        for size in [100, 300 * 1024] {
            let obj = object_of(size);
            let sid = put(&bs, &obj);
            assert_eq!(bs.get(&obj.address(), Some(sid.as_slice())).unwrap(), obj);
            assert_eq!(
                bs.get_range(&obj.address(), Some(sid.as_slice()), 10, 20).unwrap(),
                vec![0x5a; 20]
            );
        }
    }

    #[test]
    fn test_delete() {
        let (_dir, bs) = open_blobstor(false);
        let small = object_of(10);
        let sid = put(&bs, &small);

        bs.delete(&small.address(), Some(sid.as_slice())).unwrap();
        assert!(!bs.exists(&small.address(), None).unwrap());
        assert!(matches!(
            bs.delete(&small.address(), Some(sid.as_slice())),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            bs.get(&small.address(), None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_read_only() {
        let (_dir, bs) = open_blobstor(false);
        let obj = object_of(10);
        put(&bs, &obj);

        bs.set_mode(Mode::ReadOnly).unwrap();
        let other = object_of(10);
        let raw = other.marshal().unwrap();
        assert!(matches!(bs.put(&other, &raw, true), Err(Error::ReadOnly)));
        assert!(matches!(
            bs.delete(&obj.address(), None),
            Err(Error::ReadOnly)
        ));
        assert_eq!(bs.get(&obj.address(), None).unwrap(), obj);
    }

    #[test]
    fn test_fstree_must_be_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ShardConfig::with_root(dir.path()).blobstor;
        config.storages.reverse();
        assert!(matches!(
            BlobStor::open(&config),
            Err(Error::Configuration(_))
        ));
    }
}
