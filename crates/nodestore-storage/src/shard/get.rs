use super::Shard;
use nodestore_common::{Address, Error, Object, Result};
use tracing::warn;

/// Where main storage should look for an object
enum Lookup {
    /// Not indexed; only the write-cache may hold it
    Unindexed,
    /// Indexed with the given storage ID
    Indexed(Vec<u8>),
    /// Metabase disabled; search every sub-storage
    Anywhere,
}

impl Shard {
    /// Read a whole object.
    ///
    /// Removal, expiration and split results of the metabase are returned
    /// as-is; otherwise the write-cache is tried before main storage.
    pub fn get(&self, addr: &Address) -> Result<Object> {
        let lookup = self.lookup(addr)?;

        if let Some(object) = self.cached(addr) {
            return Ok(object);
        }
        match lookup {
            Lookup::Unindexed => Err(Error::NotFound(*addr)),
            Lookup::Indexed(storage_id) => self.blobstor.get(addr, Some(&storage_id)),
            Lookup::Anywhere => self.blobstor.get(addr, None),
        }
    }

    /// Payload bytes `[offset, offset + length)` of an object
    pub fn get_range(&self, addr: &Address, offset: u64, length: u64) -> Result<Vec<u8>> {
        let object = self.get(addr)?;
        Ok(object.payload_range(offset, length)?.to_vec())
    }

    /// Check whether the object is stored and alive
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        match self.lookup(addr)? {
            Lookup::Indexed(_) => Ok(true),
            Lookup::Anywhere => {
                if self.cached_exists(addr) {
                    return Ok(true);
                }
                self.blobstor.exists(addr, None)
            }
            Lookup::Unindexed => Ok(self.cached_exists(addr)),
        }
    }

    fn lookup(&self, addr: &Address) -> Result<Lookup> {
        if self.mode().no_metabase() {
            return Ok(Lookup::Anywhere);
        }
        match self.metabase.exists(addr) {
            Ok(true) => {}
            Ok(false) => return Ok(Lookup::Unindexed),
            Err(Error::MetabaseDisabled) => return Ok(Lookup::Anywhere),
            Err(e) => return Err(e),
        }
        let storage_id = self.metabase.storage_id(addr)?;
        Ok(Lookup::Indexed(storage_id.unwrap_or_default()))
    }

    fn cached(&self, addr: &Address) -> Option<Object> {
        let wc = self.write_cache.as_ref()?;
        match wc.get(addr) {
            Ok(object) => Some(object),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!("Can't read {} from the write-cache: {}", addr, e);
                None
            }
        }
    }

    fn cached_exists(&self, addr: &Address) -> bool {
        let Some(wc) = &self.write_cache else {
            return false;
        };
        wc.exists(addr).unwrap_or_else(|e| {
            warn!("Can't check {} in the write-cache: {}", addr, e);
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{container, object_in, object_of, open_shard, system_object};
    use nodestore_common::{
        ATTRIBUTE_EXPIRATION_EPOCH, Error, OWNER_ID_SIZE, Object, ObjectType, OwnerId,
    };

    #[test]
    fn test_get_range() {
        for with_cache in [false, true] {
            let (_dir, shard) = open_shard(with_cache);
            let obj = object_of(300);
            shard.put(&obj).unwrap();

            assert_eq!(
                shard.get_range(&obj.address(), 100, 50).unwrap(),
                obj.payload()[100..150].to_vec()
            );
            assert!(matches!(
                shard.get_range(&obj.address(), 290, 20),
                Err(Error::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_missing_object() {
        let (_dir, shard) = open_shard(true);
        let obj = object_of(10);
        assert!(matches!(
            shard.get(&obj.address()),
            Err(Error::NotFound(_))
        ));
        assert!(!shard.exists(&obj.address()).unwrap());
    }

    #[test]
    fn test_exists_sees_cached_and_stored_objects() {
        let (_dir, shard) = open_shard(true);
        let cached = object_of(10);
        let stored = object_of(2 * 1024 * 1024);
        shard.put(&cached).unwrap();
        shard.put(&stored).unwrap();

        assert!(shard.exists(&cached.address()).unwrap());
        assert!(shard.exists(&stored.address()).unwrap());
    }

    #[test]
    fn test_expired_object_is_reported() {
        let (_dir, shard) = open_shard(false);
        let obj = Object::builder(container(), OwnerId::from_bytes([2u8; OWNER_ID_SIZE]))
            .attribute(ATTRIBUTE_EXPIRATION_EPOCH, "5")
            .payload(vec![1u8; 10])
            .build()
            .unwrap();
        shard.put(&obj).unwrap();

        assert!(matches!(shard.get(&obj.address()), Err(Error::Expired(_))));
        assert!(matches!(
            shard.exists(&obj.address()),
            Err(Error::Expired(_))
        ));
    }

    #[test]
    fn test_inhumed_object_hidden_even_if_cached() {
        let (_dir, shard) = open_shard(true);
        let cnr = container();
        let obj = object_in(cnr, 10);
        shard.put(&obj).unwrap();

        let tombstone = system_object(cnr, ObjectType::Tombstone, &[]);
        shard.inhume(&tombstone.address(), &[obj.address()]).unwrap();
        assert!(matches!(
            shard.get(&obj.address()),
            Err(Error::AlreadyRemoved(_))
        ));
        assert!(matches!(
            shard.exists(&obj.address()),
            Err(Error::AlreadyRemoved(_))
        ));
    }
}
