use super::Shard;
use nodestore_common::{Error, Object, ObjectType, Result};
use tracing::debug;

impl Shard {
    /// Store an object.
    ///
    /// Goes through the write-cache when one is attached and the metabase
    /// is enabled. Capacity and initialization refusals of the cache fall
    /// back to main storage.
    pub fn put(&self, object: &Object) -> Result<()> {
        let mode = self.mode();
        if mode.read_only() {
            return Err(Error::ReadOnly);
        }

        let addr = object.address();
        let raw = object.marshal()?;

        let mut cached = false;
        if let Some(wc) = &self.write_cache
            && !mode.no_metabase()
        {
            match wc.put(object, &raw) {
                Ok(()) => cached = true,
                Err(e) if e.can_bypass_cache() => {
                    debug!("Can't put {} to the write-cache, using main storage: {}", addr, e);
                }
                Err(e) => return Err(e),
            }
        }

        if !cached {
            let dont_compress = !self.blobstor.needs_compression(object.header());
            let storage_id = self.blobstor.put(object, &raw, dont_compress)?;
            if !mode.no_metabase() {
                self.metabase.put(object, &storage_id)?;
            }
        }

        if mode.no_metabase() {
            return Ok(());
        }
        match object.object_type() {
            ObjectType::Regular => Ok(()),
            ObjectType::Tombstone => self.inhume(&addr, &object.member_addresses()),
            ObjectType::Lock => self.metabase.lock(&addr, &object.member_addresses()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Shard;
    use super::super::tests::{
        container, object_in, object_of, open_shard, open_with, shard_config, system_object,
    };
    use nodestore_common::{Error, ObjectType};
    use nodestore_metabase::EpochState;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_put_through_cache() {
        let (_dir, shard) = open_shard(true);
        let small = object_of(100);
        let large = object_of(64 * 1024);
        shard.put(&small).unwrap();
        shard.put(&large).unwrap();

        let wc = shard.write_cache().unwrap();
        assert_eq!(wc.object_counts(), (1, 1));
        assert!(!shard.blobstor.exists(&small.address(), None).unwrap());
        assert_eq!(shard.get(&small.address()).unwrap(), small);
        assert_eq!(shard.get(&large.address()).unwrap(), large);
    }

    #[test]
    fn test_oversized_object_bypasses_cache() {
        let (_dir, shard) = open_shard(true);
        let obj = object_of(2 * 1024 * 1024);
        shard.put(&obj).unwrap();

        assert_eq!(shard.write_cache().unwrap().object_counts(), (0, 0));
        assert!(shard.metabase.exists(&obj.address()).unwrap());
        assert_eq!(shard.metabase.storage_id(&obj.address()).unwrap(), None);
        assert_eq!(shard.get(&obj.address()).unwrap(), obj);
    }

    #[test]
    fn test_put_without_cache_records_storage_id() {
        let (_dir, shard) = open_shard(false);
        let small = object_of(1000);
        shard.put(&small).unwrap();

        assert_eq!(
            shard.metabase.storage_id(&small.address()).unwrap(),
            Some(b"blobovnicza".to_vec())
        );
    }

    #[test]
    fn test_tombstone_inhumes_members() {
        for with_cache in [false, true] {
            let (_dir, shard) = open_shard(with_cache);
            let cnr = container();
            let victim = object_in(cnr, 10);
            shard.put(&victim).unwrap();

            let tombstone = system_object(cnr, ObjectType::Tombstone, &[&victim]);
            shard.put(&tombstone).unwrap();

            assert!(matches!(
                shard.get(&victim.address()),
                Err(Error::AlreadyRemoved(_))
            ));
            if let Some(wc) = shard.write_cache() {
                assert!(!wc.exists(&victim.address()).unwrap());
            }
        }
    }

    #[test]
    fn test_lock_protects_members() {
        let (_dir, shard) = open_shard(true);
        let cnr = container();
        let protected = object_in(cnr, 10);
        shard.put(&protected).unwrap();
        shard
            .put(&system_object(cnr, ObjectType::Lock, &[&protected]))
            .unwrap();

        let tombstone = system_object(cnr, ObjectType::Tombstone, &[&protected]);
        assert!(matches!(shard.put(&tombstone), Err(Error::Locked(_))));
        assert_eq!(shard.get(&protected.address()).unwrap(), protected);
    }

    #[test]
    fn test_uninitialized_cache_falls_back_to_main_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = shard_config(dir.path(), true);
        {
            let shard = open_with(&config);
            for _ in 0..300 {
                shard.put(&object_of(10)).unwrap();
            }
            assert_eq!(shard.write_cache().unwrap().object_counts(), (300, 0));
        }

        let epoch: Arc<dyn EpochState> = Arc::new(AtomicU64::new(10));
        let shard = Shard::open(&config, epoch).unwrap();
        let wc = shard.write_cache().unwrap();
        let interrupted = wc.interrupt_recovery();

        let obj = object_of(10);
        shard.put(&obj).unwrap();
        assert_eq!(shard.get(&obj.address()).unwrap(), obj);
        if interrupted {
            assert!(!wc.exists(&obj.address()).unwrap());
            assert!(shard.metabase.exists(&obj.address()).unwrap());
            assert!(shard.blobstor.exists(&obj.address(), None).unwrap());
            assert_eq!(wc.object_counts(), (300, 0));
        }
    }
}
