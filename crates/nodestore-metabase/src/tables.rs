//! Redb table definitions for the metabase.
//!
//! Every key is an [`Address`](nodestore_common::Address) index key
//! (container bytes followed by object bytes) unless stated otherwise.

use redb::TableDefinition;

// Key: address, Value: bincode-encoded ObjectHeader
pub const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");
// Key: victim address, Value: tombstone address
pub const GRAVEYARD: TableDefinition<&[u8], &[u8]> = TableDefinition::new("graveyard");
// Key: address queued for migration between tiers
pub const MOVABLE: TableDefinition<&[u8], ()> = TableDefinition::new("movable");
// Key: address, Value: storage ID of the blob sub-storage holding the payload
pub const STORAGE_IDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("storage_ids");
// Key: parent address followed by child object ID
pub const PARENTS: TableDefinition<&[u8], ()> = TableDefinition::new("parents");
// Key: locked address, Value: lock object address
pub const LOCKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("locks");
