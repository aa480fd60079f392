//! Audit records of physical writes and deletions.
//!
//! Every record is a `tracing` event on the `nodestore::storage` target so
//! it can be routed independently of ordinary logs.

use tracing::info;

/// Storage type reported by the write-cache
pub const WRITE_CACHE: &str = "write-cache";

/// Record a physical operation on an object
pub fn write(address: &str, storage_type: &str, op: &str) {
    info!(
        target: "nodestore::storage",
        address,
        storage_type,
        op,
        "local object storage operation"
    );
}
