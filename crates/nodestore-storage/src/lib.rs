//! nodestore Storage Engine - local object persistence
//!
//! This crate implements the storage engine of a node including:
//! - Filesystem tree blob storage with atomic writes
//! - Embedded small-object storage
//! - zstd payload compression
//! - Write-back cache with background flushing and recovery
//! - Shard coordination of cache, metabase and blob storage

pub mod blobstor;
pub mod compression;
pub mod fstree;
pub mod shard;
pub mod smallstore;
pub mod stop;
pub mod storagelog;
pub mod writecache;

// Re-exports
pub use blobstor::{BlobStor, SubStorage};
pub use compression::Compressor;
pub use fstree::{FsTree, IterHandler, IteratePrm, IterationElement};
pub use shard::Shard;
pub use smallstore::SmallStore;
pub use stop::StopSignal;
pub use writecache::WriteCache;
