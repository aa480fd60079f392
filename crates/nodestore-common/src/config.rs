//! Configuration types for nodestore
//!
//! This module defines configuration structures for the node and for each
//! shard it hosts. All structures deserialize from TOML with defaults for
//! every omitted field.

use crate::error::{Error, Result};
use crate::mode::Mode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum nesting depth of a filesystem tree (address string prefix length)
pub const FSTREE_MAX_DEPTH: u64 = 63;

/// Root configuration for a nodestore node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node configuration
    pub node: NodeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Shards hosted by the node
    pub shards: Vec<ShardConfig>,
}

impl Config {
    /// Validate every shard configuration
    pub fn validate(&self) -> Result<()> {
        self.shards.iter().try_for_each(ShardConfig::validate)
    }
}

/// Node identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name (human-readable identifier)
    pub name: String,
    /// Epoch used for expiration checks until a network epoch source is attached
    pub epoch: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "nodestore-node".to_string(),
            epoch: 0,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Configuration of a single shard
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Mode the shard starts in
    #[serde(default)]
    pub mode: Mode,
    /// Metabase configuration
    pub metabase: MetabaseConfig,
    /// Main blob storage configuration
    pub blobstor: BlobStorConfig,
    /// Optional write-cache in front of the main storage
    #[serde(default)]
    pub write_cache: Option<WriteCacheConfig>,
}

impl ShardConfig {
    /// Default layout of a shard rooted at `root`
    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            mode: Mode::ReadWrite,
            metabase: MetabaseConfig {
                path: root.join("meta.redb"),
            },
            blobstor: BlobStorConfig {
                compression: CompressionConfig::default(),
                storages: vec![
                    SubStorageConfig::Embedded(EmbeddedConfig {
                        id: "blobovnicza".to_string(),
                        path: root.join("blobovnicza.redb"),
                        max_object_size: 128 * 1024,
                    }),
                    SubStorageConfig::FsTree(FsTreeConfig {
                        path: root.join("fstree"),
                        ..FsTreeConfig::default()
                    }),
                ],
            },
            write_cache: Some(WriteCacheConfig {
                path: root.join("writecache"),
                ..WriteCacheConfig::default()
            }),
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.blobstor.storages.is_empty() {
            return Err(Error::configuration("blob storage needs at least one sub-storage"));
        }
        if !matches!(
            self.blobstor.storages.last(),
            Some(SubStorageConfig::FsTree(_))
        ) {
            return Err(Error::configuration(
                "the last blob sub-storage must be an fstree accepting any object size",
            ));
        }
        for storage in &self.blobstor.storages {
            if let SubStorageConfig::FsTree(fs) = storage {
                fs.validate()?;
            }
        }
        if let Some(wc) = &self.write_cache {
            wc.validate()?;
        }
        Ok(())
    }
}

/// Metabase configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetabaseConfig {
    /// Path of the metabase database file
    pub path: PathBuf,
}

/// Main blob storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobStorConfig {
    /// Compression policy shared by all sub-storages
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Sub-storages in routing order; the first one accepting an object wins
    pub storages: Vec<SubStorageConfig>,
}

/// Compression policy
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress objects on write
    pub enabled: bool,
    /// zstd compression level
    pub level: i32,
    /// Content types stored as-is (`text/*` style prefixes allowed)
    pub uncompressable_content_types: Vec<String>,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 3,
            uncompressable_content_types: Vec::new(),
        }
    }
}

/// Blob sub-storage selected by configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SubStorageConfig {
    /// Embedded key-value store for small objects
    Embedded(EmbeddedConfig),
    /// Filesystem tree for objects of any size
    FsTree(FsTreeConfig),
}

/// Embedded small-object store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// Identifier recorded as the storage ID of every object stored here
    pub id: String,
    /// Path of the database file
    pub path: PathBuf,
    /// Largest raw object accepted (bytes)
    pub max_object_size: u64,
}

/// Filesystem tree configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsTreeConfig {
    /// Root directory
    pub path: PathBuf,
    /// Number of nested directory levels
    pub depth: u64,
    /// Characters of the encoded address used per directory level
    pub dir_name_len: usize,
    /// Permission bits for created directories and files
    pub permissions: u32,
    /// Skip fsync on write
    pub no_sync: bool,
}

impl Default for FsTreeConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./fstree"),
            depth: 4,
            dir_name_len: 1,
            permissions: 0o700,
            no_sync: false,
        }
    }
}

impl FsTreeConfig {
    /// Check depth and segment width against the encoded address length
    pub fn validate(&self) -> Result<()> {
        if self.dir_name_len == 0 {
            return Err(Error::configuration("fstree dir_name_len must be positive"));
        }
        let prefix = self.depth.checked_mul(self.dir_name_len as u64);
        if prefix.is_none_or(|len| len > FSTREE_MAX_DEPTH) {
            return Err(Error::configuration(format!(
                "fstree depth {} with dir_name_len {} exceeds the address prefix of {} characters",
                self.depth, self.dir_name_len, FSTREE_MAX_DEPTH
            )));
        }
        Ok(())
    }
}

/// Write-cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteCacheConfig {
    /// Directory holding the small-object database and the large-object tree
    pub path: PathBuf,
    /// Objects up to this size go to the small-object tier (bytes)
    pub small_object_size: u64,
    /// Largest object accepted by the cache (bytes)
    pub max_object_size: u64,
    /// Estimated capacity of the cache (bytes)
    pub max_cache_size: u64,
    /// Number of flush worker threads
    pub flush_workers: usize,
    /// Interval between background flush passes (milliseconds)
    pub flush_interval_ms: u64,
    /// Maximum objects read from a tier per flush or recovery step
    pub flush_batch_size: usize,
    /// Nesting depth of the large-object tree
    pub fstree_depth: u64,
    /// Skip fsync on write
    pub no_sync: bool,
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./writecache"),
            small_object_size: 32 * 1024,        // 32 KB
            max_object_size: 64 * 1024 * 1024,   // 64 MB
            max_cache_size: 1024 * 1024 * 1024,  // 1 GB
            flush_workers: 4,
            flush_interval_ms: 1000,
            flush_batch_size: 512,
            fstree_depth: 4,
            no_sync: false,
        }
    }
}

impl WriteCacheConfig {
    /// Check size thresholds and worker count
    pub fn validate(&self) -> Result<()> {
        if self.small_object_size > self.max_object_size {
            return Err(Error::configuration(format!(
                "write-cache small_object_size {} exceeds max_object_size {}",
                self.small_object_size, self.max_object_size
            )));
        }
        if self.flush_workers == 0 || self.flush_batch_size == 0 || self.flush_interval_ms == 0 {
            return Err(Error::configuration(
                "write-cache flush settings must be positive",
            ));
        }
        Ok(())
    }
}
