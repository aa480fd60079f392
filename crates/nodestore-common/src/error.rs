//! Error types for nodestore
//!
//! This module defines the common error type used throughout the storage
//! engine. Object-state kinds (`NotFound`, `AlreadyRemoved`, ...) are
//! meaningful to callers; infrastructure kinds wrap lower-level failures.

use crate::types::{Address, AddressError, SplitInfo};
use thiserror::Error;

/// Common result type for nodestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for nodestore
#[derive(Debug, Error)]
pub enum Error {
    // Object state errors
    #[error("object not found: {0}")]
    NotFound(Address),

    #[error("object already removed: {0}")]
    AlreadyRemoved(Address),

    #[error("object expired: {0}")]
    Expired(Address),

    #[error("object {} is virtual, {} parts stored", .0.parent, .0.parts.len())]
    SplitInfo(Box<SplitInfo>),

    #[error("object is locked: {0}")]
    Locked(Address),

    #[error("range {offset}+{length} is out of payload bounds ({payload_length} bytes)")]
    OutOfRange {
        offset: u64,
        length: u64,
        payload_length: u64,
    },

    #[error("can't remove virtual object {0}: it still has live parts")]
    LiveChildren(Address),

    // Mode errors
    #[error("storage is in read-only mode")]
    ReadOnly,

    #[error("write-cache is not initialized yet")]
    NotInitialized,

    #[error("metabase is disabled")]
    MetabaseDisabled,

    // Capacity errors
    #[error("object too large: {size} bytes, max {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("no space left in the write-cache")]
    OutOfSpace,

    #[error("no space left on device")]
    DeviceFull,

    // Infrastructure errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("data corruption detected: {0}")]
    Corrupted(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("iteration stopped")]
    IterationStopped,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if the object is logically gone (graveyard hit or expiration)
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        matches!(self, Self::AlreadyRemoved(_) | Self::Expired(_))
    }

    /// Check if this is a capacity error
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::TooLarge { .. } | Self::OutOfSpace | Self::DeviceFull
        )
    }

    /// Check if the write-cache refused an object that main storage can take
    #[must_use]
    pub const fn can_bypass_cache(&self) -> bool {
        matches!(
            self,
            Self::TooLarge { .. } | Self::OutOfSpace | Self::NotInitialized
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

macro_rules! database_error {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Self::Database(e.to_string())
                }
            }
        )+
    };
}

database_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);
