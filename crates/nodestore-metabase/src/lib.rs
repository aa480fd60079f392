//! nodestore Metabase - transactional object index
//!
//! The metabase records which objects a shard stores and where, which of
//! them are logically removed (the graveyard), which are protected by lock
//! objects and which are queued for migration between storage tiers.

pub mod epoch;
pub mod store;
pub mod tables;

// Re-exports
pub use epoch::EpochState;
pub use store::Metabase;
