//! nodestore Common - Shared types and utilities
//!
//! This crate provides the object model, addressing, error definitions,
//! operating modes and configuration used across all nodestore components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod mode;
pub mod types;

pub use checksum::Checksum;
pub use config::Config;
pub use error::{Error, Result};
pub use mode::Mode;
pub use types::*;
