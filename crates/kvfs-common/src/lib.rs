//! kvfs Common - Shared types and utilities
//!
//! This crate provides the error vocabulary, configuration structures and
//! path/key types shared by the key-value backends and the filesystem engine.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Fixed size of one content block (32 KiB).
pub const BLOCK_SIZE: u64 = 32 * 1024;

/// Longest accepted path (and path component), in bytes.
pub const MAX_NAME_LEN: usize = 1024;
