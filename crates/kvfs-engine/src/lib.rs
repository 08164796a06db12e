#![allow(clippy::missing_errors_doc)]
//! kvfs Storage Engine
//!
//! This crate implements the metadata and block storage engine of a POSIX
//! filesystem whose rows live in a key-value store. It owns the key design,
//! block splitting of file content, hard-link indirection and the row-lock
//! protocol that keeps unlink/rename/link safe without multi-row
//! transactions.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────┐
//! │        Filesystem         │  getattr/read/write/rename/unlink/...
//! └──┬──────────┬──────────┬──┘
//!    │          │          │
//! ┌──▼───┐  ┌───▼────┐  ┌──▼────────┐
//! │Record│  │ Block  │  │   Link    │──► FileLock
//! │Store │  │ Store  │  │   Layer   │
//! └──┬───┘  └───┬────┘  └──┬────────┘
//!    └──────────┼──────────┘
//!        ┌──────▼───────┐
//!        │  KvBackend   │  (+ IdAllocator counter row)
//!        └──────────────┘
//! ```
//!
//! # Row layout
//!
//! | Partition        | Sort key            | Row                      |
//! |------------------|---------------------|--------------------------|
//! | parent path      | entry name          | directory entry          |
//! | `@inode`         | file id (hex)       | shared file of hard links|
//! | `@blk:{id}`      | block index (hex)   | one 32 KiB block         |
//! | `@lock`          | file id (hex)       | lock on one file         |
//! | `@global`        | `counter`           | id counter               |

pub mod block;
pub mod counter;
pub mod fs;
pub mod handles;
pub mod link;
pub mod lock;
pub mod record;

#[cfg(test)]
pub(crate) mod testing;

pub use block::{BlockMapper, BlockRange, BlockStore};
pub use counter::IdAllocator;
pub use fs::Filesystem;
pub use handles::HandleAllocator;
pub use link::{LinkLayer, ReconcileReport};
pub use lock::{FileLock, LockGuard, LockKind};
pub use record::{DirEntry, EntryKind, Metadata, RecordStore};

pub use kvfs_common::{BLOCK_SIZE, Error, MAX_NAME_LEN, Result};

/// Saturating conversion for values stored as signed row attributes
pub(crate) fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Inverse of [`to_i64`]; negative values read back as zero
pub(crate) fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

/// Sort key used for ids and block indices; fixed width keeps
/// lexicographic order equal to numeric order.
pub(crate) fn hex_key(n: u64) -> String {
    format!("{n:016x}")
}
