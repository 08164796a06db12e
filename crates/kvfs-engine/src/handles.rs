//! Process-local file handle numbers
//!
//! Handles returned by `open`/`opendir` only need to be unique inside one
//! running process, so a single atomic is enough.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleAllocator {
    /// Handles start at 1; 0 is left for "no handle"
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
