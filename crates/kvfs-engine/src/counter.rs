//! Durable id allocation
//!
//! File ids come from one counter row incremented atomically by the
//! backend, so they are unique across every process sharing the table.

use kvfs_common::{Error, Result};
use kvfs_kv::{ItemKey, KvBackend};
use std::sync::Arc;
use tracing::trace;

pub const COUNTER_PARTITION: &str = "@global";
pub const COUNTER_SORT: &str = "counter";
const COUNTER_ATTR: &str = "value";

/// Issues globally unique, monotonically increasing ids
#[derive(Clone)]
pub struct IdAllocator {
    kv: Arc<dyn KvBackend>,
    key: ItemKey,
}

impl IdAllocator {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            kv,
            key: ItemKey::new(COUNTER_PARTITION, COUNTER_SORT),
        }
    }

    /// Next id; never returns the same value twice
    pub async fn next(&self) -> Result<u64> {
        let value = self.kv.increment(&self.key, COUNTER_ATTR, 1).await?;
        trace!("allocated id {}", value);
        u64::try_from(value).map_err(|_| Error::internal(format!("id counter is negative: {value}")))
    }
}
