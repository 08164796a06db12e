//! Key-value backend abstraction
//!
//! # Backends
//!
//! - `memory`: process-local ordered map (tests, scratch mounts)
//! - `redb_backend`: single-file redb database (persistent)
//! - `timeout`: decorator bounding every call of another backend
//!
//! Every operation is atomic for the single row it touches. There are no
//! multi-row transactions; callers build higher-level consistency from
//! conditional writes.

pub mod factory;
pub mod memory;
pub mod redb_backend;
pub mod timeout;

use crate::error::KvResult;
use crate::types::{Condition, Conditional, Item, ItemKey, Page, SortCondition, UpdateOp};
use async_trait::async_trait;

/// Capability contract the filesystem engine is written against
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Point lookup, optionally returning only the named attributes
    async fn get(&self, key: &ItemKey, projection: Option<&[&str]>) -> KvResult<Option<Item>>;

    /// Write a whole row if `condition` holds for its current state
    async fn put(&self, item: Item, condition: Condition) -> KvResult<Conditional<()>>;

    /// Mutate attributes of a row if `condition` holds. A missing row is
    /// created when the condition allows it. Returns the row after the update.
    async fn update(
        &self,
        key: &ItemKey,
        ops: &[UpdateOp],
        condition: Condition,
    ) -> KvResult<Conditional<Item>>;

    /// Delete a row if `condition` holds. Returns the removed row, if any.
    async fn delete(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> KvResult<Conditional<Option<Item>>>;

    /// One page of rows in `partition` whose sort key satisfies `sort` and is
    /// strictly greater than `start_after`, in sort-key order.
    async fn query(
        &self,
        partition: &str,
        sort: &SortCondition,
        start_after: Option<&str>,
        limit: usize,
        projection: Option<&[&str]>,
    ) -> KvResult<Page>;

    /// One page of the whole table in key order, resuming after `start_after`
    async fn scan(&self, start_after: Option<&ItemKey>, limit: usize) -> KvResult<Page>;

    /// Row count of the whole table. May be an estimate.
    async fn item_count(&self) -> KvResult<u64>;

    /// Atomically add `delta` to an integer attribute and return the new value.
    /// The row is created if missing.
    async fn increment(&self, key: &ItemKey, attr: &str, delta: i64) -> KvResult<i64> {
        let ops = [UpdateOp::add(attr, delta)];
        match self.update(key, &ops, Condition::Always).await? {
            Conditional::Applied(item) => item.int(attr).ok_or_else(|| {
                crate::KvError::Rejected(format!("counter attribute {attr} missing after update"))
            }),
            Conditional::ConditionFailed => Err(crate::KvError::Rejected(
                "unconditional increment was rejected".to_string(),
            )),
        }
    }
}

/// Build a page from an ordered iterator of candidate rows
pub(crate) fn collect_page(rows: impl Iterator<Item = Item>, limit: usize) -> Page {
    let limit = limit.max(1);
    let mut items = Vec::with_capacity(limit.min(1024));
    let mut more = false;
    for item in rows {
        if items.len() == limit {
            more = true;
            break;
        }
        items.push(item);
    }
    let last_key = if more {
        items.last().map(|i| i.key.clone())
    } else {
        None
    };
    Page { items, last_key }
}
