//! In-memory backend
//!
//! An ordered map behind a single lock. Each call holds the lock for the
//! whole read-evaluate-write cycle, which gives the same per-row atomicity
//! a real store provides (and more, which is harmless).

use super::{KvBackend, collect_page};
use crate::error::KvResult;
use crate::types::{
    Attrs, Condition, Conditional, Item, ItemKey, Page, SortCondition, UpdateOp, apply_updates,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Process-local key-value table
#[derive(Default)]
pub struct MemoryBackend {
    rows: RwLock<BTreeMap<ItemKey, Attrs>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored in `partition`
    #[must_use]
    pub fn partition_len(&self, partition: &str) -> usize {
        self.rows
            .read()
            .keys()
            .filter(|k| k.partition == partition)
            .count()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &ItemKey, projection: Option<&[&str]>) -> KvResult<Option<Item>> {
        Ok(self.rows.read().get(key).map(|attrs| {
            Item {
                key: key.clone(),
                attrs: attrs.clone(),
            }
            .project(projection)
        }))
    }

    async fn put(&self, item: Item, condition: Condition) -> KvResult<Conditional<()>> {
        let mut rows = self.rows.write();
        if !condition.evaluate(rows.get(&item.key)) {
            return Ok(Conditional::ConditionFailed);
        }
        rows.insert(item.key, item.attrs);
        Ok(Conditional::Applied(()))
    }

    async fn update(
        &self,
        key: &ItemKey,
        ops: &[UpdateOp],
        condition: Condition,
    ) -> KvResult<Conditional<Item>> {
        let mut rows = self.rows.write();
        let current = rows.get(key);
        if !condition.evaluate(current) {
            return Ok(Conditional::ConditionFailed);
        }
        let mut attrs = current.cloned().unwrap_or_default();
        apply_updates(&mut attrs, ops)?;
        rows.insert(key.clone(), attrs.clone());
        Ok(Conditional::Applied(Item {
            key: key.clone(),
            attrs,
        }))
    }

    async fn delete(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> KvResult<Conditional<Option<Item>>> {
        let mut rows = self.rows.write();
        if !condition.evaluate(rows.get(key)) {
            return Ok(Conditional::ConditionFailed);
        }
        Ok(Conditional::Applied(rows.remove(key).map(|attrs| Item {
            key: key.clone(),
            attrs,
        })))
    }

    async fn query(
        &self,
        partition: &str,
        sort: &SortCondition,
        start_after: Option<&str>,
        limit: usize,
        projection: Option<&[&str]>,
    ) -> KvResult<Page> {
        let rows = self.rows.read();
        let lower = match start_after {
            Some(after) => Bound::Excluded(ItemKey::new(partition, after)),
            None => Bound::Included(ItemKey::new(partition, "")),
        };
        let candidates = rows
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.partition == partition)
            .filter(|(k, _)| sort.matches(&k.sort))
            .map(|(k, attrs)| {
                Item {
                    key: k.clone(),
                    attrs: attrs.clone(),
                }
                .project(projection)
            });
        Ok(collect_page(candidates, limit))
    }

    async fn scan(&self, start_after: Option<&ItemKey>, limit: usize) -> KvResult<Page> {
        let rows = self.rows.read();
        let lower = start_after.map_or(Bound::Unbounded, |k| Bound::Excluded(k.clone()));
        let candidates = rows
            .range((lower, Bound::Unbounded))
            .map(|(k, attrs)| Item {
                key: k.clone(),
                attrs: attrs.clone(),
            });
        Ok(collect_page(candidates, limit))
    }

    async fn item_count(&self) -> KvResult<u64> {
        Ok(self.rows.read().len() as u64)
    }
}
