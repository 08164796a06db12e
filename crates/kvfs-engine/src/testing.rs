//! Shared fixtures for engine tests

use crate::fs::Filesystem;
use async_trait::async_trait;
use kvfs_common::Config;
use kvfs_kv::{
    Condition, Conditional, Item, ItemKey, KvBackend, KvError, KvResult, MemoryBackend, Page,
    SortCondition, UpdateOp,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Config for tests: fast lock retries, hard links enabled
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.fs.enable_hard_links = true;
    config.backend.page_size = 4;
    config.lock.base_delay_ms = 1;
    config.lock.max_delay_ms = 10;
    config.lock.max_retries = 500;
    config
}

pub async fn memory_fs() -> (Arc<MemoryBackend>, Filesystem) {
    let kv = Arc::new(MemoryBackend::new());
    let fs = Filesystem::new(kv.clone(), &test_config()).await.unwrap();
    (kv, fs)
}

/// A failure to inject into the next matching backend call
#[derive(Clone, Debug)]
pub enum Fault {
    /// Fail a delete in this partition before it happens
    DeleteIn(String),
    /// Fail an update touching this attribute before it happens
    UpdateBefore(String),
    /// Apply an update touching this attribute, then report failure
    UpdateAfter(String),
    /// Apply `ops` to `key` right before the next put or delete of that
    /// row, the way a concurrent writer landing in between would
    RaceOnWrite { key: ItemKey, ops: Vec<UpdateOp> },
}

/// Memory backend that fails selected calls once each
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    faults: Mutex<Vec<Fault>>,
}

impl FlakyBackend {
    pub fn arm(&self, fault: Fault) {
        self.faults.lock().push(fault);
    }

    fn take(&self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let idx = faults.iter().position(pred)?;
        Some(faults.remove(idx))
    }

    async fn race(&self, key: &ItemKey) -> KvResult<()> {
        if let Some(Fault::RaceOnWrite { ops, .. }) =
            self.take(|f| matches!(f, Fault::RaceOnWrite { key: k, .. } if k == key))
        {
            let _ = self.inner.update(key, &ops, Condition::Exists).await?;
        }
        Ok(())
    }
}

fn touches(ops: &[UpdateOp], name: &str) -> bool {
    ops.iter().any(|op| match op {
        UpdateOp::Set(n, _)
        | UpdateOp::Remove(n)
        | UpdateOp::Add(n, _)
        | UpdateOp::Append(n, _)
        | UpdateOp::Discard(n, _) => n == name,
    })
}

fn injected() -> KvError {
    KvError::Unavailable("injected fault".to_string())
}

#[async_trait]
impl KvBackend for FlakyBackend {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, key: &ItemKey, projection: Option<&[&str]>) -> KvResult<Option<Item>> {
        self.inner.get(key, projection).await
    }

    async fn put(&self, item: Item, condition: Condition) -> KvResult<Conditional<()>> {
        self.race(&item.key).await?;
        self.inner.put(item, condition).await
    }

    async fn update(
        &self,
        key: &ItemKey,
        ops: &[UpdateOp],
        condition: Condition,
    ) -> KvResult<Conditional<Item>> {
        if self
            .take(|f| matches!(f, Fault::UpdateBefore(a) if touches(ops, a)))
            .is_some()
        {
            return Err(injected());
        }
        let result = self.inner.update(key, ops, condition).await?;
        if self
            .take(|f| matches!(f, Fault::UpdateAfter(a) if touches(ops, a)))
            .is_some()
        {
            return Err(injected());
        }
        Ok(result)
    }

    async fn delete(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> KvResult<Conditional<Option<Item>>> {
        if self
            .take(|f| matches!(f, Fault::DeleteIn(p) if *p == key.partition))
            .is_some()
        {
            return Err(injected());
        }
        self.race(key).await?;
        self.inner.delete(key, condition).await
    }

    async fn query(
        &self,
        partition: &str,
        sort: &SortCondition,
        start_after: Option<&str>,
        limit: usize,
        projection: Option<&[&str]>,
    ) -> KvResult<Page> {
        self.inner
            .query(partition, sort, start_after, limit, projection)
            .await
    }

    async fn scan(&self, start_after: Option<&ItemKey>, limit: usize) -> KvResult<Page> {
        self.inner.scan(start_after, limit).await
    }

    async fn item_count(&self) -> KvResult<u64> {
        self.inner.item_count().await
    }
}
