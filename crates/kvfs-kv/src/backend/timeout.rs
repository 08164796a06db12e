//! Deadline decorator for backends
//!
//! Wraps another backend and fails any call that outlives the configured
//! timeout with [`KvError::Timeout`], so a stalled store surfaces as an I/O
//! error instead of hanging the caller.

use super::KvBackend;
use crate::error::{KvError, KvResult};
use crate::types::{Condition, Conditional, Item, ItemKey, Page, SortCondition, UpdateOp};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub struct TimeoutBackend<B> {
    inner: B,
    timeout: Duration,
}

impl<B: KvBackend> TimeoutBackend<B> {
    pub const fn new(inner: B, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = KvResult<T>> + Send) -> KvResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "{} backend call '{}' exceeded {:?}",
                    self.inner.name(),
                    op,
                    self.timeout
                );
                Err(KvError::Timeout)
            }
        }
    }
}

#[async_trait]
impl<B: KvBackend> KvBackend for TimeoutBackend<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &ItemKey, projection: Option<&[&str]>) -> KvResult<Option<Item>> {
        self.bounded("get", self.inner.get(key, projection)).await
    }

    async fn put(&self, item: Item, condition: Condition) -> KvResult<Conditional<()>> {
        self.bounded("put", self.inner.put(item, condition)).await
    }

    async fn update(
        &self,
        key: &ItemKey,
        ops: &[UpdateOp],
        condition: Condition,
    ) -> KvResult<Conditional<Item>> {
        self.bounded("update", self.inner.update(key, ops, condition))
            .await
    }

    async fn delete(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> KvResult<Conditional<Option<Item>>> {
        self.bounded("delete", self.inner.delete(key, condition)).await
    }

    async fn query(
        &self,
        partition: &str,
        sort: &SortCondition,
        start_after: Option<&str>,
        limit: usize,
        projection: Option<&[&str]>,
    ) -> KvResult<Page> {
        self.bounded(
            "query",
            self.inner
                .query(partition, sort, start_after, limit, projection),
        )
        .await
    }

    async fn scan(&self, start_after: Option<&ItemKey>, limit: usize) -> KvResult<Page> {
        self.bounded("scan", self.inner.scan(start_after, limit)).await
    }

    async fn item_count(&self) -> KvResult<u64> {
        self.bounded("item_count", self.inner.item_count()).await
    }

    async fn increment(&self, key: &ItemKey, attr: &str, delta: i64) -> KvResult<i64> {
        self.bounded("increment", self.inner.increment(key, attr, delta))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;

    /// Backend whose reads never complete
    struct Stalled(MemoryBackend);

    #[async_trait]
    impl KvBackend for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn get(&self, _: &ItemKey, _: Option<&[&str]>) -> KvResult<Option<Item>> {
            std::future::pending().await
        }
        async fn put(&self, item: Item, c: Condition) -> KvResult<Conditional<()>> {
            self.0.put(item, c).await
        }
        async fn update(
            &self,
            k: &ItemKey,
            ops: &[UpdateOp],
            c: Condition,
        ) -> KvResult<Conditional<Item>> {
            self.0.update(k, ops, c).await
        }
        async fn delete(&self, k: &ItemKey, c: Condition) -> KvResult<Conditional<Option<Item>>> {
            self.0.delete(k, c).await
        }
        async fn query(
            &self,
            p: &str,
            s: &SortCondition,
            a: Option<&str>,
            l: usize,
            pr: Option<&[&str]>,
        ) -> KvResult<Page> {
            self.0.query(p, s, a, l, pr).await
        }
        async fn scan(&self, a: Option<&ItemKey>, l: usize) -> KvResult<Page> {
            self.0.scan(a, l).await
        }
        async fn item_count(&self) -> KvResult<u64> {
            self.0.item_count().await
        }
    }

    #[tokio::test]
    async fn test_stalled_call_times_out() {
        let kv = TimeoutBackend::new(Stalled(MemoryBackend::new()), Duration::from_millis(20));
        let err = kv.get(&ItemKey::new("/", "a"), None).await.unwrap_err();
        assert!(matches!(err, KvError::Timeout));

        // Calls that complete pass straight through
        let n = kv.increment(&ItemKey::new("@global", "counter"), "value", 1).await;
        assert_eq!(n.unwrap(), 1);
    }
}
