//! Per-file lock rows
//!
//! A lock is a row in the `@lock` partition keyed by the file id. Taking it
//! is a conditional create; releasing it is a delete conditioned on the
//! owner token, so a holder whose lease was taken over can never remove
//! the new owner's lock.
//!
//! Acquisition retries with exponential backoff and jitter, and gives up
//! with [`Error::LockTimeout`] after the configured number of attempts.

use crate::hex_key;
use kvfs_common::config::LockConfig;
use kvfs_common::{Error, Result};
use kvfs_kv::{Condition, Conditional, Item, ItemKey, KvBackend};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_PARTITION: &str = "@lock";

const OWNER_ATTR: &str = "owner";
const KIND_ATTR: &str = "kind";
const EXPIRES_ATTR: &str = "expires_ms";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    /// Held while a file record changes location (rename, detach)
    Exclusive,
    /// Held while links to a file are added or removed
    Write,
}

impl LockKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Write => "write",
        }
    }
}

/// Lock service over the shared table
#[derive(Clone)]
pub struct FileLock {
    kv: Arc<dyn KvBackend>,
    policy: LockConfig,
}

impl FileLock {
    pub fn new(kv: Arc<dyn KvBackend>, policy: LockConfig) -> Self {
        Self { kv, policy }
    }

    fn key(id: u64) -> ItemKey {
        ItemKey::new(LOCK_PARTITION, hex_key(id))
    }

    /// Block (with backoff) until the lock on `id` is ours
    pub async fn acquire(&self, id: u64, kind: LockKind) -> Result<LockGuard> {
        backoff(&self.policy, id, || self.try_acquire(id, kind)).await
    }

    /// Single attempt; `None` when another holder has a live lease
    pub async fn try_acquire(&self, id: u64, kind: LockKind) -> Result<Option<LockGuard>> {
        let key = Self::key(id);
        let token = Uuid::new_v4().to_string();
        let now = now_millis();
        let lease = i64::try_from(self.policy.lease_ms).unwrap_or(i64::MAX);
        let row = Item::new(key.clone())
            .with(OWNER_ATTR, token.as_str())
            .with(KIND_ATTR, kind.as_str())
            .with(EXPIRES_ATTR, now.saturating_add(lease));

        let guard = || LockGuard {
            kv: Arc::clone(&self.kv),
            key: key.clone(),
            token: token.clone(),
            id,
            released: false,
        };

        if self.kv.put(row.clone(), Condition::NotExists).await?.is_applied() {
            debug!("Acquired {:?} lock on file {}", kind, id);
            return Ok(Some(guard()));
        }

        let Some(current) = self.kv.get(&key, None).await? else {
            // Released between our attempts; next round will take it
            return Ok(None);
        };
        let expired = current.int(EXPIRES_ATTR).is_some_and(|at| at < now);
        if let (true, Some(owner)) = (expired, current.str(OWNER_ATTR)) {
            warn!(
                "Taking over expired lock on file {} from owner {}",
                id, owner
            );
            let takeover = self
                .kv
                .put(row, Condition::attr_equals(OWNER_ATTR, owner))
                .await?;
            if takeover.is_applied() {
                return Ok(Some(guard()));
            }
        }
        Ok(None)
    }
}

/// A held lock. Call [`LockGuard::release`] when done; a guard dropped
/// without it (error path, cancelled task) releases in the background.
pub struct LockGuard {
    kv: Arc<dyn KvBackend>,
    key: ItemKey,
    token: String,
    id: u64,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Release the lock. Failures are logged; the lease bounds how long a
    /// leaked lock can block others.
    pub async fn release(mut self) {
        self.released = true;
        let condition = Condition::attr_equals(OWNER_ATTR, self.token.as_str());
        match self.kv.delete(&self.key, condition).await {
            Ok(Conditional::Applied(_)) => debug!("Released lock on file {}", self.id),
            Ok(Conditional::ConditionFailed) => {
                warn!("Lock on file {} was taken over before release", self.id);
            }
            Err(e) => warn!("Failed to release lock on file {}: {}", self.id, e),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let kv = Arc::clone(&self.kv);
        let key = self.key.clone();
        let condition = Condition::attr_equals(OWNER_ATTR, self.token.as_str());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = kv.delete(&key, condition).await;
                });
            }
            Err(_) => warn!("Lock on file {} left to expire", self.id),
        }
    }
}

async fn backoff<F, Fut, R>(policy: &LockConfig, id: u64, mut attempt: F) -> Result<R>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<R>>>,
{
    let attempts = policy.max_retries.max(1);
    for n in 0..attempts {
        if let Some(r) = attempt().await? {
            return Ok(r);
        }
        if n + 1 == attempts {
            break;
        }
        let exp = policy
            .base_delay_ms
            .saturating_mul(1_u64 << n.min(16))
            .min(policy.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=policy.base_delay_ms);
        debug!("Lock on file {} busy, retry {} in {}ms", id, n + 1, exp + jitter);
        tokio::time::sleep(Duration::from_millis(exp + jitter)).await;
    }
    Err(Error::LockTimeout { id, attempts })
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
