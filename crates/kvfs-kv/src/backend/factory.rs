//! Backend factory
//!
//! Builds the configured backend and wraps it in the call deadline.

use super::KvBackend;
use super::memory::MemoryBackend;
use super::redb_backend::RedbBackend;
use super::timeout::TimeoutBackend;
use crate::error::KvResult;
use kvfs_common::config::{BackendConfig, BackendKind};
use std::sync::Arc;
use tracing::info;

/// Open the backend described by `config`
pub fn open_backend(config: &BackendConfig) -> KvResult<Arc<dyn KvBackend>> {
    let backend: Arc<dyn KvBackend> = match (config.kind, config.timeout()) {
        (BackendKind::Memory, None) => Arc::new(MemoryBackend::new()),
        (BackendKind::Memory, Some(t)) => Arc::new(TimeoutBackend::new(MemoryBackend::new(), t)),
        (BackendKind::Redb, None) => Arc::new(RedbBackend::open(&config.path)?),
        (BackendKind::Redb, Some(t)) => {
            Arc::new(TimeoutBackend::new(RedbBackend::open(&config.path)?, t))
        }
    };
    info!(
        "Using {} backend (timeout: {:?})",
        backend.name(),
        config.timeout()
    );
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemKey;

    #[tokio::test]
    async fn test_open_memory_backend() {
        let config = BackendConfig {
            kind: BackendKind::Memory,
            ..Default::default()
        };
        let kv = open_backend(&config).unwrap();
        assert_eq!(kv.name(), "memory");
        assert_eq!(
            kv.increment(&ItemKey::new("@global", "counter"), "value", 1)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_open_redb_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig {
            kind: BackendKind::Redb,
            path: dir.path().join("nested").join("fs.redb"),
            timeout_ms: 0,
            ..Default::default()
        };
        let kv = open_backend(&config).unwrap();
        assert_eq!(kv.name(), "redb");
        assert_eq!(kv.item_count().await.unwrap(), 0);
    }
}
