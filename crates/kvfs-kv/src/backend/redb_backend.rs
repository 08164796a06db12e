//! Persistent backend using Redb
//!
//! All rows live in one table keyed by `"{partition}\x00{sort}"` so a
//! partition is a contiguous key range. Every mutating call runs in its own
//! write transaction; redb serialises writers, which makes each
//! read-evaluate-write cycle atomic for its row.

use super::{KvBackend, collect_page};
use crate::error::{KvError, KvResult};
use crate::tables::{self, KEY_SEPARATOR};
use crate::types::{
    Attrs, Condition, Conditional, Item, ItemKey, Page, SortCondition, UpdateOp, apply_updates,
};
use async_trait::async_trait;
use redb::{Database, ReadableTable, ReadableTableMetadata};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

/// Redb-backed key-value table
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open (or create) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::ITEMS)?;
        }
        write_txn.commit()?;

        info!("Opened redb table at {:?}", path);
        Ok(Self { db: Arc::new(db) })
    }

    /// Run a blocking closure against the database off the async runtime
    async fn blocking<T, F>(&self, f: F) -> KvResult<T>
    where
        F: FnOnce(&Database) -> KvResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| KvError::Unavailable(format!("blocking task failed: {e}")))?
    }

    /// Read-evaluate-write cycle for one row inside a single write txn.
    ///
    /// `mutate` receives the current attributes and returns the new state
    /// (`None` deletes the row) plus the value handed back to the caller.
    fn modify<T>(
        db: &Database,
        key: &ItemKey,
        condition: &Condition,
        mutate: impl FnOnce(Option<Attrs>) -> KvResult<(Option<Attrs>, T)>,
    ) -> KvResult<Conditional<T>> {
        let composite = encode_key(key);
        let write_txn = db.begin_write()?;
        let result = {
            let mut table = write_txn.open_table(tables::ITEMS)?;
            let current = match table.get(composite.as_str())? {
                Some(bytes) => Some(decode_attrs(bytes.value())?),
                None => None,
            };
            if !condition.evaluate(current.as_ref()) {
                None
            } else {
                let (next, out) = mutate(current)?;
                match next {
                    Some(attrs) => {
                        let bytes = bincode::serialize(&attrs)?;
                        table.insert(composite.as_str(), bytes.as_slice())?;
                    }
                    None => {
                        table.remove(composite.as_str())?;
                    }
                }
                Some(out)
            }
        };
        match result {
            Some(out) => {
                write_txn.commit()?;
                Ok(Conditional::Applied(out))
            }
            None => {
                write_txn.abort()?;
                Ok(Conditional::ConditionFailed)
            }
        }
    }
}

#[async_trait]
impl KvBackend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn get(&self, key: &ItemKey, projection: Option<&[&str]>) -> KvResult<Option<Item>> {
        let key = key.clone();
        let projection: Option<Vec<String>> =
            projection.map(|p| p.iter().map(ToString::to_string).collect());
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(tables::ITEMS)?;
            let Some(bytes) = table.get(encode_key(&key).as_str())? else {
                return Ok(None);
            };
            let attrs = decode_attrs(bytes.value())?;
            let names: Option<Vec<&str>> =
                projection.as_ref().map(|p| p.iter().map(String::as_str).collect());
            Ok(Some(Item { key, attrs }.project(names.as_deref())))
        })
        .await
    }

    async fn put(&self, item: Item, condition: Condition) -> KvResult<Conditional<()>> {
        self.blocking(move |db| {
            Self::modify(db, &item.key, &condition, |_| Ok((Some(item.attrs.clone()), ())))
        })
        .await
    }

    async fn update(
        &self,
        key: &ItemKey,
        ops: &[UpdateOp],
        condition: Condition,
    ) -> KvResult<Conditional<Item>> {
        let key = key.clone();
        let ops = ops.to_vec();
        self.blocking(move |db| {
            Self::modify(db, &key, &condition, |current| {
                let mut attrs = current.unwrap_or_default();
                apply_updates(&mut attrs, &ops)?;
                let item = Item {
                    key: key.clone(),
                    attrs: attrs.clone(),
                };
                Ok((Some(attrs), item))
            })
        })
        .await
    }

    async fn delete(
        &self,
        key: &ItemKey,
        condition: Condition,
    ) -> KvResult<Conditional<Option<Item>>> {
        let key = key.clone();
        self.blocking(move |db| {
            Self::modify(db, &key, &condition, |current| {
                let removed = current.map(|attrs| Item {
                    key: key.clone(),
                    attrs,
                });
                Ok((None, removed))
            })
        })
        .await
    }

    async fn query(
        &self,
        partition: &str,
        sort: &SortCondition,
        start_after: Option<&str>,
        limit: usize,
        projection: Option<&[&str]>,
    ) -> KvResult<Page> {
        let partition = partition.to_string();
        let sort = sort.clone();
        let start_after = start_after.map(ToString::to_string);
        let projection: Option<Vec<String>> =
            projection.map(|p| p.iter().map(ToString::to_string).collect());
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(tables::ITEMS)?;
            let prefix = format!("{partition}{KEY_SEPARATOR}");
            let start = encode_key(&ItemKey::new(
                partition.as_str(),
                start_after.as_deref().unwrap_or(""),
            ));
            let names: Option<Vec<&str>> =
                projection.as_ref().map(|p| p.iter().map(String::as_str).collect());

            let mut rows = Vec::new();
            for entry in table.range(start.as_str()..)? {
                let (k, v) = entry?;
                let composite = k.value();
                if !composite.starts_with(prefix.as_str()) {
                    break;
                }
                let item_key = decode_key(composite)?;
                if start_after.as_deref() == Some(item_key.sort.as_str())
                    || !sort.matches(&item_key.sort)
                {
                    continue;
                }
                rows.push(
                    Item {
                        key: item_key,
                        attrs: decode_attrs(v.value())?,
                    }
                    .project(names.as_deref()),
                );
                // One extra row tells collect_page whether more follow
                if rows.len() > limit.max(1) {
                    break;
                }
            }
            Ok(collect_page(rows.into_iter(), limit))
        })
        .await
    }

    async fn scan(&self, start_after: Option<&ItemKey>, limit: usize) -> KvResult<Page> {
        let start_after = start_after.map(encode_key);
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(tables::ITEMS)?;
            let iter = match start_after.as_deref() {
                Some(start) => table.range(start..)?,
                None => table.iter()?,
            };
            let mut rows = Vec::new();
            for entry in iter {
                let (k, v) = entry?;
                if start_after.as_deref() == Some(k.value()) {
                    continue;
                }
                rows.push(Item {
                    key: decode_key(k.value())?,
                    attrs: decode_attrs(v.value())?,
                });
                if rows.len() > limit.max(1) {
                    break;
                }
            }
            Ok(collect_page(rows.into_iter(), limit))
        })
        .await
    }

    async fn item_count(&self) -> KvResult<u64> {
        self.blocking(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(tables::ITEMS)?;
            Ok(table.len()?)
        })
        .await
    }
}

fn encode_key(key: &ItemKey) -> String {
    format!("{}{KEY_SEPARATOR}{}", key.partition, key.sort)
}

fn decode_key(composite: &str) -> KvResult<ItemKey> {
    composite
        .split_once(KEY_SEPARATOR)
        .map(|(p, s)| ItemKey::new(p, s))
        .ok_or_else(|| {
            error!("Malformed row key {:?}", composite);
            KvError::Rejected(format!("malformed row key {composite:?}"))
        })
}

fn decode_attrs(bytes: &[u8]) -> KvResult<Attrs> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_redb_roundtrip_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.redb");
        let key = ItemKey::new("/", "file");

        {
            let kv = RedbBackend::open(&path).unwrap();
            let applied = kv
                .put(
                    Item::new(key.clone()).with("id", 9_i64).with("data", vec![1u8, 2, 3]),
                    Condition::NotExists,
                )
                .await
                .unwrap();
            assert!(applied.is_applied());
        }

        let kv = RedbBackend::open(&path).unwrap();
        let item = kv.get(&key, None).await.unwrap().unwrap();
        assert_eq!(item.int("id"), Some(9));
        assert_eq!(item.bytes("data"), Some(&[1u8, 2, 3][..]));
        assert_eq!(kv.item_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redb_conditional_update() {
        let dir = tempdir().unwrap();
        let kv = RedbBackend::open(dir.path().join("fs.redb")).unwrap();
        let key = ItemKey::new("@lock", "0000000000000001");

        let first = kv
            .update(&key, &[UpdateOp::set("owner", "a")], Condition::NotExists)
            .await
            .unwrap();
        assert!(first.is_applied());

        let second = kv
            .update(&key, &[UpdateOp::set("owner", "b")], Condition::NotExists)
            .await
            .unwrap();
        assert_eq!(second, Conditional::ConditionFailed);

        let item = kv.get(&key, None).await.unwrap().unwrap();
        assert_eq!(item.str("owner"), Some("a"));
    }

    #[tokio::test]
    async fn test_redb_query_stays_in_partition() {
        let dir = tempdir().unwrap();
        let kv = RedbBackend::open(dir.path().join("fs.redb")).unwrap();
        for i in 0..5_u64 {
            let _ = kv.put(Item::new(ItemKey::new("@blk:1", format!("{i:016x}"))), Condition::Always)
                .await
                .unwrap();
        }
        let _ = kv.put(Item::new(ItemKey::new("@blk:10", "0")), Condition::Always)
            .await
            .unwrap();

        let page = kv
            .query("@blk:1", &SortCondition::Ge(format!("{:016x}", 2)), None, 2, None)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        let resume = page.last_key.unwrap();

        let rest = kv
            .query("@blk:1", &SortCondition::All, Some(&resume.sort), 10, None)
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 1);
        assert!(rest.last_key.is_none());
        assert!(rest.items.iter().all(|i| i.key.partition == "@blk:1"));
    }

    #[tokio::test]
    async fn test_redb_increment() {
        let dir = tempdir().unwrap();
        let kv = RedbBackend::open(dir.path().join("fs.redb")).unwrap();
        let key = ItemKey::new("@global", "counter");
        assert_eq!(kv.increment(&key, "value", 1).await.unwrap(), 1);
        assert_eq!(kv.increment(&key, "value", 1).await.unwrap(), 2);
    }
}
