//! Hard-link indirection
//!
//! A regular file starts out as a plain record under its path. The first
//! time it is hard-linked the record is detached: its contents move to
//! `@inode/{id}` and the original path is rewritten as an indirection row
//! pointing there. Every further link is another indirection row, and the
//! shared record's `nlink` counts them.
//!
//! ```text
//!   /a/f  ──┐
//!           ├──► @inode/000000000000002a  (nlink 2, owns blocks of id 0x2a)
//!   /b/g  ──┘
//! ```
//!
//! Link creation and removal hold the target's [`LockKind::Write`] lock;
//! detaching holds [`LockKind::Exclusive`]. Each removal first records the
//! link's id in the target's `unlinking` list and only decrements when that
//! marker is still present, so a retried removal never decrements twice.

use crate::block::{BlockStore, parse_partition};
use crate::counter::IdAllocator;
use crate::lock::{FileLock, LockKind};
use crate::record::{
    DirEntry, EntryKind, INODE_PARTITION, RecordStore, attr, inode_key, same_id,
};
use crate::{hex_key, to_i64};
use kvfs_common::{EntryKey, Error, Result, now_secs};
use kvfs_kv::{Condition, Conditional, UpdateOp};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

const DETACH_ATTEMPTS: usize = 8;

/// Result of a link-count reconciliation sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Rows examined
    pub scanned: u64,
    /// Shared records whose count was corrected: `(id, stored, actual)`
    pub repaired: Vec<(u64, u64, u64)>,
    /// Shared records with no remaining links that were removed
    pub destroyed: Vec<u64>,
    /// Indirection rows whose target no longer exists
    pub dangling: Vec<String>,
    /// Block partitions with no owning record
    pub orphan_blocks: Vec<u64>,
}

impl ReconcileReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
            && self.destroyed.is_empty()
            && self.dangling.is_empty()
            && self.orphan_blocks.is_empty()
    }
}

#[derive(Clone)]
pub struct LinkLayer {
    records: RecordStore,
    blocks: BlockStore,
    locks: FileLock,
    ids: IdAllocator,
}

impl LinkLayer {
    pub const fn new(
        records: RecordStore,
        blocks: BlockStore,
        locks: FileLock,
        ids: IdAllocator,
    ) -> Self {
        Self {
            records,
            blocks,
            locks,
            ids,
        }
    }

    /// The record holding an entry's attributes and content: the entry
    /// itself, or the shared record an indirection points at.
    pub async fn content_target(&self, entry: DirEntry) -> Result<DirEntry> {
        let EntryKind::Link { target, target_id } = &entry.kind else {
            return Ok(entry);
        };
        match self.records.get(target).await? {
            Some(found) if found.id == *target_id => Ok(found),
            _ => {
                warn!("Dangling link {} -> {}", entry.key, target);
                Err(Error::not_found(entry.key.path()))
            }
        }
    }

    /// Create a hard link to `target` at `new_key`. The caller has checked
    /// the destination's parent and path length.
    pub async fn link(&self, existing: &DirEntry, new_key: EntryKey) -> Result<DirEntry> {
        let (shared_key, shared_id) = match &existing.kind {
            EntryKind::Link { target, target_id } => (target.clone(), *target_id),
            EntryKind::File => self.detach(existing).await?,
            EntryKind::Directory { .. } => return Err(Error::IsADirectory(existing.key.path())),
            EntryKind::Symlink { .. } => {
                return Err(Error::invalid_argument(format!(
                    "cannot hard-link symlink {}",
                    existing.key
                )));
            }
        };

        let guard = self.locks.acquire(shared_id, LockKind::Write).await?;
        let result = self.link_locked(existing, &shared_key, shared_id, new_key).await;
        guard.release().await;
        result
    }

    async fn link_locked(
        &self,
        existing: &DirEntry,
        shared_key: &EntryKey,
        shared_id: u64,
        new_key: EntryKey,
    ) -> Result<DirEntry> {
        // Count the link before it becomes reachable
        let bumped = self
            .records
            .save_if(
                shared_key,
                &[UpdateOp::add(attr::NLINK, 1), UpdateOp::set(attr::CTIME, now_secs())],
                same_id(shared_id),
            )
            .await?;
        if !bumped.is_applied() {
            return Err(Error::not_found(existing.key.path()));
        }

        let link = DirEntry {
            key: new_key,
            id: self.ids.next().await?,
            meta: existing.meta.clone(),
            kind: EntryKind::Link {
                target: shared_key.clone(),
                target_id: shared_id,
            },
        };
        if let Err(e) = self.records.create(&link).await {
            self.drop_reference(shared_key, shared_id, None).await?;
            return Err(e);
        }
        info!("Linked {} -> {} (file {})", link.key, shared_key, shared_id);
        Ok(link)
    }

    /// Move a plain file record to the `@inode` partition and leave an
    /// indirection at its path. Returns the shared record's key and id.
    async fn detach(&self, entry: &DirEntry) -> Result<(EntryKey, u64)> {
        let guard = self.locks.acquire(entry.id, LockKind::Exclusive).await?;
        let result = self.detach_locked(entry).await;
        guard.release().await;
        result
    }

    async fn detach_locked(&self, entry: &DirEntry) -> Result<(EntryKey, u64)> {
        // Writers grow the size without the lock; retry if one lands mid-copy
        for _ in 0..DETACH_ATTEMPTS {
            let current = match self.records.get(&entry.key).await? {
                Some(current) if current.id == entry.id => current,
                // Replaced by someone else's detach: same file, new row id
                Some(DirEntry {
                    kind: EntryKind::Link { target, target_id },
                    ..
                }) if target_id == entry.id => return Ok((target, target_id)),
                _ => return Err(Error::not_found(entry.key.path())),
            };
            if !matches!(current.kind, EntryKind::File) {
                return Err(Error::invalid_argument(format!(
                    "{} is not a regular file",
                    entry.key
                )));
            }

            let shared = current.relocated(inode_key(current.id));
            let _ = self.records.put(&shared, Condition::Always).await?;

            let indirection = DirEntry {
                key: current.key.clone(),
                id: self.ids.next().await?,
                meta: current.meta.clone(),
                kind: EntryKind::Link {
                    target: shared.key.clone(),
                    target_id: current.id,
                },
            };
            let unchanged = Condition::And(vec![
                same_id(current.id),
                Condition::attr_equals(attr::SIZE, to_i64(current.meta.size)),
            ]);
            if self.records.put(&indirection, unchanged).await?.is_applied() {
                debug!("Detached file {} from {}", current.id, current.key);
                return Ok((shared.key, current.id));
            }
            self.records.delete(&shared.key).await?;
        }
        Err(Error::internal(format!(
            "{} kept changing while being linked",
            entry.key
        )))
    }

    /// Remove an indirection row and release its reference on the shared
    /// record, destroying the record and its blocks on the last one.
    pub async fn delete_link(&self, link: &DirEntry) -> Result<()> {
        let EntryKind::Link { target, target_id } = &link.kind else {
            return Err(Error::invalid_argument(format!("{} is not a link", link.key)));
        };
        let guard = self.locks.acquire(*target_id, LockKind::Write).await?;
        let result = self.delete_link_locked(link, target, *target_id).await;
        guard.release().await;
        result
    }

    async fn delete_link_locked(
        &self,
        link: &DirEntry,
        target: &EntryKey,
        target_id: u64,
    ) -> Result<()> {
        let marker = hex_key(link.id);
        let present = self
            .records
            .get_attrs(&link.key, &[attr::ID])
            .await?
            .is_some_and(|row| row.int(attr::ID) == Some(to_i64(link.id)));

        if present {
            let marked = self
                .records
                .save_if(
                    target,
                    &[UpdateOp::append(attr::UNLINKING, marker.as_str())],
                    same_id(target_id),
                )
                .await?;
            let _ = self.records.delete_if(&link.key, same_id(link.id)).await?;
            if !marked.is_applied() {
                debug!("Target of {} already gone", link.key);
                return Ok(());
            }
        }
        self.drop_reference(target, target_id, Some(&marker)).await
    }

    /// Decrement `nlink` on the shared record (only while `marker` is still
    /// pending, when given) and destroy it when no links remain. Caller holds
    /// the record's write lock.
    async fn drop_reference(
        &self,
        target: &EntryKey,
        target_id: u64,
        marker: Option<&str>,
    ) -> Result<()> {
        let mut ops = vec![UpdateOp::add(attr::NLINK, -1), UpdateOp::set(attr::CTIME, now_secs())];
        let mut condition = vec![same_id(target_id)];
        if let Some(m) = marker {
            ops.push(UpdateOp::discard(attr::UNLINKING, m));
            condition.push(Condition::contains(attr::UNLINKING, m));
        }

        match self.records.save_if(target, &ops, Condition::And(condition)).await? {
            Conditional::Applied(row) => {
                let nlink = row.int(attr::NLINK).unwrap_or(0);
                debug!("File {} now has {} links", target_id, nlink);
                if nlink <= 0 {
                    self.destroy(target, target_id).await?;
                }
                Ok(())
            }
            Conditional::ConditionFailed => {
                debug!("Reference on file {} already released", target_id);
                Ok(())
            }
        }
    }

    async fn destroy(&self, target: &EntryKey, target_id: u64) -> Result<()> {
        let _ = self.records.delete_if(target, same_id(target_id)).await?;
        let blocks = self.blocks.delete_all(target_id).await?;
        info!("Destroyed file {} ({} blocks)", target_id, blocks);
        Ok(())
    }

    /// Recount links to every shared record and fix stored counts. Also
    /// reports indirections whose target is gone and block partitions no
    /// record owns.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let census = self.census(&mut report).await?;

        for (id, (key, stored)) in &census.shared {
            let actual = census.links.get(id).copied().unwrap_or(0);
            if actual == *stored {
                continue;
            }
            let guard = self.locks.acquire(*id, LockKind::Write).await?;
            let result = self.repair_locked(key, *id, &mut report).await;
            guard.release().await;
            result?;
        }

        for (target, link_paths) in &census.link_paths {
            if !census.shared.contains_key(target) {
                report.dangling.extend(link_paths.iter().cloned());
            }
        }

        for id in census.block_owners {
            if !census.ids.contains(&id) {
                report.orphan_blocks.push(id);
            }
        }

        info!(
            "Reconcile: {} rows, {} repaired, {} destroyed, {} dangling, {} orphan block sets",
            report.scanned,
            report.repaired.len(),
            report.destroyed.len(),
            report.dangling.len(),
            report.orphan_blocks.len()
        );
        Ok(report)
    }

    /// Re-count under the lock so concurrent link changes are settled
    async fn repair_locked(
        &self,
        key: &EntryKey,
        id: u64,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let mut scratch = ReconcileReport::default();
        let census = self.census(&mut scratch).await?;
        let Some((_, stored)) = census.shared.get(&id) else {
            return Ok(());
        };
        let actual = census.links.get(&id).copied().unwrap_or(0);
        if actual == *stored {
            return Ok(());
        }

        warn!(
            "File {} records {} links but {} exist",
            id, stored, actual
        );
        report.repaired.push((id, *stored, actual));
        if actual == 0 {
            self.destroy(key, id).await?;
            report.destroyed.push(id);
        } else {
            let _ = self
                .records
                .save_if(
                    key,
                    &[
                        UpdateOp::set(attr::NLINK, to_i64(actual)),
                        UpdateOp::set(attr::UNLINKING, Vec::<String>::new()),
                    ],
                    same_id(id),
                )
                .await?;
        }
        Ok(())
    }

    async fn census(&self, report: &mut ReconcileReport) -> Result<Census> {
        let kv = self.records.backend();
        let mut census = Census::default();
        let mut after = None;
        loop {
            let page = kv.scan(after.as_ref(), self.records.page_size()).await?;
            for item in &page.items {
                report.scanned += 1;
                if let Some(id) = parse_partition(&item.key.partition) {
                    if census.block_owners.last() != Some(&id) {
                        census.block_owners.push(id);
                    }
                    continue;
                }
                if item.key.partition.starts_with('@') && item.key.partition != INODE_PARTITION {
                    continue;
                }
                let Ok(entry) = DirEntry::from_item(item) else {
                    continue;
                };
                census.ids.insert(entry.id);
                match entry.kind {
                    EntryKind::Link { target_id, .. } => {
                        *census.links.entry(target_id).or_default() += 1;
                        census
                            .link_paths
                            .entry(target_id)
                            .or_default()
                            .push(entry.key.path());
                    }
                    _ if entry.key.parent == INODE_PARTITION => {
                        census
                            .shared
                            .insert(entry.id, (entry.key.clone(), entry.meta.nlink));
                    }
                    _ => {}
                }
            }
            match page.last_key {
                Some(k) => after = Some(k),
                None => break,
            }
        }
        Ok(census)
    }
}

/// One pass over the table
#[derive(Default)]
struct Census {
    /// Shared records: id -> (key, stored nlink)
    shared: HashMap<u64, (EntryKey, u64)>,
    /// Indirections per target id
    links: HashMap<u64, u64>,
    /// Link paths per target id, for dangling reports
    link_paths: HashMap<u64, Vec<String>>,
    /// Every entry id seen
    ids: HashSet<u64>,
    /// File ids owning block partitions, in scan order
    block_owners: Vec<u64>,
}
