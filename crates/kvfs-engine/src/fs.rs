//! Filesystem operation surface
//!
//! [`Filesystem`] maps path-based POSIX operations onto the record store,
//! block store and link layer. Every public method corresponds to one OS
//! call; errors carry their errno through [`Error::errno`].

use crate::block::BlockStore;
use crate::counter::IdAllocator;
use crate::handles::HandleAllocator;
use crate::link::{LinkLayer, ReconcileReport};
use crate::lock::{FileLock, LockKind};
use crate::record::{DirEntry, EntryKind, Metadata, RecordStore, attr, merge_mode, same_id};
use crate::to_i64;
use bytes::Bytes;
use kvfs_common::config::FsConfig;
use kvfs_common::{
    BLOCK_SIZE, Config, EntryKey, Error, FileAttr, MAX_NAME_LEN, PERM_MASK, Result, S_IFDIR,
    S_IFLNK, S_IFREG, StatFs, check_path_len, now_secs, split_path,
};
use kvfs_kv::{Condition, KvBackend, UpdateOp, open_backend};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts for updates that race with unlocked size changes
const CAS_ATTEMPTS: usize = 16;

/// Reported for capacity figures the backend does not bound
const UNBOUNDED: u64 = i64::MAX.unsigned_abs();

pub struct Filesystem {
    kv: Arc<dyn KvBackend>,
    records: RecordStore,
    blocks: BlockStore,
    links: LinkLayer,
    locks: FileLock,
    ids: IdAllocator,
    handles: HandleAllocator,
    config: FsConfig,
}

impl Filesystem {
    /// Open the backend named in `config` and mount on it
    pub async fn mount(config: &Config) -> Result<Self> {
        let kv = open_backend(&config.backend)?;
        Self::new(kv, config).await
    }

    /// Mount on an existing backend, creating the root directory if needed
    pub async fn new(kv: Arc<dyn KvBackend>, config: &Config) -> Result<Self> {
        let page_size = config.backend.page_size;
        let records = RecordStore::new(Arc::clone(&kv), page_size);
        let blocks = BlockStore::new(Arc::clone(&kv), page_size);
        let locks = FileLock::new(Arc::clone(&kv), config.lock.clone());
        let ids = IdAllocator::new(Arc::clone(&kv));
        let links = LinkLayer::new(records.clone(), blocks.clone(), locks.clone(), ids.clone());

        let fs = Self {
            kv,
            records,
            blocks,
            links,
            locks,
            ids,
            handles: HandleAllocator::new(),
            config: config.fs.clone(),
        };
        fs.ensure_root().await?;
        info!("Filesystem ready on {} backend", fs.kv.name());
        Ok(fs)
    }

    async fn ensure_root(&self) -> Result<()> {
        let key = EntryKey::root();
        if self.records.get_attrs(&key, &[attr::ID]).await?.is_some() {
            return Ok(());
        }
        let mut meta = Metadata::new(S_IFDIR | 0o755, self.config.default_uid, self.config.default_gid);
        meta.nlink = 2;
        let root = DirEntry {
            key,
            id: self.ids.next().await?,
            meta,
            kind: EntryKind::Directory { children: Vec::new() },
        };
        match self.records.create(&root).await {
            Ok(()) => {
                info!("Created root directory (id {})", root.id);
                Ok(())
            }
            // Another process won the race
            Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ---- lookup helpers ----

    fn key_of(path: &str) -> Result<EntryKey> {
        check_path_len(path)?;
        Ok(split_path(path))
    }

    async fn lookup_key(&self, key: &EntryKey) -> Result<DirEntry> {
        self.records
            .get(key)
            .await?
            .ok_or_else(|| Error::not_found(key.path()))
    }

    /// The entry at `path` itself (an indirection stays an indirection)
    pub async fn lookup(&self, path: &str) -> Result<DirEntry> {
        self.lookup_key(&Self::key_of(path)?).await
    }

    /// The record holding content and attributes for `key`
    async fn resolve_key(&self, key: &EntryKey) -> Result<DirEntry> {
        let entry = self.lookup_key(key).await?;
        self.links.content_target(entry).await
    }

    /// Like [`Self::resolve_key`] but only for regular files
    async fn resolve_file(&self, key: &EntryKey) -> Result<DirEntry> {
        let file = self.resolve_key(key).await?;
        match file.kind {
            EntryKind::File => Ok(file),
            EntryKind::Directory { .. } => Err(Error::IsADirectory(key.path())),
            _ => Err(Error::invalid_argument(format!("{key} is not a regular file"))),
        }
    }

    async fn parent_dir(&self, key: &EntryKey) -> Result<DirEntry> {
        let parent = self.lookup_key(&key.parent_key()).await?;
        if parent.is_dir() {
            Ok(parent)
        } else {
            Err(Error::NotADirectory(parent.key.path()))
        }
    }

    /// Build a new entry under an existing directory
    async fn new_entry(&self, key: EntryKey, mode: u32, kind: EntryKind) -> Result<DirEntry> {
        if key.is_root() {
            return Err(Error::AlreadyExists(key.path()));
        }
        self.parent_dir(&key).await?;
        let meta = Metadata::new(mode, self.config.default_uid, self.config.default_gid);
        Ok(DirEntry {
            key,
            id: self.ids.next().await?,
            meta,
            kind,
        })
    }

    /// Create the row and register it with its parent; the row is removed
    /// again if the parent vanished meanwhile.
    async fn insert_entry(&self, entry: &DirEntry) -> Result<()> {
        self.records.create(entry).await?;
        if let Err(e) = self
            .records
            .add_child(&entry.key.parent_key(), &entry.key.name)
            .await
        {
            if let Err(undo) = self.records.delete_if(&entry.key, same_id(entry.id)).await {
                warn!("Failed to roll back {}: {}", entry.key, undo);
            }
            return Err(e);
        }
        Ok(())
    }

    // ---- namespace operations ----

    /// Create a regular file and return an open handle
    pub async fn create(&self, path: &str, mode: u32) -> Result<u64> {
        debug!("create({}, {:o})", path, mode);
        let key = Self::key_of(path)?;
        let entry = self
            .new_entry(key, S_IFREG | (mode & PERM_MASK), EntryKind::File)
            .await?;
        self.insert_entry(&entry).await?;
        Ok(self.handles.allocate())
    }

    pub async fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        debug!("mkdir({}, {:o})", path, mode);
        let key = Self::key_of(path)?;
        let mut entry = self
            .new_entry(
                key,
                S_IFDIR | (mode & PERM_MASK),
                EntryKind::Directory { children: Vec::new() },
            )
            .await?;
        entry.meta.nlink = 2;
        self.insert_entry(&entry).await
    }

    pub async fn rmdir(&self, path: &str) -> Result<()> {
        debug!("rmdir({})", path);
        let key = Self::key_of(path)?;
        if key.is_root() {
            return Err(Error::invalid_argument("cannot remove the root directory"));
        }
        let entry = self.lookup_key(&key).await?;
        if !entry.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }

        let empty = Condition::And(vec![
            same_id(entry.id),
            Condition::attr_equals(attr::CHILDREN, Vec::<String>::new()),
        ]);
        if self.records.delete_if(&key, empty).await?.is_applied() {
            return self.records.remove_child(&key.parent_key(), &key.name).await;
        }
        match self.records.get_attrs(&key, &[attr::ID]).await? {
            Some(_) => Err(Error::NotEmpty(path.to_string())),
            None => Err(Error::not_found(path)),
        }
    }

    pub async fn symlink(&self, target: &str, link_path: &str) -> Result<()> {
        debug!("symlink({}, {})", target, link_path);
        check_path_len(target)?;
        let key = Self::key_of(link_path)?;
        let mut entry = self
            .new_entry(
                key,
                S_IFLNK | 0o777,
                EntryKind::Symlink {
                    target: target.to_string(),
                },
            )
            .await?;
        entry.meta.size = target.len() as u64;
        self.insert_entry(&entry).await
    }

    pub async fn readlink(&self, path: &str) -> Result<String> {
        debug!("readlink({})", path);
        match self.lookup(path).await?.kind {
            EntryKind::Symlink { target } => Ok(target),
            _ => Err(Error::invalid_argument(format!("{path} is not a symlink"))),
        }
    }

    /// Hard link `new_path` to the file at `target`
    pub async fn link(&self, target: &str, new_path: &str) -> Result<()> {
        debug!("link({}, {})", target, new_path);
        if !self.config.enable_hard_links {
            return Err(Error::not_supported("link"));
        }
        let new_key = Self::key_of(new_path)?;
        if new_key.is_root() || self.records.get_attrs(&new_key, &[attr::ID]).await?.is_some() {
            return Err(Error::AlreadyExists(new_path.to_string()));
        }
        self.parent_dir(&new_key).await?;
        let existing = self.lookup(target).await?;

        let link = self.links.link(&existing, new_key).await?;
        if let Err(e) = self
            .records
            .add_child(&link.key.parent_key(), &link.key.name)
            .await
        {
            if let Err(undo) = self.links.delete_link(&link).await {
                warn!("Failed to roll back link {}: {}", link.key, undo);
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink({})", path);
        let key = Self::key_of(path)?;
        if key.is_root() {
            return Err(Error::IsADirectory(path.to_string()));
        }
        let entry = self.lookup_key(&key).await?;
        match &entry.kind {
            EntryKind::Directory { .. } => return Err(Error::IsADirectory(path.to_string())),
            EntryKind::Link { .. } => self.links.delete_link(&entry).await?,
            EntryKind::Symlink { .. } => {
                let _ = self.records.delete_if(&key, same_id(entry.id)).await?;
            }
            EntryKind::File => self.unlink_file(&entry).await?,
        }
        self.records.remove_child(&key.parent_key(), &key.name).await
    }

    async fn unlink_file(&self, entry: &DirEntry) -> Result<()> {
        let guard = self.locks.acquire(entry.id, LockKind::Write).await?;
        let result = self.unlink_file_locked(entry).await;
        guard.release().await;
        match result? {
            // Linked while we waited: the path is an indirection now
            Some(link) => self.links.delete_link(&link).await,
            None => Ok(()),
        }
    }

    async fn unlink_file_locked(&self, entry: &DirEntry) -> Result<Option<DirEntry>> {
        match self.records.get(&entry.key).await? {
            Some(current) if current.id == entry.id => {
                let _ = self.records.delete_if(&entry.key, same_id(entry.id)).await?;
                self.blocks.delete_all(entry.id).await?;
                Ok(None)
            }
            Some(current)
                if matches!(current.kind, EntryKind::Link { target_id, .. } if target_id == entry.id) =>
            {
                Ok(Some(current))
            }
            _ => Err(Error::not_found(entry.key.path())),
        }
    }

    /// Move a non-directory entry. Renaming onto an existing directory moves
    /// the entry into it.
    pub async fn rename(&self, old: &str, new: &str) -> Result<()> {
        debug!("rename({}, {})", old, new);
        let old_key = Self::key_of(old)?;
        let new_key = Self::key_of(new)?;
        if old_key.is_root() || new_key.is_root() {
            return Err(Error::invalid_argument("cannot rename the root directory"));
        }
        if old_key == new_key {
            return Ok(());
        }

        let entry = self.lookup_key(&old_key).await?;
        if entry.is_dir() {
            return Err(Error::not_supported("rename of a directory"));
        }

        let dest = match self.records.get(&new_key).await? {
            None => new_key,
            Some(existing) => match existing.kind {
                EntryKind::Directory { .. } => EntryKey::new(new_key.path(), old_key.name.as_str()),
                EntryKind::Symlink { .. } => {
                    return Err(Error::invalid_argument(format!("{new} is a symlink")));
                }
                _ => return Err(Error::AlreadyExists(new.to_string())),
            },
        };
        check_path_len(&dest.path())?;
        self.parent_dir(&dest).await?;

        let lock_id = match &entry.kind {
            EntryKind::Link { target_id, .. } => *target_id,
            _ => entry.id,
        };
        let guard = self.locks.acquire(lock_id, LockKind::Exclusive).await?;
        let result = self.rename_locked(&entry, dest).await;
        guard.release().await;
        result
    }

    async fn rename_locked(&self, entry: &DirEntry, dest: EntryKey) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let current = match self.records.get(&entry.key).await? {
                Some(current) if current.id == entry.id => current,
                // Detached by a first link before we got the lock
                Some(current)
                    if matches!(current.kind, EntryKind::Link { target_id, .. } if target_id == entry.id) =>
                {
                    current
                }
                _ => return Err(Error::not_found(entry.key.path())),
            };
            let mut moved = current.relocated(dest.clone());
            moved.meta.ctime = now_secs();
            self.insert_entry(&moved).await?;

            // A concurrent write may have grown the old row after we read it
            let unchanged = Condition::And(vec![
                same_id(current.id),
                Condition::attr_equals(attr::SIZE, to_i64(current.meta.size)),
            ]);
            if self.records.delete_if(&current.key, unchanged).await?.is_applied() {
                self.records
                    .remove_child(&current.key.parent_key(), &current.key.name)
                    .await?;
                info!("Renamed {} to {}", current.key, moved.key);
                return Ok(());
            }
            let _ = self.records.delete_if(&moved.key, same_id(moved.id)).await?;
            self.records
                .remove_child(&moved.key.parent_key(), &moved.key.name)
                .await?;
        }
        Err(Error::internal(format!(
            "{} kept changing while being renamed",
            entry.key
        )))
    }

    // ---- content ----

    pub async fn read(&self, path: &str, offset: u64, size: u64) -> Result<Bytes> {
        debug!("read({}, {}, {})", path, offset, size);
        let file = self.resolve_file(&Self::key_of(path)?).await?;
        self.blocks.read(file.id, offset, size, file.meta.size).await
    }

    /// Write `data` at `offset`, growing the file as needed. Returns the
    /// number of bytes written.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize> {
        debug!("write({}, {}, {} bytes)", path, offset, data.len());
        let key = Self::key_of(path)?;
        let file = self.resolve_file(&key).await?;
        if data.is_empty() {
            return Ok(0);
        }
        self.blocks
            .write(file.id, offset, data, file.meta.size)
            .await?;
        self.extend_size(&key, offset.saturating_add(data.len() as u64))
            .await?;
        Ok(data.len())
    }

    /// Raise the recorded size to at least `end` and stamp mtime. The size
    /// only ever grows here, via compare-and-set on the stored value.
    async fn extend_size(&self, key: &EntryKey, end: u64) -> Result<()> {
        for _ in 0..CAS_ATTEMPTS {
            let file = self.resolve_file(key).await?;
            let now = now_secs();
            let mut ops = vec![UpdateOp::set(attr::MTIME, now), UpdateOp::set(attr::CTIME, now)];
            let mut condition = vec![same_id(file.id)];
            if end > file.meta.size {
                ops.push(UpdateOp::set(attr::SIZE, to_i64(end)));
                condition.push(Condition::attr_equals(attr::SIZE, to_i64(file.meta.size)));
            }
            let applied = self
                .records
                .save_if(&file.key, &ops, Condition::And(condition))
                .await?;
            if applied.is_applied() {
                return Ok(());
            }
        }
        Err(Error::internal(format!("size of {key} kept changing")))
    }

    /// Set the file size; shrinking drops content, growing leaves a hole
    pub async fn truncate(&self, path: &str, length: u64) -> Result<()> {
        debug!("truncate({}, {})", path, length);
        let file = self.resolve_file(&Self::key_of(path)?).await?;
        // Growing clears from the old end so stale bytes past it read as zeros
        self.blocks
            .truncate(file.id, length.min(file.meta.size))
            .await?;
        let now = now_secs();
        let ops = [
            UpdateOp::set(attr::SIZE, to_i64(length)),
            UpdateOp::set(attr::MTIME, now),
            UpdateOp::set(attr::CTIME, now),
        ];
        if self
            .records
            .save_if(&file.key, &ops, same_id(file.id))
            .await?
            .is_applied()
        {
            Ok(())
        } else {
            Err(Error::not_found(path))
        }
    }

    // ---- attributes ----

    pub async fn getattr(&self, path: &str) -> Result<FileAttr> {
        debug!("getattr({})", path);
        Ok(self.resolve_key(&Self::key_of(path)?).await?.attr())
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        debug!("chmod({}, {:o})", path, mode);
        let file = self.resolve_key(&Self::key_of(path)?).await?;
        let ops = [
            UpdateOp::set(attr::MODE, merge_mode(file.meta.mode, mode)),
            UpdateOp::set(attr::CTIME, now_secs()),
        ];
        self.records.save(&file.key, &ops).await.map(|_| ())
    }

    /// Change ownership; `None` leaves that id unchanged
    pub async fn chown(&self, path: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        debug!("chown({}, {:?}, {:?})", path, uid, gid);
        let file = self.resolve_key(&Self::key_of(path)?).await?;
        let mut ops = vec![UpdateOp::set(attr::CTIME, now_secs())];
        if let Some(uid) = uid {
            ops.push(UpdateOp::set(attr::UID, uid));
        }
        if let Some(gid) = gid {
            ops.push(UpdateOp::set(attr::GID, gid));
        }
        self.records.save(&file.key, &ops).await.map(|_| ())
    }

    /// Set access and modification times; `None` means now
    pub async fn utimens(&self, path: &str, times: Option<(i64, i64)>) -> Result<()> {
        debug!("utimens({}, {:?})", path, times);
        let file = self.resolve_key(&Self::key_of(path)?).await?;
        let now = now_secs();
        let (atime, mtime) = times.unwrap_or((now, now));
        let ops = [
            UpdateOp::set(attr::ATIME, atime),
            UpdateOp::set(attr::MTIME, mtime),
            UpdateOp::set(attr::CTIME, now),
        ];
        self.records.save(&file.key, &ops).await.map(|_| ())
    }

    // ---- directories and handles ----

    /// Entry names of a directory, starting with `.` and `..`
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        debug!("readdir({})", path);
        match self.lookup(path).await?.kind {
            EntryKind::Directory { children } => {
                let mut names = Vec::with_capacity(children.len() + 2);
                names.push(".".to_string());
                names.push("..".to_string());
                names.extend(children);
                Ok(names)
            }
            _ => Err(Error::NotADirectory(path.to_string())),
        }
    }

    pub async fn open(&self, path: &str) -> Result<u64> {
        debug!("open({})", path);
        self.resolve_key(&Self::key_of(path)?).await?;
        Ok(self.handles.allocate())
    }

    pub async fn opendir(&self, path: &str) -> Result<u64> {
        debug!("opendir({})", path);
        if self.lookup(path).await?.is_dir() {
            Ok(self.handles.allocate())
        } else {
            Err(Error::NotADirectory(path.to_string()))
        }
    }

    pub async fn statfs(&self) -> Result<StatFs> {
        debug!("statfs()");
        let files = self.kv.item_count().await?;
        Ok(StatFs {
            bsize: BLOCK_SIZE,
            frsize: BLOCK_SIZE,
            blocks: UNBOUNDED - 1,
            bfree: UNBOUNDED - 2,
            bavail: UNBOUNDED - 2,
            files,
            ffree: UNBOUNDED - 1,
            favail: UNBOUNDED - 1,
            namemax: MAX_NAME_LEN as u64,
        })
    }

    /// Block mapping is meaningless for key-value storage
    pub fn bmap(&self, path: &str, _block: u64) -> Result<u64> {
        debug!("bmap({})", path);
        Err(Error::not_supported("bmap"))
    }

    /// POSIX byte-range locks are accepted and ignored
    pub fn posix_lock(&self, path: &str) -> Result<()> {
        debug!("lock({})", path);
        Ok(())
    }

    /// Recount hard links and repair stored counts
    pub async fn fsck(&self) -> Result<ReconcileReport> {
        info!("Starting link reconciliation");
        self.links.reconcile().await
    }
}
