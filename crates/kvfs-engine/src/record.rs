//! Metadata record store
//!
//! One row per directory entry, keyed by `(parent path, name)`. The row
//! carries the entry's id and POSIX attributes plus exactly one of:
//! a child-name list (directories), a target path (symlinks) or the key of
//! the shared file record (hard-link indirections).
//!
//! Files that have been hard-linked live in the `@inode` partition, keyed
//! by their id, where no path can reach them directly.

use crate::{hex_key, to_i64, to_u64};
use kvfs_common::{
    BLOCK_SIZE, EntryKey, Error, FileAttr, FileType, PERM_MASK, Result, S_IFMT, now_secs,
};
use kvfs_kv::{Condition, Conditional, Item, ItemKey, KvBackend, UpdateOp};
use std::sync::Arc;
use tracing::{debug, warn};

/// Partition holding detached file records
pub const INODE_PARTITION: &str = "@inode";

/// Row attribute names
pub mod attr {
    pub const ID: &str = "id";
    pub const MODE: &str = "mode";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const SIZE: &str = "size";
    pub const NLINK: &str = "nlink";
    pub const ATIME: &str = "atime";
    pub const MTIME: &str = "mtime";
    pub const CTIME: &str = "ctime";
    pub const BLKSIZE: &str = "blksize";
    pub const CHILDREN: &str = "children";
    pub const SYMLINK: &str = "symlink";
    pub const LINK_PARENT: &str = "link_parent";
    pub const LINK_NAME: &str = "link_name";
    pub const LINK_ID: &str = "link_id";
    /// Link rows whose removal is in progress against this file record
    pub const UNLINKING: &str = "unlinking";
}

/// POSIX attributes stored on every row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub blksize: u64,
}

impl Metadata {
    /// Fresh attributes stamped with the current time
    #[must_use]
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        let now = now_secs();
        Self {
            mode,
            uid,
            gid,
            size: 0,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
            blksize: BLOCK_SIZE,
        }
    }

    #[must_use]
    pub const fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }
}

/// What a directory entry row holds
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory { children: Vec<String> },
    Symlink { target: String },
    /// Hard-link indirection; attributes live on the target record
    Link { target: EntryKey, target_id: u64 },
}

/// Decoded directory entry row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub key: EntryKey,
    pub id: u64,
    pub meta: Metadata,
    pub kind: EntryKind,
}

impl DirEntry {
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory { .. })
    }

    #[must_use]
    pub const fn is_link(&self) -> bool {
        matches!(self.kind, EntryKind::Link { .. })
    }

    /// Same row contents under another key
    #[must_use]
    pub fn relocated(&self, key: EntryKey) -> Self {
        Self {
            key,
            ..self.clone()
        }
    }

    /// Attributes as reported by `getattr`
    #[must_use]
    pub fn attr(&self) -> FileAttr {
        let kind = self.meta.file_type();
        let blocks = if kind == FileType::RegularFile {
            self.meta.size.div_ceil(self.meta.blksize.max(1))
        } else {
            0
        };
        FileAttr {
            ino: self.id,
            kind,
            mode: self.meta.mode,
            nlink: self.meta.nlink,
            uid: self.meta.uid,
            gid: self.meta.gid,
            size: self.meta.size,
            blocks,
            blksize: self.meta.blksize,
            atime: self.meta.atime,
            mtime: self.meta.mtime,
            ctime: self.meta.ctime,
        }
    }

    /// Encode into a backend row
    #[must_use]
    pub fn to_item(&self) -> Item {
        let mut item = Item::new(item_key(&self.key))
            .with(attr::ID, to_i64(self.id))
            .with(attr::MODE, self.meta.mode)
            .with(attr::UID, self.meta.uid)
            .with(attr::GID, self.meta.gid)
            .with(attr::SIZE, to_i64(self.meta.size))
            .with(attr::NLINK, to_i64(self.meta.nlink))
            .with(attr::ATIME, self.meta.atime)
            .with(attr::MTIME, self.meta.mtime)
            .with(attr::CTIME, self.meta.ctime)
            .with(attr::BLKSIZE, to_i64(self.meta.blksize));
        match &self.kind {
            EntryKind::File => {}
            EntryKind::Directory { children } => {
                item = item.with(attr::CHILDREN, children.clone());
            }
            EntryKind::Symlink { target } => {
                item = item.with(attr::SYMLINK, target.as_str());
            }
            EntryKind::Link { target, target_id } => {
                item = item
                    .with(attr::LINK_PARENT, target.parent.as_str())
                    .with(attr::LINK_NAME, target.name.as_str())
                    .with(attr::LINK_ID, to_i64(*target_id));
            }
        }
        item
    }

    /// Decode a backend row
    pub fn from_item(item: &Item) -> Result<Self> {
        let key = EntryKey::new(item.key.partition.as_str(), item.key.sort.as_str());
        let malformed = |what: &str| {
            warn!("Malformed entry row {:?}: {}", key, what);
            Error::BackendRejected(format!("malformed entry {key}: {what}"))
        };

        let id = item.int(attr::ID).ok_or_else(|| malformed("missing id"))?;
        let mode = item.int(attr::MODE).ok_or_else(|| malformed("missing mode"))?;
        let mode = u32::try_from(mode).map_err(|_| malformed("mode out of range"))?;
        let int = |name: &str| item.int(name).unwrap_or(0);
        let small = |name: &str| u32::try_from(int(name)).unwrap_or(0);

        let meta = Metadata {
            mode,
            uid: small(attr::UID),
            gid: small(attr::GID),
            size: to_u64(int(attr::SIZE)),
            nlink: to_u64(int(attr::NLINK)),
            atime: int(attr::ATIME),
            mtime: int(attr::MTIME),
            ctime: int(attr::CTIME),
            blksize: item.int(attr::BLKSIZE).map_or(BLOCK_SIZE, to_u64),
        };

        let kind = if let Some(target_id) = item.int(attr::LINK_ID) {
            let parent = item
                .str(attr::LINK_PARENT)
                .ok_or_else(|| malformed("link without target"))?;
            let name = item
                .str(attr::LINK_NAME)
                .ok_or_else(|| malformed("link without target"))?;
            EntryKind::Link {
                target: EntryKey::new(parent, name),
                target_id: to_u64(target_id),
            }
        } else {
            match meta.file_type() {
                FileType::Directory => EntryKind::Directory {
                    children: item.list(attr::CHILDREN).unwrap_or_default().to_vec(),
                },
                FileType::Symlink => EntryKind::Symlink {
                    target: item.str(attr::SYMLINK).unwrap_or_default().to_string(),
                },
                FileType::RegularFile => EntryKind::File,
            }
        };

        Ok(Self {
            key,
            id: to_u64(id),
            meta,
            kind,
        })
    }
}

/// Backend key of a directory entry
#[must_use]
pub fn item_key(key: &EntryKey) -> ItemKey {
    ItemKey::new(key.parent.as_str(), key.name.as_str())
}

/// Key a file record takes once it is shared by hard links
#[must_use]
pub fn inode_key(id: u64) -> EntryKey {
    EntryKey::new(INODE_PARTITION, hex_key(id))
}

/// Condition: the row exists and still carries `id`
#[must_use]
pub fn same_id(id: u64) -> Condition {
    Condition::attr_equals(attr::ID, to_i64(id))
}

/// Keep only the file-type bits of `current` and the permission bits of `mode`
#[must_use]
pub const fn merge_mode(current: u32, mode: u32) -> u32 {
    (current & S_IFMT) | (mode & PERM_MASK)
}

/// Row-level access to directory entries
#[derive(Clone)]
pub struct RecordStore {
    kv: Arc<dyn KvBackend>,
    page_size: usize,
}

impl RecordStore {
    pub fn new(kv: Arc<dyn KvBackend>, page_size: usize) -> Self {
        Self {
            kv,
            page_size: page_size.max(1),
        }
    }

    /// Rows fetched per range query or scan page
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.kv
    }

    /// Full record, `None` when absent
    pub async fn get(&self, key: &EntryKey) -> Result<Option<DirEntry>> {
        match self.kv.get(&item_key(key), None).await? {
            Some(item) => DirEntry::from_item(&item).map(Some),
            None => Ok(None),
        }
    }

    /// Only the named attributes of a record
    pub async fn get_attrs(&self, key: &EntryKey, names: &[&str]) -> Result<Option<Item>> {
        Ok(self.kv.get(&item_key(key), Some(names)).await?)
    }

    /// Insert a new record; fails with `AlreadyExists` if the key is taken
    pub async fn create(&self, entry: &DirEntry) -> Result<()> {
        match self.kv.put(entry.to_item(), Condition::NotExists).await? {
            Conditional::Applied(()) => {
                debug!("Created entry {} (id {})", entry.key, entry.id);
                Ok(())
            }
            Conditional::ConditionFailed => Err(Error::AlreadyExists(entry.key.path())),
        }
    }

    /// Write a whole record if `condition` holds
    pub async fn put(&self, entry: &DirEntry, condition: Condition) -> Result<Conditional<()>> {
        Ok(self.kv.put(entry.to_item(), condition).await?)
    }

    /// Update attributes of an existing record
    pub async fn save(&self, key: &EntryKey, ops: &[UpdateOp]) -> Result<Item> {
        match self.save_if(key, ops, Condition::Exists).await? {
            Conditional::Applied(item) => Ok(item),
            Conditional::ConditionFailed => Err(Error::not_found(key.path())),
        }
    }

    pub async fn save_if(
        &self,
        key: &EntryKey,
        ops: &[UpdateOp],
        condition: Condition,
    ) -> Result<Conditional<Item>> {
        Ok(self.kv.update(&item_key(key), ops, condition).await?)
    }

    /// Unconditional delete; deleting an absent record is not an error
    pub async fn delete(&self, key: &EntryKey) -> Result<()> {
        let _ = self.kv.delete(&item_key(key), Condition::Always).await?;
        Ok(())
    }

    pub async fn delete_if(
        &self,
        key: &EntryKey,
        condition: Condition,
    ) -> Result<Conditional<Option<Item>>> {
        Ok(self.kv.delete(&item_key(key), condition).await?)
    }

    /// Record `name` in the child list of directory `dir`
    pub async fn add_child(&self, dir: &EntryKey, name: &str) -> Result<()> {
        let applied = self
            .save_if(
                dir,
                &[UpdateOp::append(attr::CHILDREN, name)],
                Condition::AttrExists(attr::CHILDREN.to_string()),
            )
            .await?;
        if applied.is_applied() {
            return Ok(());
        }
        match self.get_attrs(dir, &[attr::ID]).await? {
            Some(_) => Err(Error::NotADirectory(dir.path())),
            None => Err(Error::not_found(dir.path())),
        }
    }

    /// Drop `name` from the child list of `dir`. A vanished directory has
    /// nothing left to update.
    pub async fn remove_child(&self, dir: &EntryKey, name: &str) -> Result<()> {
        let applied = self
            .save_if(
                dir,
                &[UpdateOp::discard(attr::CHILDREN, name)],
                Condition::AttrExists(attr::CHILDREN.to_string()),
            )
            .await?;
        if !applied.is_applied() {
            debug!("Parent {} gone while removing child {:?}", dir, name);
        }
        Ok(())
    }
}
