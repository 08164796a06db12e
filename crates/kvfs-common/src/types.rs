//! Core type definitions for kvfs
//!
//! Directory entries are addressed by a two-part key: the parent directory
//! path selects the partition and the entry name selects the row within it.

use crate::error::{Error, Result};
use crate::MAX_NAME_LEN;
use std::fmt;

/// File type bits (the `S_IFMT` mask and its members)
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;

/// Permission and set-id bits
pub const PERM_MASK: u32 = 0o7777;

/// Name used for the root entry
pub const ROOT_NAME: &str = "/";

/// Key of a directory entry row: `(parent path, name)`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub parent: String,
    pub name: String,
}

impl EntryKey {
    pub fn new(parent: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            name: name.into(),
        }
    }

    /// The root directory key `("", "/")`
    #[must_use]
    pub fn root() -> Self {
        Self::new("", ROOT_NAME)
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_empty() && self.name == ROOT_NAME
    }

    /// Full path of the entry
    #[must_use]
    pub fn path(&self) -> String {
        if self.is_root() {
            ROOT_NAME.to_string()
        } else {
            join_path(&self.parent, &self.name)
        }
    }

    /// Key of the directory holding this entry
    #[must_use]
    pub fn parent_key(&self) -> Self {
        split_path(&self.parent)
    }
}

impl fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryKey({:?}, {:?})", self.parent, self.name)
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Split an absolute path into its `(dirname, basename)` key.
///
/// Repeated and trailing slashes are ignored. The root (and the empty
/// path) becomes `("", "/")`.
#[must_use]
pub fn split_path(path: &str) -> EntryKey {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return EntryKey::root();
    }
    match trimmed.rfind('/') {
        Some(idx) => {
            let dir = trimmed[..idx].trim_end_matches('/');
            let parent = if dir.is_empty() { ROOT_NAME } else { dir };
            EntryKey::new(parent, &trimmed[idx + 1..])
        }
        None => EntryKey::new(ROOT_NAME, trimmed),
    }
}

/// Join a directory path and a child name
#[must_use]
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Reject paths whose total length or any component exceeds [`MAX_NAME_LEN`].
pub fn check_path_len(path: &str) -> Result<()> {
    if path.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong {
            len: path.len(),
            max: MAX_NAME_LEN,
        });
    }
    if let Some(long) = path.split('/').find(|c| c.len() > MAX_NAME_LEN) {
        return Err(Error::NameTooLong {
            len: long.len(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

/// Entry type derived from the mode bits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

impl FileType {
    /// Classify a mode; anything that is neither a directory nor a symlink
    /// is treated as a regular file.
    #[must_use]
    pub const fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            _ => Self::RegularFile,
        }
    }
}

/// Attributes reported by `getattr`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAttr {
    /// Immutable file id (inode number)
    pub ino: u64,
    pub kind: FileType,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Size in `blksize` units, rounded up
    pub blocks: u64,
    pub blksize: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Filesystem statistics reported by `statfs`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatFs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    /// Estimated row count of the backing table
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub namemax: u64,
}

/// Current wall-clock time in whole seconds
#[must_use]
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/"), EntryKey::root());
        assert_eq!(split_path(""), EntryKey::root());
        assert_eq!(split_path("/a"), EntryKey::new("/", "a"));
        assert_eq!(split_path("/a/b"), EntryKey::new("/a", "b"));
        assert_eq!(split_path("/a/b/"), EntryKey::new("/a", "b"));
        assert_eq!(split_path("//a//b"), EntryKey::new("//a", "b"));
    }

    #[test]
    fn test_entry_key_path() {
        assert_eq!(EntryKey::root().path(), "/");
        assert_eq!(EntryKey::new("/", "a").path(), "/a");
        assert_eq!(EntryKey::new("/a", "b").path(), "/a/b");
        assert_eq!(EntryKey::new("/a", "b").parent_key(), EntryKey::new("/", "a"));
        assert_eq!(EntryKey::new("/", "a").parent_key(), EntryKey::root());
    }

    #[test]
    fn test_check_path_len() {
        assert!(check_path_len("/short").is_ok());
        let long = format!("/{}", "x".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(
            check_path_len(&long),
            Err(Error::NameTooLong { .. })
        ));
        let exact = "x".repeat(MAX_NAME_LEN);
        assert!(check_path_len(&exact).is_ok());
    }

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(FileType::from_mode(S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(FileType::from_mode(S_IFREG | 0o644), FileType::RegularFile);
        assert_eq!(FileType::from_mode(0o644), FileType::RegularFile);
    }
}
