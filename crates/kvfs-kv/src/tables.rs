//! Redb table definitions for the persistent backend.

use redb::TableDefinition;

/// Every row of the filesystem table.
///
/// Key: `"{partition}\x00{sort}"`, Value: bincode-encoded attribute map
pub const ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("items");

/// Separator between partition and sort key in [`ITEMS`] keys
pub const KEY_SEPARATOR: char = '\x00';
