//! Block storage for file content
//!
//! File content is split into fixed-size blocks, one row per block.
//!
//! ```text
//! File (id 0x2a, 80 KiB)
//! ├── Block 0: bytes 0 - 32K      → @blk:000000000000002a / 0000000000000000
//! ├── Block 1: bytes 32K - 64K    → @blk:000000000000002a / 0000000000000001
//! └── Block 2: bytes 64K - 80K    → @blk:000000000000002a / 0000000000000002  (short)
//! ```
//!
//! Blocks are keyed by the file id rather than its path, so renames never
//! touch content and every hard link to a file reads the same blocks.
//! Blocks are created lazily; a missing block inside the file size reads
//! as zeros.

use crate::hex_key;
use bytes::{Bytes, BytesMut};
use kvfs_common::{BLOCK_SIZE, Result};
use kvfs_kv::{Condition, Item, ItemKey, KvBackend, SortCondition};
use std::sync::Arc;
use tracing::{debug, trace};

/// Prefix of the per-file block partitions
pub const BLOCK_PARTITION_PREFIX: &str = "@blk:";
const DATA_ATTR: &str = "data";

/// A range of bytes within one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRange {
    pub index: u64,
    pub offset_in_block: u64,
    pub length: u64,
}

impl BlockRange {
    /// True when the range replaces the whole block
    #[must_use]
    pub const fn is_full(&self, block_size: u64) -> bool {
        self.offset_in_block == 0 && self.length == block_size
    }
}

/// Maps file byte ranges to block rows
#[derive(Debug, Clone)]
pub struct BlockMapper {
    block_size: u64,
}

impl Default for BlockMapper {
    fn default() -> Self {
        Self::new(BLOCK_SIZE)
    }
}

impl BlockMapper {
    #[must_use]
    pub fn new(block_size: u64) -> Self {
        assert!(block_size > 0, "Block size must be positive");
        Self { block_size }
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Block ranges covering `[start, start + length)`
    #[must_use]
    pub fn byte_range_to_blocks(&self, start: u64, length: u64) -> Vec<BlockRange> {
        if length == 0 {
            return Vec::new();
        }

        let end = start.saturating_add(length);
        let first = start / self.block_size;
        let last = (end - 1) / self.block_size;

        (first..=last)
            .map(|index| {
                let block_start = index * self.block_size;
                let block_end = block_start + self.block_size;
                let range_start = start.max(block_start);
                let range_end = end.min(block_end);
                BlockRange {
                    index,
                    offset_in_block: range_start - block_start,
                    length: range_end - range_start,
                }
            })
            .collect()
    }

    /// Number of blocks a file of `size` bytes spans
    #[must_use]
    pub const fn blocks_for_size(&self, size: u64) -> u64 {
        size.div_ceil(self.block_size)
    }

    #[must_use]
    pub fn partition(file_id: u64) -> String {
        format!("{BLOCK_PARTITION_PREFIX}{}", hex_key(file_id))
    }

    #[must_use]
    pub fn block_key(file_id: u64, index: u64) -> ItemKey {
        ItemKey::new(Self::partition(file_id), hex_key(index))
    }
}

/// Reads and writes file content as block rows
#[derive(Clone)]
pub struct BlockStore {
    kv: Arc<dyn KvBackend>,
    mapper: BlockMapper,
    page_size: usize,
}

impl BlockStore {
    pub fn new(kv: Arc<dyn KvBackend>, page_size: usize) -> Self {
        Self {
            kv,
            mapper: BlockMapper::default(),
            page_size: page_size.max(1),
        }
    }

    async fn load(&self, file_id: u64, index: u64) -> Result<Option<Vec<u8>>> {
        let key = BlockMapper::block_key(file_id, index);
        let item = self.kv.get(&key, Some(&[DATA_ATTR])).await?;
        Ok(item.and_then(|i| i.bytes(DATA_ATTR).map(<[u8]>::to_vec)))
    }

    async fn store(&self, file_id: u64, index: u64, data: Vec<u8>) -> Result<()> {
        let item = Item::new(BlockMapper::block_key(file_id, index)).with(DATA_ATTR, data);
        let _ = self.kv.put(item, Condition::Always).await?;
        Ok(())
    }

    /// Write `data` at `offset`. `file_size` is the size before the write.
    ///
    /// Bytes a block holds past `file_size` are stale (left by a write whose
    /// size update never landed) and are dropped before the block is
    /// rewritten, so a gap opened by this write reads as zeros. A partial
    /// tail block left behind by the gap is zero-filled so only the final
    /// block of a file is ever short.
    pub async fn write(&self, file_id: u64, offset: u64, data: &[u8], file_size: u64) -> Result<()> {
        let ranges = self.mapper.byte_range_to_blocks(offset, data.len() as u64);
        let Some(first) = ranges.first() else {
            return Ok(());
        };

        let bs = self.mapper.block_size();
        if file_size % bs != 0 {
            let tail = file_size / bs;
            if tail < first.index
                && let Some(mut block) = self.load(file_id, tail).await?
            {
                block.truncate(usize::try_from(file_size % bs).unwrap_or(usize::MAX));
                block.resize(usize::try_from(bs).unwrap_or(usize::MAX), 0);
                self.store(file_id, tail, block).await?;
            }
        }

        let mut consumed = 0usize;
        for range in &ranges {
            let len = usize::try_from(range.length).unwrap_or(usize::MAX);
            let chunk = &data[consumed..consumed + len];
            consumed += len;

            let block = if range.is_full(bs) {
                chunk.to_vec()
            } else {
                // Read-modify-write of a partially covered block
                let mut block = self.load(file_id, range.index).await?.unwrap_or_default();
                let valid = file_size.saturating_sub(range.index * bs);
                if (block.len() as u64) > valid {
                    block.truncate(usize::try_from(valid).unwrap_or(usize::MAX));
                }
                let start = usize::try_from(range.offset_in_block).unwrap_or(usize::MAX);
                let end = start + len;
                if block.len() < end {
                    block.resize(end, 0);
                }
                block[start..end].copy_from_slice(chunk);
                block
            };
            trace!(
                "file {} block {}: {} bytes at {}",
                file_id, range.index, len, range.offset_in_block
            );
            self.store(file_id, range.index, block).await?;
        }
        Ok(())
    }

    /// Read up to `size` bytes at `offset`, clipped to `file_size`
    pub async fn read(&self, file_id: u64, offset: u64, size: u64, file_size: u64) -> Result<Bytes> {
        let end = offset.saturating_add(size).min(file_size);
        if offset >= end {
            return Ok(Bytes::new());
        }

        let mut out = BytesMut::with_capacity(usize::try_from(end - offset).unwrap_or(0));
        for range in self.mapper.byte_range_to_blocks(offset, end - offset) {
            let len = usize::try_from(range.length).unwrap_or(usize::MAX);
            let start = usize::try_from(range.offset_in_block).unwrap_or(usize::MAX);
            let block = self.load(file_id, range.index).await?.unwrap_or_default();
            let available = block.len().saturating_sub(start).min(len);
            if available > 0 {
                out.extend_from_slice(&block[start..start + available]);
            }
            // Holes and short blocks inside the file read as zeros
            out.resize(out.len() + (len - available), 0);
        }
        Ok(out.freeze())
    }

    /// Drop content beyond `new_size`
    pub async fn truncate(&self, file_id: u64, new_size: u64) -> Result<()> {
        let keep = self.mapper.blocks_for_size(new_size);
        let removed = self
            .delete_from(file_id, &SortCondition::Ge(hex_key(keep)))
            .await?;

        let bs = self.mapper.block_size();
        let rem = new_size % bs;
        if rem != 0 {
            let boundary = new_size / bs;
            if let Some(mut block) = self.load(file_id, boundary).await?
                && (block.len() as u64) > rem
            {
                block.truncate(usize::try_from(rem).unwrap_or(usize::MAX));
                self.store(file_id, boundary, block).await?;
            }
        }
        debug!(
            "Truncated file {} to {} bytes ({} blocks removed)",
            file_id, new_size, removed
        );
        Ok(())
    }

    /// Remove every block of a file
    pub async fn delete_all(&self, file_id: u64) -> Result<usize> {
        let removed = self.delete_from(file_id, &SortCondition::All).await?;
        debug!("Deleted {} blocks of file {}", removed, file_id);
        Ok(removed)
    }

    async fn delete_from(&self, file_id: u64, sort: &SortCondition) -> Result<usize> {
        let partition = BlockMapper::partition(file_id);
        let mut removed = 0;
        let mut after: Option<String> = None;
        loop {
            let page = self
                .kv
                .query(&partition, sort, after.as_deref(), self.page_size, Some(&[]))
                .await?;
            for item in &page.items {
                let _ = self.kv.delete(&item.key, Condition::Always).await?;
                removed += 1;
            }
            match page.last_key {
                Some(k) => after = Some(k.sort),
                None => return Ok(removed),
            }
        }
    }
}

/// Block index encoded in a sort key
#[must_use]
pub fn parse_index(sort: &str) -> Option<u64> {
    u64::from_str_radix(sort, 16).ok()
}

/// File id encoded in a block partition name
#[must_use]
pub fn parse_partition(partition: &str) -> Option<u64> {
    partition
        .strip_prefix(BLOCK_PARTITION_PREFIX)
        .and_then(parse_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvfs_kv::MemoryBackend;

    const KB: u64 = 1024;

    fn store() -> (Arc<MemoryBackend>, BlockStore) {
        let kv = Arc::new(MemoryBackend::new());
        let blocks = BlockStore::new(kv.clone(), 3);
        (kv, blocks)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_single_block_range() {
        let mapper = BlockMapper::default();
        let ranges = mapper.byte_range_to_blocks(100, 500);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].index, 0);
        assert_eq!(ranges[0].offset_in_block, 100);
        assert_eq!(ranges[0].length, 500);
    }

    #[test]
    fn test_range_spanning_blocks() {
        let mapper = BlockMapper::default();
        let ranges = mapper.byte_range_to_blocks(30 * KB, 40 * KB);
        assert_eq!(ranges.len(), 3);

        assert_eq!(ranges[0].index, 0);
        assert_eq!(ranges[0].offset_in_block, 30 * KB);
        assert_eq!(ranges[0].length, 2 * KB);

        assert_eq!(ranges[1].index, 1);
        assert!(ranges[1].is_full(BLOCK_SIZE));

        assert_eq!(ranges[2].index, 2);
        assert_eq!(ranges[2].offset_in_block, 0);
        assert_eq!(ranges[2].length, 6 * KB);
    }

    #[test]
    fn test_empty_range() {
        assert!(BlockMapper::default().byte_range_to_blocks(10, 0).is_empty());
    }

    #[test]
    fn test_blocks_for_size() {
        let mapper = BlockMapper::default();
        assert_eq!(mapper.blocks_for_size(0), 0);
        assert_eq!(mapper.blocks_for_size(1), 1);
        assert_eq!(mapper.blocks_for_size(BLOCK_SIZE), 1);
        assert_eq!(mapper.blocks_for_size(BLOCK_SIZE + 1), 2);
    }

    #[test]
    fn test_keys_sort_numerically() {
        let a = BlockMapper::block_key(1, 9);
        let b = BlockMapper::block_key(1, 10);
        assert!(a < b);
        assert_eq!(parse_index(&b.sort), Some(10));
        assert_eq!(parse_partition(&b.partition), Some(1));
        assert_eq!(parse_partition("/home"), None);
    }

    #[tokio::test]
    async fn test_write_read_across_boundaries() {
        let (kv, blocks) = store();
        let data = pattern(80 * KB as usize);
        blocks.write(1, 0, &data, 0).await.unwrap();
        assert_eq!(kv.partition_len(&BlockMapper::partition(1)), 3);

        let all = blocks.read(1, 0, 80 * KB, 80 * KB).await.unwrap();
        assert_eq!(&all[..], &data[..]);

        let middle = blocks.read(1, 30 * KB, 10 * KB, 80 * KB).await.unwrap();
        assert_eq!(&middle[..], &data[30 * KB as usize..40 * KB as usize]);
    }

    #[tokio::test]
    async fn test_partial_overwrite_keeps_neighbours() {
        let (_kv, blocks) = store();
        let mut expected = pattern(40 * KB as usize);
        blocks.write(1, 0, &expected, 0).await.unwrap();

        let patch = vec![0xee_u8; 100];
        blocks.write(1, BLOCK_SIZE - 50, &patch, 40 * KB).await.unwrap();
        let at = (BLOCK_SIZE - 50) as usize;
        expected[at..at + 100].copy_from_slice(&patch);

        let got = blocks.read(1, 0, 40 * KB, 40 * KB).await.unwrap();
        assert_eq!(&got[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_read_clipped_to_size() {
        let (_kv, blocks) = store();
        blocks.write(1, 0, b"hello world", 0).await.unwrap();
        assert_eq!(&blocks.read(1, 6, 100, 11).await.unwrap()[..], b"world");
        assert!(blocks.read(1, 11, 10, 11).await.unwrap().is_empty());
        assert!(blocks.read(1, 50, 10, 11).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sparse_write_reads_zeros() {
        let (kv, blocks) = store();
        blocks.write(1, 0, b"abc", 0).await.unwrap();
        blocks.write(1, 3 * BLOCK_SIZE, b"xyz", 3).await.unwrap();
        let size = 3 * BLOCK_SIZE + 3;

        // Old tail was padded to a full block; blocks 1 and 2 stay absent
        assert_eq!(kv.partition_len(&BlockMapper::partition(1)), 2);

        let got = blocks.read(1, 0, size, size).await.unwrap();
        assert_eq!(got.len() as u64, size);
        assert_eq!(&got[..3], b"abc");
        assert!(got[3..size as usize - 3].iter().all(|b| *b == 0));
        assert_eq!(&got[size as usize - 3..], b"xyz");
    }

    #[tokio::test]
    async fn test_bytes_past_size_are_not_resurrected() {
        let (_kv, blocks) = store();
        blocks.write(1, 0, b"abc", 0).await.unwrap();
        // Content landed but the size stayed at 3
        blocks.write(1, 3, b"SECRET", 3).await.unwrap();

        blocks.write(1, 20, b"z", 3).await.unwrap();
        let got = blocks.read(1, 0, 21, 21).await.unwrap();
        assert_eq!(&got[..3], b"abc");
        assert!(got[3..20].iter().all(|b| *b == 0));
        assert_eq!(&got[20..], b"z");

        // Same for the padded tail when the write starts in a later block
        blocks.write(2, 0, b"abc", 0).await.unwrap();
        blocks.write(2, 3, b"SECRET", 3).await.unwrap();
        blocks.write(2, 2 * BLOCK_SIZE, b"z", 3).await.unwrap();
        let size = 2 * BLOCK_SIZE + 1;
        let got = blocks.read(2, 0, size, size).await.unwrap();
        assert_eq!(&got[..3], b"abc");
        assert!(got[3..size as usize - 1].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_truncate_shrinks_blocks() {
        let (kv, blocks) = store();
        let data = pattern(100 * KB as usize);
        blocks.write(1, 0, &data, 0).await.unwrap();
        assert_eq!(kv.partition_len(&BlockMapper::partition(1)), 4);

        blocks.truncate(1, 40 * KB).await.unwrap();
        assert_eq!(kv.partition_len(&BlockMapper::partition(1)), 2);

        let got = blocks.read(1, 0, 100 * KB, 40 * KB).await.unwrap();
        assert_eq!(&got[..], &data[..40 * KB as usize]);

        // Growing again exposes zeros, not the old bytes
        let grown = blocks.read(1, 0, 64 * KB, 64 * KB).await.unwrap();
        assert!(grown[40 * KB as usize..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_truncate_on_boundary_and_to_zero() {
        let (kv, blocks) = store();
        blocks.write(1, 0, &pattern(70 * KB as usize), 0).await.unwrap();

        blocks.truncate(1, BLOCK_SIZE).await.unwrap();
        assert_eq!(kv.partition_len(&BlockMapper::partition(1)), 1);

        blocks.truncate(1, 0).await.unwrap();
        assert_eq!(kv.partition_len(&BlockMapper::partition(1)), 0);
    }

    #[tokio::test]
    async fn test_delete_all_is_scoped_to_file() {
        let (kv, blocks) = store();
        for id in [1_u64, 16] {
            blocks.write(id, 0, &pattern(9 * BLOCK_SIZE as usize), 0).await.unwrap();
        }
        assert_eq!(blocks.delete_all(1).await.unwrap(), 9);
        assert_eq!(kv.partition_len(&BlockMapper::partition(1)), 0);
        assert_eq!(kv.partition_len(&BlockMapper::partition(16)), 9);
        assert_eq!(blocks.delete_all(1).await.unwrap(), 0);
    }
}
