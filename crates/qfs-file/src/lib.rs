#![forbid(unsafe_code)]
//! File content engines: read, write, insert, truncate, defragment, inspect.
//!
//! Every operation follows the same cycle: load the file's index block,
//! mutate descriptors and data blocks in memory, persist touched data blocks
//! as they are produced, persist the index block last, then update the file
//! metadata. Data blocks are always written before the index that references
//! them, so a crash mid-operation never leaves the index pointing at a block
//! whose content write is still pending. There is no cross-block atomicity
//! beyond that ordering.
//!
//! Concurrency: none here. The caller serializes access per file; distinct
//! files may be operated on concurrently because the only shared state is
//! the allocator, which is thread-safe by contract.

mod defrag;
mod insert;
mod inspect;
mod read;
mod write;

pub use defrag::defragment;
pub use insert::insert_write;
pub use inspect::{describe, BlockMapEntry, FileReport};
pub use read::{read, read_fixed};
pub use write::{truncate, write};

use qfs_alloc::Allocator;
use qfs_block::BlockDevice;
use qfs_error::{QfsError, Result};
use qfs_types::BlockId;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::warn;

/// Mutable per-file metadata mirrored from the inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMeta {
    /// Total addressable byte length.
    pub size: u64,
    /// Physical blocks consumed, counting the index block itself.
    pub block_count: u32,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl FileMeta {
    /// Metadata for a freshly created, empty file: no content, one block
    /// (the index block).
    #[must_use]
    pub fn empty() -> Self {
        let now = SystemTime::now();
        Self {
            size: 0,
            block_count: 1,
            mtime: now,
            ctime: now,
        }
    }
}

impl Default for FileMeta {
    fn default() -> Self {
        Self::empty()
    }
}

/// Everything one file operation needs: the collaborators and the file's
/// identity and metadata.
///
/// The index block is re-loaded from the device at the start of every
/// operation and persisted before the operation returns; no index state is
/// cached across calls.
pub struct FileContext<'a> {
    pub dev: &'a dyn BlockDevice,
    pub alloc: &'a dyn Allocator,
    pub index_block: BlockId,
    pub meta: FileMeta,
}

impl<'a> FileContext<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice, alloc: &'a dyn Allocator, index_block: BlockId) -> Self {
        Self {
            dev,
            alloc,
            index_block,
            meta: FileMeta::empty(),
        }
    }

    /// Stamp mtime/ctime after a successful mutation.
    pub(crate) fn touch(&mut self) {
        let now = SystemTime::now();
        self.meta.mtime = now;
        self.meta.ctime = now;
    }
}

/// Refresh derived metadata from the index after a mutation: size mirrors
/// the sum of used sizes, block count is data blocks plus the index block.
pub(crate) fn sync_meta(ctx: &mut FileContext<'_>, index: &qfs_index::IndexBlock) {
    ctx.meta.size = index.total_used();
    ctx.meta.block_count = index.occupied_count() + 1;
    ctx.touch();
}

/// Narrow an in-file byte count to `usize`.
#[must_use]
pub(crate) fn file_bytes(value: u64) -> usize {
    // Bounded by MAX_FILE_SIZE (4 MiB), so the narrowing is lossless.
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Narrow a block or slot count to `usize`.
#[must_use]
pub(crate) fn slot_count(blocks: u64) -> usize {
    // Bounded by INDEX_ENTRIES, so the narrowing is lossless.
    usize::try_from(blocks).unwrap_or(usize::MAX)
}

/// Widen a slice length to `u64` for offset arithmetic.
#[must_use]
pub(crate) fn len_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

/// Narrow a per-block chunk length (<= 4096) to `u32`.
#[must_use]
pub(crate) fn chunk_u32(chunk: usize) -> u32 {
    u32::try_from(chunk).unwrap_or(qfs_types::BLOCK_SIZE_U32)
}

/// Return a set of freshly allocated blocks that never made it into the
/// index. Release failures are ignored: the blocks were invisible to every
/// reader, and the original error is the one worth reporting.
pub(crate) fn release_all(alloc: &dyn Allocator, blocks: &[BlockId]) {
    for block in blocks {
        let _ = alloc.release(*block);
    }
}

/// Allocate exactly `n` blocks, releasing everything already obtained if the
/// allocator comes up short mid-way. Used by the paths that promise
/// all-or-nothing behavior with respect to space.
pub(crate) fn allocate_exact(alloc: &dyn Allocator, n: usize) -> Result<Vec<BlockId>> {
    let mut blocks = Vec::with_capacity(n);
    for _ in 0..n {
        match alloc.allocate() {
            Ok(Some(block)) => blocks.push(block),
            Ok(None) => {
                warn!(
                    requested = n,
                    obtained = blocks.len(),
                    "allocator exhausted after pre-flight check"
                );
                release_all(alloc, &blocks);
                return Err(QfsError::AllocFailed);
            }
            Err(e) => {
                release_all(alloc, &blocks);
                return Err(e);
            }
        }
    }
    Ok(blocks)
}

// ── Strategy selection ──────────────────────────────────────────────────────

/// How reads map byte offsets to blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStrategy {
    /// Fixed 4096-byte stride; valid only while no interior block is
    /// partially filled (i.e. the file has never been insert-written).
    #[default]
    FixedStride,
    /// Walk descriptors' tracked used sizes; correct for any layout.
    TrackedSizes,
}

/// How writes place bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteStrategy {
    /// Replace bytes in place, extending at the end.
    #[default]
    Overwrite,
    /// Preserve existing bytes after the write position by splitting and
    /// shifting blocks.
    Insert,
}

/// Per-call strategy configuration, resolved once per operation.
///
/// This replaces mutable module-global function pointers: the choice of
/// implementation variant is plain data handed to the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOps {
    pub read: ReadStrategy,
    pub write: WriteStrategy,
}

impl FileOps {
    /// Read up to `buf.len()` bytes at `pos` using the configured strategy.
    pub fn read(&self, ctx: &FileContext<'_>, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match self.read {
            ReadStrategy::FixedStride => read_fixed(ctx, pos, buf),
            ReadStrategy::TrackedSizes => read(ctx, pos, buf),
        }
    }

    /// Write `data` at `pos` using the configured strategy.
    pub fn write(&self, ctx: &mut FileContext<'_>, pos: u64, data: &[u8]) -> Result<usize> {
        match self.write {
            WriteStrategy::Overwrite => write(ctx, pos, data),
            WriteStrategy::Insert => insert_write(ctx, pos, data),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use qfs_alloc::BitmapAllocator;

    #[test]
    fn allocate_exact_rolls_back_on_exhaustion() {
        let alloc = BitmapAllocator::new(8, 1).expect("allocator");
        assert_eq!(alloc.free_count(), 7);

        let err = allocate_exact(&alloc, 10).expect_err("not enough blocks");
        assert!(matches!(err, QfsError::AllocFailed));
        // Everything obtained before the failure was returned.
        assert_eq!(alloc.free_count(), 7);

        let blocks = allocate_exact(&alloc, 7).expect("exact fit");
        assert_eq!(blocks.len(), 7);
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn default_strategies_match_the_plain_paths() {
        let ops = FileOps::default();
        assert_eq!(ops.read, ReadStrategy::FixedStride);
        assert_eq!(ops.write, WriteStrategy::Overwrite);
    }
}
