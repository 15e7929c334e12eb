//! File layout diagnostics.

use crate::FileContext;
use qfs_error::Result;
use qfs_index::load_index;
use qfs_types::BlockId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One occupied descriptor, in logical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapEntry {
    pub block: BlockId,
    pub used_size: u32,
}

/// Snapshot of a file's physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    /// File size in bytes.
    pub size: u64,
    /// Physical blocks owned, counting the index block.
    pub block_count: u32,
    /// Data blocks referenced by occupied descriptors.
    pub data_blocks: u32,
    /// Data blocks with `used_size < 4096`.
    pub partial_blocks: u32,
    /// Padding bytes across all data blocks; the space defragmentation
    /// could pack away (minus one trailing partial block's worth).
    pub wasted_bytes: u64,
    /// Occupied descriptors in logical order.
    pub blocks: Vec<BlockMapEntry>,
}

impl fmt::Display for FileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} bytes in {} data blocks ({} partial, {} bytes wasted)",
            self.size, self.data_blocks, self.partial_blocks, self.wasted_bytes
        )?;
        for (i, entry) in self.blocks.iter().enumerate() {
            writeln!(f, "  [{i}] block {} used {}", entry.block, entry.used_size)?;
        }
        Ok(())
    }
}

/// Build a [`FileReport`] from the file's index block.
pub fn describe(ctx: &FileContext<'_>) -> Result<FileReport> {
    let index = load_index(ctx.dev, ctx.index_block)?;
    let mut blocks = Vec::new();
    let mut partial_blocks = 0u32;
    let mut wasted_bytes = 0u64;
    for desc in index.slots().filter(|d| d.is_occupied()) {
        if desc.padding() > 0 {
            partial_blocks += 1;
            wasted_bytes += u64::from(desc.padding());
        }
        blocks.push(BlockMapEntry {
            block: desc.block(),
            used_size: desc.used_size(),
        });
    }
    let data_blocks = index.occupied_count();
    Ok(FileReport {
        size: index.total_used(),
        block_count: data_blocks + 1,
        data_blocks,
        partial_blocks,
        wasted_bytes,
        blocks,
    })
}
