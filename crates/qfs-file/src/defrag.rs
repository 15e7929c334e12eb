//! Defragmentation: pack content left and reclaim drained blocks.
//!
//! Pass one walks the descriptor array with a destination cursor and pulls
//! bytes from the next occupied descriptor into the destination's padding.
//! A source that drains completely gives its block back to the allocator
//! and leaves a hole; a source that drains partially shifts its remaining
//! bytes to the front of its own block. Pass two drops the holes so the
//! descriptor array is dense again.
//!
//! Runtime safety comes from write ordering inside each step: the
//! destination block (and, for partial drains, the shifted source block)
//! hits the device before any descriptor changes, so aborting between steps
//! leaves the index describing exactly the bytes on disk. Stray bytes may
//! remain in padding, which no reader can see.

use crate::{file_bytes, FileContext};
use qfs_block::BlockBuf;
use qfs_error::Result;
use qfs_index::{load_index, store_index, BlockDescriptor, IndexBlock};
use tracing::debug;

/// Pack the file's content into as few blocks as possible. Returns the
/// number of blocks released back to the allocator. Content and size are
/// unchanged; running it again on an already-packed file reclaims nothing.
pub fn defragment(ctx: &mut FileContext<'_>) -> Result<u32> {
    let mut index = load_index(ctx.dev, ctx.index_block)?;
    let mut reclaimed = 0u32;

    let outcome = pack_pass(ctx, &mut index, &mut reclaimed);
    match outcome {
        Ok(()) => {
            index.compact();
            store_index(ctx.dev, ctx.index_block, &index)?;
            ctx.meta.block_count = index.occupied_count() + 1;
            ctx.touch();
            debug!(reclaimed, blocks = ctx.meta.block_count, "defragment complete");
            Ok(reclaimed)
        }
        Err(e) => {
            // Holes and partially packed blocks are a valid layout; persist
            // what the pass got through so released blocks stay released
            // and moved bytes stay referenced.
            let _ = store_index(ctx.dev, ctx.index_block, &index);
            ctx.meta.block_count = index.occupied_count() + 1;
            ctx.touch();
            Err(e)
        }
    }
}

fn pack_pass(ctx: &FileContext<'_>, index: &mut IndexBlock, reclaimed: &mut u32) -> Result<()> {
    let Some(mut dst) = index.next_occupied(0) else {
        return Ok(());
    };
    loop {
        let dst_desc = index.get(dst).copied().unwrap_or(BlockDescriptor::EMPTY);
        if dst_desc.padding() == 0 {
            match index.next_occupied(dst + 1) {
                Some(next) => {
                    dst = next;
                    continue;
                }
                None => return Ok(()),
            }
        }
        let Some(src) = index.next_occupied(dst + 1) else {
            return Ok(());
        };
        let src_desc = index.get(src).copied().unwrap_or(BlockDescriptor::EMPTY);
        let moved = src_desc.used_size().min(dst_desc.padding());

        let mut dst_buf = ctx.dev.read_block(dst_desc.block())?;
        let src_buf = ctx.dev.read_block(src_desc.block())?;
        let dst_used = file_bytes(u64::from(dst_desc.used_size()));
        let m = file_bytes(u64::from(moved));
        dst_buf.as_mut_slice()[dst_used..dst_used + m].copy_from_slice(&src_buf.as_slice()[..m]);
        ctx.dev.write_block(dst_desc.block(), dst_buf.as_slice())?;

        if moved == src_desc.used_size() {
            // Source drained entirely: give the block back, leave a hole
            // for the compaction pass.
            if let Some(d) = index.get_mut(dst) {
                d.grow(moved)?;
            }
            index.set(src, BlockDescriptor::EMPTY)?;
            ctx.alloc.release(src_desc.block())?;
            *reclaimed += 1;
        } else {
            // Shift the remainder to the front of the source block, zeroing
            // the vacated tail, before the descriptors change.
            let rem = file_bytes(u64::from(src_desc.used_size() - moved));
            let mut shifted = BlockBuf::zeroed();
            shifted.as_mut_slice()[..rem].copy_from_slice(&src_buf.as_slice()[m..m + rem]);
            ctx.dev.write_block(src_desc.block(), shifted.as_slice())?;
            if let Some(d) = index.get_mut(dst) {
                d.grow(moved)?;
            }
            if let Some(d) = index.get_mut(src) {
                d.shrink(moved)?;
            }
        }
    }
}
