//! Read engines.
//!
//! [`read`] walks descriptors' tracked used sizes and is correct for any
//! layout. [`read_fixed`] maps offsets with a fixed 4096-byte stride, which
//! is cheaper but only sound while every block except the last is full; on a
//! layout with partially filled interior blocks it returns whatever bytes sit
//! at the strided positions.
//!
//! Both clamp at EOF and never fail on an in-bounds short read: if the device
//! errors after some bytes were already copied, the partial count is
//! returned.

use crate::{file_bytes, slot_count, FileContext};
use qfs_error::Result;
use qfs_index::load_index;
use qfs_types::BLOCK_SIZE_U64;
use tracing::{debug, trace};

/// Read up to `buf.len()` bytes at byte offset `pos`, walking used sizes.
///
/// Returns the number of bytes copied into `buf`; 0 means `pos` is at or
/// past EOF.
pub fn read(ctx: &FileContext<'_>, pos: u64, buf: &mut [u8]) -> Result<usize> {
    let size = ctx.meta.size;
    if buf.is_empty() || pos >= size {
        return Ok(0);
    }
    let index = load_index(ctx.dev, ctx.index_block)?;
    let want = buf.len().min(file_bytes(size - pos));

    let Some(start) = index.locate(pos) else {
        // The index holds fewer bytes than the recorded size claims; the
        // walk is authoritative, so there is nothing to read here.
        return Ok(0);
    };

    let mut slot = start.slot;
    let mut in_off = file_bytes(u64::from(start.offset));
    let mut copied = 0usize;
    while copied < want {
        let Some(cur) = index.next_occupied(slot) else {
            break;
        };
        let Some(desc) = index.get(cur) else {
            break;
        };
        let used = file_bytes(u64::from(desc.used_size()));
        let chunk = (used - in_off).min(want - copied);
        let block = match ctx.dev.read_block(desc.block()) {
            Ok(block) => block,
            Err(e) if copied > 0 => {
                debug!(pos, copied, block = %desc.block(), error = %e, "short read");
                return Ok(copied);
            }
            Err(e) => return Err(e),
        };
        buf[copied..copied + chunk].copy_from_slice(&block.as_slice()[in_off..in_off + chunk]);
        copied += chunk;
        in_off = 0;
        slot = cur + 1;
    }
    trace!(pos, copied, "read");
    Ok(copied)
}

/// Read up to `buf.len()` bytes at `pos`, assuming a fixed 4096-byte stride.
///
/// Logical block `i` is expected at slot `i`, full except for the last one.
/// The last block's live length is derived from the file size, not from the
/// descriptor, mirroring the layout assumption.
pub fn read_fixed(ctx: &FileContext<'_>, pos: u64, buf: &mut [u8]) -> Result<usize> {
    let size = ctx.meta.size;
    if buf.is_empty() || pos >= size {
        return Ok(0);
    }
    let index = load_index(ctx.dev, ctx.index_block)?;
    let nb_blocks = qfs_types::blocks_for_bytes(size);
    let mut last_len = size % BLOCK_SIZE_U64;
    if last_len == 0 {
        last_len = BLOCK_SIZE_U64;
    }
    let want = buf.len().min(file_bytes(size - pos));

    let mut logical = pos / BLOCK_SIZE_U64;
    let mut in_off = file_bytes(pos % BLOCK_SIZE_U64);
    let mut copied = 0usize;
    while copied < want && logical < nb_blocks {
        let limit = if logical + 1 == nb_blocks {
            file_bytes(last_len)
        } else {
            file_bytes(BLOCK_SIZE_U64)
        };
        if in_off >= limit {
            break;
        }
        let Some(desc) = index.get(slot_count(logical)).filter(|d| d.is_occupied()) else {
            break;
        };
        let chunk = (limit - in_off).min(want - copied);
        let block = match ctx.dev.read_block(desc.block()) {
            Ok(block) => block,
            Err(e) if copied > 0 => {
                debug!(pos, copied, block = %desc.block(), error = %e, "short read");
                return Ok(copied);
            }
            Err(e) => return Err(e),
        };
        buf[copied..copied + chunk].copy_from_slice(&block.as_slice()[in_off..in_off + chunk]);
        copied += chunk;
        in_off = 0;
        logical += 1;
    }
    trace!(pos, copied, "read_fixed");
    Ok(copied)
}
