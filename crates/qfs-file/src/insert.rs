//! Insert-mode write engine.
//!
//! An insert shifts existing content right instead of overwriting it. The
//! payload always lands in freshly allocated blocks (plus, on a mid-block
//! split, the head of the target block); existing blocks are never grown
//! into, which is what leaves partially filled blocks behind and makes
//! defragmentation worthwhile.
//!
//! Inserts are all-or-nothing: every block the request needs is counted and
//! allocated before the first descriptor moves, and any failure before the
//! index is persisted releases those blocks and leaves the file untouched.
//! The one in-place rewrite (the split target's block) is the last data
//! write, after every fresh block is safely on disk.

use crate::{
    allocate_exact, chunk_u32, file_bytes, len_u64, release_all, slot_count, sync_meta,
    FileContext,
};
use qfs_block::BlockBuf;
use qfs_error::{QfsError, Result};
use qfs_index::{load_index, store_index, BlockDescriptor, IndexBlock, Position};
use qfs_types::{blocks_for_bytes, BlockId, BLOCK_SIZE, BLOCK_SIZE_U32, MAX_FILE_SIZE};
use tracing::debug;

/// Insert `data` at byte offset `pos`, shifting existing content right.
/// Returns the number of payload bytes written (all of them, or an error).
pub fn insert_write(ctx: &mut FileContext<'_>, pos: u64, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let len = len_u64(data.len());
    let size = ctx.meta.size;
    let new_size = size
        .max(pos)
        .checked_add(len)
        .filter(|&end| end <= MAX_FILE_SIZE)
        .ok_or(QfsError::NoSpace)?;

    let mut index = load_index(ctx.dev, ctx.index_block)?;
    debug!(pos, len, size, "insert_write");

    if pos >= size {
        append_fresh(ctx, &mut index, pos - size, data)?;
    } else {
        let Some(target) = index.locate(pos) else {
            return Err(QfsError::Corruption {
                block: ctx.index_block.0,
                detail: "insert position inside recorded size has no descriptor".into(),
            });
        };
        if target.offset == 0 {
            insert_before(ctx, &mut index, target.slot, data)?;
        } else {
            insert_split(ctx, &mut index, target, data)?;
        }
    }

    store_index(ctx.dev, ctx.index_block, &index)?;
    sync_meta(ctx, &index);
    debug_assert_eq!(ctx.meta.size, new_size);
    Ok(data.len())
}

/// Append at or past EOF in insert mode: zero blocks for any gap, then the
/// payload, all in fresh blocks. Existing padding is left alone.
fn append_fresh(
    ctx: &FileContext<'_>,
    index: &mut IndexBlock,
    gap: u64,
    data: &[u8],
) -> Result<()> {
    let gap_blocks = slot_count(blocks_for_bytes(gap));
    let payload_blocks = slot_count(blocks_for_bytes(len_u64(data.len())));
    let needed = gap_blocks + payload_blocks;
    preflight(ctx, index, needed)?;

    let blocks = allocate_exact(ctx.alloc, needed)?;

    // Zero blocks first. Every gap block is full except possibly the last.
    let mut gap_sizes = Vec::with_capacity(gap_blocks);
    let mut remaining = gap;
    for block in &blocks[..gap_blocks] {
        let chunk = remaining.min(qfs_types::BLOCK_SIZE_U64);
        if let Err(e) = ctx.dev.write_block(*block, BlockBuf::zeroed().as_slice()) {
            release_all(ctx.alloc, &blocks);
            return Err(e);
        }
        gap_sizes.push(chunk_u32(file_bytes(chunk)));
        remaining -= chunk;
    }

    let payload_sizes = match write_payload_blocks(ctx, &blocks[gap_blocks..], data) {
        Ok(sizes) => sizes,
        Err(e) => {
            release_all(ctx.alloc, &blocks);
            return Err(e);
        }
    };

    for (block, used) in blocks[..gap_blocks].iter().zip(gap_sizes) {
        index.push(BlockDescriptor::new(*block, used)?)?;
    }
    for (block, used) in blocks[gap_blocks..].iter().zip(payload_sizes) {
        index.push(BlockDescriptor::new(*block, used)?)?;
    }
    Ok(())
}

/// Insert on a chunk boundary: the payload goes into fresh blocks spliced in
/// before `slot`; no existing block is touched.
fn insert_before(
    ctx: &FileContext<'_>,
    index: &mut IndexBlock,
    slot: usize,
    data: &[u8],
) -> Result<()> {
    let needed = slot_count(blocks_for_bytes(len_u64(data.len())));
    preflight(ctx, index, needed)?;

    let blocks = allocate_exact(ctx.alloc, needed)?;
    let sizes = match write_payload_blocks(ctx, &blocks, data) {
        Ok(sizes) => sizes,
        Err(e) => {
            release_all(ctx.alloc, &blocks);
            return Err(e);
        }
    };

    index.open_gap(slot, needed)?;
    for (i, (block, used)) in blocks.iter().zip(sizes).enumerate() {
        index.set(slot + i, BlockDescriptor::new(*block, used)?)?;
    }
    Ok(())
}

/// Insert inside a chunk: split the target block at the insert offset. The
/// bytes after the offset move to a fresh tail block, the payload head fills
/// the target up to the block boundary, and any payload overflow takes fresh
/// blocks between the two.
fn insert_split(
    ctx: &FileContext<'_>,
    index: &mut IndexBlock,
    target: Position,
    data: &[u8],
) -> Result<()> {
    let Some(desc) = index.get(target.slot).copied().filter(BlockDescriptor::is_occupied) else {
        return Err(QfsError::Corruption {
            block: ctx.index_block.0,
            detail: "located slot is unoccupied".into(),
        });
    };
    let in_off = target.offset;
    // locate() guarantees 0 < in_off < used_size.
    let tail_len = desc.used_size() - in_off;
    let head_room = file_bytes(u64::from(BLOCK_SIZE_U32 - in_off));
    let head = data.len().min(head_room);
    let overflow_blocks = slot_count(blocks_for_bytes(len_u64(data.len() - head)));
    let needed = overflow_blocks + 1;
    preflight(ctx, index, needed)?;

    let blocks = allocate_exact(ctx.alloc, needed)?;
    let tail_block = blocks[overflow_blocks];
    let io = file_bytes(u64::from(in_off));
    let tl = file_bytes(u64::from(tail_len));

    // Relocate the tail before anything overwrites it.
    let mut target_buf = match ctx.dev.read_block(desc.block()) {
        Ok(buf) => buf,
        Err(e) => {
            release_all(ctx.alloc, &blocks);
            return Err(e);
        }
    };
    let mut tail_buf = BlockBuf::zeroed();
    tail_buf.as_mut_slice()[..tl].copy_from_slice(&target_buf.as_slice()[io..io + tl]);
    if let Err(e) = ctx.dev.write_block(tail_block, tail_buf.as_slice()) {
        release_all(ctx.alloc, &blocks);
        return Err(e);
    }

    let overflow_sizes = match write_payload_blocks(ctx, &blocks[..overflow_blocks], &data[head..])
    {
        Ok(sizes) => sizes,
        Err(e) => {
            release_all(ctx.alloc, &blocks);
            return Err(e);
        }
    };

    // The only in-place data write comes last: once every fresh block is on
    // disk, rewrite the target's tail region with the payload head.
    target_buf.as_mut_slice()[io..io + head].copy_from_slice(&data[..head]);
    if let Err(e) = ctx.dev.write_block(desc.block(), target_buf.as_slice()) {
        release_all(ctx.alloc, &blocks);
        return Err(e);
    }

    if let Some(d) = index.get_mut(target.slot) {
        d.set_used_size(in_off + chunk_u32(head))?;
    }
    index.open_gap(target.slot + 1, needed)?;
    for (i, (block, used)) in blocks[..overflow_blocks].iter().zip(overflow_sizes).enumerate() {
        index.set(target.slot + 1 + i, BlockDescriptor::new(*block, used)?)?;
    }
    index.set(
        target.slot + 1 + overflow_blocks,
        BlockDescriptor::new(tail_block, tail_len)?,
    )?;
    Ok(())
}

/// All-or-nothing space check: `needed` fresh blocks must fit both the
/// allocator and the index's remaining slots.
fn preflight(ctx: &FileContext<'_>, index: &IndexBlock, needed: usize) -> Result<()> {
    if len_u64(needed) > ctx.alloc.free_count() || needed > index.remaining_capacity() {
        return Err(QfsError::NoSpace);
    }
    Ok(())
}

/// Write `data` across `blocks`, one zero-padded chunk per block, returning
/// each block's used size. The caller releases the blocks on error.
fn write_payload_blocks(
    ctx: &FileContext<'_>,
    blocks: &[BlockId],
    data: &[u8],
) -> Result<Vec<u32>> {
    let mut sizes = Vec::with_capacity(blocks.len());
    let mut off = 0usize;
    for block in blocks {
        let chunk = (data.len() - off).min(BLOCK_SIZE);
        let mut buf = BlockBuf::zeroed();
        buf.as_mut_slice()[..chunk].copy_from_slice(&data[off..off + chunk]);
        ctx.dev.write_block(*block, buf.as_slice())?;
        sizes.push(chunk_u32(chunk));
        off += chunk;
    }
    Ok(sizes)
}
