//! Overwrite-mode write engine and truncation.
//!
//! A write replaces bytes in place where content already exists and extends
//! the file at the end: first into the last block's padding, then into
//! freshly allocated blocks. Writing past EOF zero-fills the gap; those
//! zeros become real content, so the sum of used sizes always equals the
//! file size.
//!
//! Space is checked up front, before any mutation: the worst-case block
//! demand of the whole request must fit the allocator's free count and the
//! index's remaining slots, otherwise nothing happens and `NoSpace` is
//! returned. After the pre-flight passes, a mid-request device failure
//! returns the byte count already transferred when it is non-zero, and the
//! error otherwise; the index is persisted either way so every allocated
//! block stays referenced.

use crate::{chunk_u32, file_bytes, len_u64, slot_count, sync_meta, FileContext};
use qfs_block::BlockBuf;
use qfs_error::{QfsError, Result};
use qfs_index::{load_index, store_index, BlockDescriptor, IndexBlock};
use qfs_types::{blocks_for_bytes, BLOCK_SIZE, BLOCK_SIZE_U64, MAX_FILE_SIZE};
use tracing::{debug, warn};

/// Write `data` at byte offset `pos`, overwriting existing content and
/// growing the file as needed. Returns the number of payload bytes written.
pub fn write(ctx: &mut FileContext<'_>, pos: u64, data: &[u8]) -> Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    let len = len_u64(data.len());
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= MAX_FILE_SIZE)
        .ok_or(QfsError::NoSpace)?;

    let mut index = load_index(ctx.dev, ctx.index_block)?;
    let size = ctx.meta.size;
    debug!(pos, len, size, "write");

    // Pre-flight: worst-case block demand of the whole request, before any
    // mutation. Bytes past EOF land in the last block's padding first.
    let grow_bytes = end.saturating_sub(size);
    let tail_padding = index
        .last_occupied()
        .and_then(|slot| index.get(slot))
        .map_or(0, |d| u64::from(d.padding()));
    let new_blocks = blocks_for_bytes(grow_bytes.saturating_sub(tail_padding));
    if new_blocks > ctx.alloc.free_count() {
        return Err(QfsError::NoSpace);
    }
    if slot_count(new_blocks) > index.remaining_capacity() {
        return Err(QfsError::NoSpace);
    }

    // Zero-fill any gap between EOF and the write position. The zeros are
    // content: the used-size walk must account for every byte below `pos`.
    let mut dirty = false;
    if pos > size {
        if let Err(e) = append_zeros(ctx, &mut index, pos - size) {
            let _ = store_index(ctx.dev, ctx.index_block, &index);
            sync_meta(ctx, &index);
            return Err(e);
        }
        dirty = true;
    }

    let mut written = 0usize;

    // Replace in place wherever content already exists.
    let overwrite_len = file_bytes(len.min(size.saturating_sub(pos)));
    if overwrite_len > 0 {
        match overwrite_in_place(ctx, &index, pos, &data[..overwrite_len]) {
            Ok(()) => written += overwrite_len,
            Err((done, e)) => {
                written += done;
                if written > 0 {
                    warn!(pos, written, error = %e, "write truncated by device error");
                    sync_meta(ctx, &index);
                    return Ok(written);
                }
                return Err(e);
            }
        }
    }

    // Extend at the end with whatever payload remains.
    let tail = &data[overwrite_len..];
    if !tail.is_empty() {
        dirty = true;
        match append_content(ctx, &mut index, tail) {
            Ok(done) => written += done,
            Err((done, e)) => {
                written += done;
                let _ = store_index(ctx.dev, ctx.index_block, &index);
                sync_meta(ctx, &index);
                if written > 0 {
                    warn!(pos, written, error = %e, "write truncated by device error");
                    return Ok(written);
                }
                return Err(e);
            }
        }
    }

    if dirty {
        store_index(ctx.dev, ctx.index_block, &index)?;
    }
    sync_meta(ctx, &index);
    Ok(written)
}

/// Set the file's length to `new_size`, releasing blocks past the cut when
/// shrinking and zero-filling when growing.
pub fn truncate(ctx: &mut FileContext<'_>, new_size: u64) -> Result<()> {
    if new_size > MAX_FILE_SIZE {
        return Err(QfsError::SizeOutOfRange {
            size: i64::try_from(new_size).unwrap_or(i64::MAX),
        });
    }
    let mut index = load_index(ctx.dev, ctx.index_block)?;
    let size = ctx.meta.size;
    debug!(size, new_size, "truncate");
    if new_size == size {
        return Ok(());
    }

    if new_size > size {
        let grow = new_size - size;
        let tail_padding = index
            .last_occupied()
            .and_then(|slot| index.get(slot))
            .map_or(0, |d| u64::from(d.padding()));
        let new_blocks = blocks_for_bytes(grow.saturating_sub(tail_padding));
        if new_blocks > ctx.alloc.free_count() {
            return Err(QfsError::NoSpace);
        }
        if slot_count(new_blocks) > index.remaining_capacity() {
            return Err(QfsError::NoSpace);
        }
        if let Err(e) = append_zeros(ctx, &mut index, grow) {
            let _ = store_index(ctx.dev, ctx.index_block, &index);
            sync_meta(ctx, &index);
            return Err(e);
        }
        store_index(ctx.dev, ctx.index_block, &index)?;
        sync_meta(ctx, &index);
        return Ok(());
    }

    // Shrink: cut the descriptor array at the new end, then give the blocks
    // past it back. The index is persisted before any release, so a failure
    // in between leaks blocks rather than exposing freed ones.
    let mut released = Vec::new();
    if new_size == 0 {
        released.extend(index.slots().filter(|d| d.is_occupied()).map(|d| d.block()));
        index.truncate_slots(0);
    } else {
        let Some(cut) = index.locate(new_size) else {
            return Err(QfsError::Corruption {
                block: ctx.index_block.0,
                detail: "content shorter than recorded size".into(),
            });
        };
        let keep_through = if cut.offset > 0 { cut.slot + 1 } else { cut.slot };
        for slot in keep_through..index.len() {
            if let Some(d) = index.get(slot).filter(|d| d.is_occupied()) {
                released.push(d.block());
            }
        }
        index.truncate_slots(keep_through);
        if cut.offset > 0 {
            if let Some(d) = index.get_mut(cut.slot) {
                d.set_used_size(cut.offset)?;
            }
        }
    }
    store_index(ctx.dev, ctx.index_block, &index)?;
    for block in released {
        ctx.alloc.release(block)?;
    }
    sync_meta(ctx, &index);
    Ok(())
}

// ── Internals shared with the insert engine's fall-through paths ────────────

/// Copy `payload` over existing content starting at `pos`. The index is not
/// modified; used sizes are unchanged by definition of an overwrite.
/// On a device error, returns the bytes already copied alongside it.
fn overwrite_in_place(
    ctx: &FileContext<'_>,
    index: &IndexBlock,
    pos: u64,
    payload: &[u8],
) -> std::result::Result<(), (usize, QfsError)> {
    let Some(start) = index.locate(pos) else {
        return Err((
            0,
            QfsError::Corruption {
                block: ctx.index_block.0,
                detail: "write position inside recorded size has no descriptor".into(),
            },
        ));
    };

    let mut slot = start.slot;
    let mut in_off = file_bytes(u64::from(start.offset));
    let mut done = 0usize;
    while done < payload.len() {
        let Some(cur) = index.next_occupied(slot) else {
            return Err((
                done,
                QfsError::Corruption {
                    block: ctx.index_block.0,
                    detail: "content ended before recorded size".into(),
                },
            ));
        };
        let Some(desc) = index.get(cur) else {
            break;
        };
        let used = file_bytes(u64::from(desc.used_size()));
        let chunk = (used - in_off).min(payload.len() - done);
        let mut buf = ctx.dev.read_block(desc.block()).map_err(|e| (done, e))?;
        buf.as_mut_slice()[in_off..in_off + chunk].copy_from_slice(&payload[done..done + chunk]);
        ctx.dev
            .write_block(desc.block(), buf.as_slice())
            .map_err(|e| (done, e))?;
        done += chunk;
        in_off = 0;
        slot = cur + 1;
    }
    Ok(())
}

/// Append `payload` after the current content: last block's padding first,
/// then whole fresh blocks. Each block's data is written before its
/// descriptor enters the index, so a failure never leaves the index naming
/// a block whose content is missing. Returns the bytes appended; on error,
/// the count already appended alongside it.
fn append_content(
    ctx: &FileContext<'_>,
    index: &mut IndexBlock,
    payload: &[u8],
) -> std::result::Result<usize, (usize, QfsError)> {
    let mut done = 0usize;

    if let Some(slot) = index.last_occupied() {
        let desc = index.get(slot).copied().unwrap_or(BlockDescriptor::EMPTY);
        let padding = file_bytes(u64::from(desc.padding()));
        if padding > 0 {
            let used = file_bytes(u64::from(desc.used_size()));
            let chunk = padding.min(payload.len());
            let mut buf = ctx.dev.read_block(desc.block()).map_err(|e| (done, e))?;
            buf.as_mut_slice()[used..used + chunk].copy_from_slice(&payload[..chunk]);
            ctx.dev
                .write_block(desc.block(), buf.as_slice())
                .map_err(|e| (done, e))?;
            if let Some(d) = index.get_mut(slot) {
                d.grow(chunk_u32(chunk)).map_err(|e| (done, e))?;
            }
            done += chunk;
        }
    }

    while done < payload.len() {
        let chunk = (payload.len() - done).min(BLOCK_SIZE);
        let block = match ctx.alloc.allocate() {
            Ok(Some(block)) => block,
            Ok(None) => {
                warn!(done, "allocator exhausted after pre-flight check");
                return Err((done, QfsError::AllocFailed));
            }
            Err(e) => return Err((done, e)),
        };
        let mut buf = BlockBuf::zeroed();
        buf.as_mut_slice()[..chunk].copy_from_slice(&payload[done..done + chunk]);
        if let Err(e) = ctx.dev.write_block(block, buf.as_slice()) {
            let _ = ctx.alloc.release(block);
            return Err((done, e));
        }
        let desc = BlockDescriptor::new(block, chunk_u32(chunk)).map_err(|e| (done, e))?;
        if let Err(e) = index.push(desc) {
            let _ = ctx.alloc.release(block);
            return Err((done, e));
        }
        done += chunk;
    }
    Ok(done)
}

/// Append `gap` zero bytes of content: grow the last block's padding
/// (zeroing it explicitly, recycled blocks carry stale bytes), then add
/// zeroed fresh blocks.
pub(crate) fn append_zeros(
    ctx: &FileContext<'_>,
    index: &mut IndexBlock,
    mut gap: u64,
) -> Result<()> {
    if let Some(slot) = index.last_occupied() {
        let desc = index.get(slot).copied().unwrap_or(BlockDescriptor::EMPTY);
        let padding = u64::from(desc.padding());
        if padding > 0 {
            let chunk = padding.min(gap);
            let used = file_bytes(u64::from(desc.used_size()));
            let mut buf = ctx.dev.read_block(desc.block())?;
            buf.as_mut_slice()[used..used + file_bytes(chunk)].fill(0);
            ctx.dev.write_block(desc.block(), buf.as_slice())?;
            if let Some(d) = index.get_mut(slot) {
                d.grow(chunk_u32(file_bytes(chunk)))?;
            }
            gap -= chunk;
        }
    }

    while gap > 0 {
        let chunk = gap.min(BLOCK_SIZE_U64);
        let block = match ctx.alloc.allocate() {
            Ok(Some(block)) => block,
            Ok(None) => {
                warn!(gap, "allocator exhausted after pre-flight check");
                return Err(QfsError::AllocFailed);
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = ctx.dev.write_block(block, BlockBuf::zeroed().as_slice()) {
            let _ = ctx.alloc.release(block);
            return Err(e);
        }
        let desc = BlockDescriptor::new(block, chunk_u32(file_bytes(chunk)))?;
        if let Err(e) = index.push(desc) {
            let _ = ctx.alloc.release(block);
            return Err(e);
        }
        gap -= chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::read;
    use crate::testutil::Fixture;
    use qfs_alloc::{Allocator, BitmapAllocator};
    use qfs_block::{BlockDevice, MemBlockDevice};
    use qfs_types::BlockId;

    fn layout(ctx: &FileContext<'_>) -> Vec<u32> {
        load_index(ctx.dev, ctx.index_block)
            .expect("load")
            .slots()
            .map(qfs_index::BlockDescriptor::used_size)
            .collect()
    }

    #[test]
    fn append_packs_padding_then_allocates() {
        let fix = Fixture::new();
        let mut ctx = fix.ctx();

        let first = vec![b'a'; 4091];
        assert_eq!(write(&mut ctx, 0, &first).expect("write"), 4091);
        assert_eq!(ctx.meta.size, 4091);
        assert_eq!(layout(&ctx), vec![4091]);

        // 5 bytes fit the padding, 14 spill into one fresh block.
        let second = vec![b'b'; 19];
        assert_eq!(write(&mut ctx, 4091, &second).expect("write"), 19);
        assert_eq!(ctx.meta.size, 4110);
        assert_eq!(ctx.meta.block_count, 3);
        assert_eq!(layout(&ctx), vec![4096, 14]);

        let mut buf = vec![0u8; 4110];
        assert_eq!(read(&ctx, 0, &mut buf).expect("read"), 4110);
        assert_eq!(&buf[..4091], &first[..]);
        assert_eq!(&buf[4091..], &second[..]);
    }

    #[test]
    fn overwrite_in_place_keeps_layout() {
        let fix = Fixture::new();
        let mut ctx = fix.seed_chunks(&[b"hello world"]);
        let free_before = fix.alloc.free_count();

        assert_eq!(write(&mut ctx, 6, b"quilt").expect("write"), 5);
        assert_eq!(ctx.meta.size, 11);
        assert_eq!(layout(&ctx), vec![11]);
        assert_eq!(fix.alloc.free_count(), free_before);

        let mut buf = vec![0u8; 11];
        read(&ctx, 0, &mut buf).expect("read");
        assert_eq!(&buf, b"hello quilt");
    }

    #[test]
    fn overwrite_spans_partial_interior_blocks() {
        // Fragmented layout: the overwrite walk must honor used sizes, not
        // block boundaries.
        let fix = Fixture::new();
        let mut ctx = fix.seed_chunks(&[&[b'x'; 48], &[b'y'; 48]]);

        assert_eq!(write(&mut ctx, 40, &[b'Z'; 16]).expect("write"), 16);
        assert_eq!(layout(&ctx), vec![48, 48]);

        let mut buf = vec![0u8; 96];
        read(&ctx, 0, &mut buf).expect("read");
        assert_eq!(&buf[..40], &[b'x'; 40]);
        assert_eq!(&buf[40..56], &[b'Z'; 16]);
        assert_eq!(&buf[56..], &[b'y'; 40]);
    }

    #[test]
    fn write_past_eof_zero_fills_gap() {
        let fix = Fixture::new();
        let mut ctx = fix.ctx();

        assert_eq!(write(&mut ctx, 8202, b"end").expect("write"), 3);
        assert_eq!(ctx.meta.size, 8205);
        assert_eq!(layout(&ctx), vec![4096, 4096, 13]);

        let mut buf = vec![0u8; 8205];
        assert_eq!(read(&ctx, 0, &mut buf).expect("read"), 8205);
        assert!(buf[..8202].iter().all(|&b| b == 0));
        assert_eq!(&buf[8202..], b"end");
    }

    #[test]
    fn gap_zeros_even_on_recycled_blocks() {
        let fix = Fixture::new();
        let mut ctx = fix.ctx();

        // Dirty a block, release it, then make the gap fill reuse it.
        let block = fix.alloc.allocate().expect("alloc").expect("space");
        fix.dev
            .write_block(block, &[0xAAu8; 4096])
            .expect("write block");
        fix.alloc.release(block).expect("release");

        write(&mut ctx, 0, b"a").expect("write");
        write(&mut ctx, 4100, b"b").expect("write");

        let mut buf = vec![0u8; 4101];
        read(&ctx, 0, &mut buf).expect("read");
        assert_eq!(buf[0], b'a');
        assert!(buf[1..4100].iter().all(|&b| b == 0));
        assert_eq!(buf[4100], b'b');
    }

    #[test]
    fn preflight_rejects_before_any_mutation() {
        let dev = MemBlockDevice::new(8);
        // Blocks 0 and 1 reserved; only 2 data blocks available.
        let alloc = BitmapAllocator::new(4, 2).expect("allocator");
        let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));

        let big = vec![0u8; 3 * 4096];
        assert!(matches!(write(&mut ctx, 0, &big), Err(QfsError::NoSpace)));
        assert_eq!(alloc.free_count(), 2);
        assert_eq!(ctx.meta.size, 0);
        assert!(load_index(&dev, BlockId(1)).expect("load").is_empty());
    }

    #[test]
    fn write_beyond_max_file_size_is_no_space() {
        let fix = Fixture::new();
        let mut ctx = fix.ctx();
        assert!(matches!(
            write(&mut ctx, MAX_FILE_SIZE, b"x"),
            Err(QfsError::NoSpace)
        ));
        assert!(matches!(
            write(&mut ctx, u64::MAX, b"x"),
            Err(QfsError::NoSpace)
        ));
    }

    #[test]
    fn empty_write_is_a_no_op() {
        let fix = Fixture::new();
        let mut ctx = fix.ctx();
        assert_eq!(write(&mut ctx, 0, b"").expect("write"), 0);
        assert_eq!(ctx.meta.size, 0);
    }

    #[test]
    fn truncate_shrinks_and_releases() {
        let fix = Fixture::new();
        let full = vec![b'a'; 4096];
        let mut ctx = fix.seed_chunks(&[&full, &full, b"tail"]);
        let free_before = fix.alloc.free_count();

        truncate(&mut ctx, 4100).expect("truncate");
        assert_eq!(ctx.meta.size, 4100);
        assert_eq!(layout(&ctx), vec![4096, 4]);
        assert_eq!(fix.alloc.free_count(), free_before + 1);

        truncate(&mut ctx, 0).expect("truncate");
        assert_eq!(ctx.meta.size, 0);
        assert_eq!(ctx.meta.block_count, 1);
        assert_eq!(fix.alloc.free_count(), free_before + 3);
    }

    #[test]
    fn truncate_on_block_boundary_keeps_whole_blocks() {
        let fix = Fixture::new();
        let full = vec![b'a'; 4096];
        let mut ctx = fix.seed_chunks(&[&full, b"tail"]);

        truncate(&mut ctx, 4096).expect("truncate");
        assert_eq!(layout(&ctx), vec![4096]);
        assert_eq!(ctx.meta.size, 4096);
    }

    #[test]
    fn truncate_grow_zero_fills() {
        let fix = Fixture::new();
        let mut ctx = fix.seed_chunks(&[b"abc"]);

        truncate(&mut ctx, 5000).expect("truncate");
        assert_eq!(ctx.meta.size, 5000);
        assert_eq!(layout(&ctx), vec![4096, 904]);

        let mut buf = vec![0u8; 5000];
        read(&ctx, 0, &mut buf).expect("read");
        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..].iter().all(|&b| b == 0));
    }
}
