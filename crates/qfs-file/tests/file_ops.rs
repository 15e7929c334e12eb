//! End-to-end exercises over an in-memory volume: the write engines, both
//! read strategies, truncation, defragmentation, and the layout report.

use qfs_alloc::{Allocator, BitmapAllocator};
use qfs_block::{BlockBuf, BlockDevice, MemBlockDevice};
use qfs_error::{QfsError, Result};
use qfs_file::{
    defragment, describe, insert_write, read, read_fixed, truncate, write, FileContext, FileOps,
    ReadStrategy, WriteStrategy,
};
use qfs_index::load_index;
use qfs_types::BlockId;

const VOLUME_BLOCKS: u32 = 2048;

struct Volume {
    dev: MemBlockDevice,
    alloc: BitmapAllocator,
}

impl Volume {
    fn new() -> Self {
        Self {
            dev: MemBlockDevice::new(u64::from(VOLUME_BLOCKS)),
            // Block 0 is the sentinel, block 1 the file's index block.
            alloc: BitmapAllocator::new(VOLUME_BLOCKS, 2).expect("allocator"),
        }
    }

    fn ctx(&self) -> FileContext<'_> {
        FileContext::new(&self.dev, &self.alloc, BlockId(1))
    }
}

fn layout(ctx: &FileContext<'_>) -> Vec<u32> {
    load_index(ctx.dev, ctx.index_block)
        .expect("load")
        .slots()
        .map(qfs_index::BlockDescriptor::used_size)
        .collect()
}

fn slurp(ctx: &FileContext<'_>) -> Vec<u8> {
    let mut buf = vec![0u8; usize::try_from(ctx.meta.size).expect("size fits")];
    let n = read(ctx, 0, &mut buf).expect("read");
    assert_eq!(n, buf.len());
    buf
}

#[test]
fn append_then_tail_packing() {
    let vol = Volume::new();
    let mut ctx = vol.ctx();

    let first = vec![b'a'; 4091];
    let second = vec![b'b'; 19];
    assert_eq!(write(&mut ctx, 0, &first).expect("write"), 4091);
    assert_eq!(write(&mut ctx, 4091, &second).expect("write"), 19);

    assert_eq!(ctx.meta.size, 4110);
    assert_eq!(layout(&ctx), vec![4096, 14]);

    let report = describe(&ctx).expect("describe");
    assert_eq!(report.data_blocks, 2);
    assert_eq!(report.partial_blocks, 1);
    assert_eq!(report.wasted_bytes, 4096 - 14);

    // Both strategies agree on this strided layout.
    let mut a = vec![0u8; 4110];
    let mut b = vec![0u8; 4110];
    assert_eq!(read(&ctx, 0, &mut a).expect("read"), 4110);
    assert_eq!(read_fixed(&ctx, 0, &mut b).expect("read"), 4110);
    assert_eq!(a, b);
}

#[test]
fn fragment_then_defragment_round_trip() {
    let vol = Volume::new();
    let mut ctx = vol.ctx();

    // Build up a deliberately fragmented file with insert-mode writes.
    insert_write(&mut ctx, 0, &[b'c'; 48]).expect("insert");
    insert_write(&mut ctx, 0, &[b'a'; 48]).expect("insert");
    insert_write(&mut ctx, 48, &[b'b'; 48]).expect("insert");
    assert_eq!(layout(&ctx), vec![48, 48, 48]);

    let mut expected = Vec::new();
    expected.extend_from_slice(&[b'a'; 48]);
    expected.extend_from_slice(&[b'b'; 48]);
    expected.extend_from_slice(&[b'c'; 48]);
    assert_eq!(slurp(&ctx), expected);

    // Fixed-stride reads are wrong on this layout; the walk is not.
    let mut strided = vec![0u8; 48];
    assert_eq!(read_fixed(&ctx, 48, &mut strided).expect("read"), 48);
    assert_ne!(strided, vec![b'b'; 48]);

    let free_before = vol.alloc.free_count();
    assert_eq!(defragment(&mut ctx).expect("defragment"), 2);
    assert_eq!(layout(&ctx), vec![144]);
    assert_eq!(vol.alloc.free_count(), free_before + 2);
    assert_eq!(slurp(&ctx), expected);

    // Packed layouts are strided again.
    let mut strided = vec![0u8; 48];
    assert_eq!(read_fixed(&ctx, 48, &mut strided).expect("read"), 48);
    assert_eq!(strided, vec![b'b'; 48]);
}

#[test]
fn prepend_insert_keeps_trailing_content() {
    let vol = Volume::new();
    let mut ctx = vol.ctx();

    write(&mut ctx, 0, b"I love to eat chocolate\n").expect("write");
    insert_write(&mut ctx, 0, b"Hello World\n").expect("insert");

    assert_eq!(ctx.meta.size, 36);
    assert_eq!(layout(&ctx), vec![12, 24]);
    assert_eq!(slurp(&ctx), b"Hello World\nI love to eat chocolate\n");
}

#[test]
fn mixed_engines_keep_content_coherent() {
    let vol = Volume::new();
    let mut ctx = vol.ctx();
    let mut model: Vec<u8> = Vec::new();

    write(&mut ctx, 0, &[b'x'; 6000]).expect("write");
    model.extend_from_slice(&[b'x'; 6000]);

    insert_write(&mut ctx, 100, &[b'i'; 300]).expect("insert");
    let tail = model.split_off(100);
    model.extend_from_slice(&[b'i'; 300]);
    model.extend_from_slice(&tail);

    write(&mut ctx, 50, &[b'o'; 500]).expect("write");
    model[50..550].copy_from_slice(&[b'o'; 500]);

    defragment(&mut ctx).expect("defragment");
    truncate(&mut ctx, 5000).expect("truncate");
    model.truncate(5000);

    assert_eq!(ctx.meta.size, 5000);
    assert_eq!(slurp(&ctx), model);
}

#[test]
fn strategy_dispatch_selects_engines() {
    let vol = Volume::new();
    let mut ctx = vol.ctx();

    let overwrite_mode = FileOps::default();
    let insert_mode = FileOps {
        read: ReadStrategy::TrackedSizes,
        write: WriteStrategy::Insert,
    };

    overwrite_mode.write(&mut ctx, 0, b"abcdef").expect("write");
    insert_mode.write(&mut ctx, 3, b"XYZ").expect("insert");
    assert_eq!(ctx.meta.size, 9);

    let mut buf = vec![0u8; 9];
    assert_eq!(insert_mode.read(&ctx, 0, &mut buf).expect("read"), 9);
    assert_eq!(&buf, b"abcXYZdef");

    // The insert split the first block; overwrite mode still works on it.
    overwrite_mode.write(&mut ctx, 0, b"ABC").expect("write");
    let mut buf = vec![0u8; 9];
    assert_eq!(insert_mode.read(&ctx, 0, &mut buf).expect("read"), 9);
    assert_eq!(&buf, b"ABCXYZdef");
}

#[test]
fn volume_exhaustion_reports_no_space() {
    let dev = MemBlockDevice::new(8);
    let alloc = BitmapAllocator::new(6, 2).expect("allocator");
    let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));

    write(&mut ctx, 0, &vec![b'a'; 3 * 4096]).expect("exact fit");
    assert_eq!(alloc.free_count(), 1);

    let pos = ctx.meta.size;
    let err = write(&mut ctx, pos, &vec![b'b'; 2 * 4096]).expect_err("over");
    assert!(matches!(err, QfsError::NoSpace));
    assert_eq!(ctx.meta.size, 3 * 4096);

    // Defragmentation cannot help a file of full blocks, but truncation can.
    truncate(&mut ctx, 4096).expect("truncate");
    assert_eq!(alloc.free_count(), 3);
    let pos = ctx.meta.size;
    write(&mut ctx, pos, &vec![b'b'; 2 * 4096]).expect("fits now");
}

// ── Fault injection ─────────────────────────────────────────────────────────

/// Device wrapper that fails I/O on chosen blocks.
struct FaultyDevice {
    inner: MemBlockDevice,
    fail_read: Option<BlockId>,
    fail_write: Option<BlockId>,
}

impl FaultyDevice {
    fn new(inner: MemBlockDevice) -> Self {
        Self {
            inner,
            fail_read: None,
            fail_write: None,
        }
    }
}

impl BlockDevice for FaultyDevice {
    fn read_block(&self, block: BlockId) -> Result<BlockBuf> {
        if self.fail_read == Some(block) {
            return Err(QfsError::Io(std::io::Error::other("injected read fault")));
        }
        self.inner.read_block(block)
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if self.fail_write == Some(block) {
            return Err(QfsError::Io(std::io::Error::other("injected write fault")));
        }
        self.inner.write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[test]
fn read_returns_partial_count_on_device_fault() {
    let mut dev = FaultyDevice::new(MemBlockDevice::new(64));
    let alloc = BitmapAllocator::new(64, 2).expect("allocator");

    // Two insert-mode appends land in blocks 2 and 3, in allocation order.
    let meta = {
        let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));
        insert_write(&mut ctx, 0, &[b'a'; 48]).expect("insert");
        insert_write(&mut ctx, 48, &[b'b'; 48]).expect("insert");
        assert_eq!(layout(&ctx), vec![48, 48]);
        ctx.meta
    };

    dev.fail_read = Some(BlockId(3));
    let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));
    ctx.meta = meta;

    let mut buf = vec![0u8; 96];
    // The first block's bytes transfer, then the fault stops the walk.
    assert_eq!(read(&ctx, 0, &mut buf).expect("short read"), 48);
    assert_eq!(&buf[..48], &[b'a'; 48]);

    // Nothing transferred before the fault: the error surfaces.
    let err = read(&ctx, 48, &mut buf).expect_err("fault at first block");
    assert!(matches!(err, QfsError::Io(_)));
}

#[test]
fn defragment_persists_consistent_index_on_device_fault() {
    let mut dev = FaultyDevice::new(MemBlockDevice::new(64));
    let alloc = BitmapAllocator::new(64, 2).expect("allocator");

    // Three insert-mode appends land in blocks 2, 3, and 4. Packing pulls
    // all of block 3 into block 2 (releasing block 3), then 96 bytes of
    // block 4; the fault hits when block 4's remainder is shifted left.
    let meta = {
        let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));
        insert_write(&mut ctx, 0, &[b'a'; 2000]).expect("insert");
        insert_write(&mut ctx, 2000, &[b'b'; 2000]).expect("insert");
        insert_write(&mut ctx, 4000, &[b'c'; 100]).expect("insert");
        assert_eq!(layout(&ctx), vec![2000, 2000, 100]);
        ctx.meta
    };
    let free_before = alloc.free_count();

    dev.fail_write = Some(BlockId(4));
    let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));
    ctx.meta = meta;
    let err = defragment(&mut ctx).expect_err("fault mid-pass");
    assert!(matches!(err, QfsError::Io(_)));

    // The drained block was released, and the flushed index describes
    // exactly the bytes on disk: the interrupted step left no trace.
    assert_eq!(alloc.free_count(), free_before + 1);
    assert_eq!(layout(&ctx), vec![4000, 0, 100]);
    assert_eq!(ctx.meta.size, 4100);

    let mut buf = vec![0u8; 4100];
    assert_eq!(read(&ctx, 0, &mut buf).expect("read"), 4100);
    assert_eq!(&buf[..2000], &[b'a'; 2000]);
    assert_eq!(&buf[2000..4000], &[b'b'; 2000]);
    assert_eq!(&buf[4000..], &[b'c'; 100]);

    // With the fault cleared, a second run finishes the job.
    dev.fail_write = None;
    let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));
    ctx.meta = meta;
    assert_eq!(defragment(&mut ctx).expect("defragment"), 0);
    assert_eq!(layout(&ctx), vec![4096, 4]);
    let mut buf = vec![0u8; 4100];
    assert_eq!(read(&ctx, 0, &mut buf).expect("read"), 4100);
    assert_eq!(&buf[4000..], &[b'c'; 100]);
}

#[test]
fn write_returns_partial_count_on_device_fault() {
    let mut dev = FaultyDevice::new(MemBlockDevice::new(64));
    let alloc = BitmapAllocator::new(64, 2).expect("allocator");

    let meta = {
        let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));
        write(&mut ctx, 0, &[b'a'; 48]).expect("write");
        ctx.meta
    };

    // The seed took block 2; the next allocation will take block 3.
    dev.fail_write = Some(BlockId(3));
    let mut ctx = FileContext::new(&dev, &alloc, BlockId(1));
    ctx.meta = meta;

    // 48 bytes overwrite, 4048 grow into padding, then the fresh block
    // faults: the transferred prefix is reported, not the error.
    let payload = vec![b'p'; 5000];
    assert_eq!(write(&mut ctx, 0, &payload).expect("partial"), 4096);
    assert_eq!(ctx.meta.size, 4096);
    assert_eq!(layout(&ctx), vec![4096]);
    // The faulted block was released again.
    assert_eq!(alloc.free_count(), 61);

    let mut buf = vec![0u8; 4096];
    assert_eq!(read(&ctx, 0, &mut buf).expect("read"), 4096);
    assert_eq!(&buf, &payload[..4096]);
}
