#![forbid(unsafe_code)]
//! Free-block accounting.
//!
//! Raw bitmap primitives plus the [`Allocator`] capability trait the file
//! engines program against. The engines only ever pre-flight against
//! [`Allocator::free_count`] and then allocate one block at a time, so the
//! trait stays deliberately small.
//!
//! Block id 0 is a reserved sentinel (superblock and root metadata live at
//! the front of the device); the first allocatable bit is 1, which lets the
//! index encoding use 0 to mean "no block".

use parking_lot::Mutex;
use qfs_error::{QfsError, Result};
use qfs_types::BlockId;
use tracing::trace;

// ── Bitmap primitives ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting the scan at `start`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Allocator capability ────────────────────────────────────────────────────

/// Free-block allocation service.
///
/// Implementations must be safe for concurrent use (`&self`); the file
/// engines assume the allocator may be shared with other files and may come
/// back empty even after a successful pre-flight.
pub trait Allocator: Send + Sync {
    /// Allocate one block. `Ok(None)` means the device is out of free blocks.
    fn allocate(&self) -> Result<Option<BlockId>>;

    /// Return a block to the free pool.
    fn release(&self, block: BlockId) -> Result<()>;

    /// Current number of free blocks, used by pre-flight space checks.
    fn free_count(&self) -> u64;
}

#[derive(Debug)]
struct BitmapState {
    /// One bit per block; set == allocated.
    bits: Vec<u8>,
    free: u32,
}

/// Bitmap-backed allocator over a fixed pool of block ids `0..total`.
///
/// Bit 0 is permanently marked allocated so the sentinel id is never handed
/// out. Double release is detected and reported as corruption rather than
/// silently growing the free count.
#[derive(Debug)]
pub struct BitmapAllocator {
    total: u32,
    state: Mutex<BitmapState>,
}

impl BitmapAllocator {
    /// Create an allocator for `total` blocks, with `reserved` leading blocks
    /// (metadata: superblock, bitmaps, inode store) pre-marked allocated.
    /// `reserved` must be at least 1 to keep the sentinel out of the pool.
    pub fn new(total: u32, reserved: u32) -> Result<Self> {
        if reserved == 0 || reserved > total {
            return Err(QfsError::Format(format!(
                "invalid reservation: reserved={reserved} total={total}"
            )));
        }
        let mut bits = vec![0u8; (total as usize).div_ceil(8)];
        for idx in 0..reserved {
            bitmap_set(&mut bits, idx);
        }
        Ok(Self {
            total,
            state: Mutex::new(BitmapState {
                bits,
                free: total - reserved,
            }),
        })
    }

    /// Load an allocator from an on-disk bitmap image.
    pub fn from_bits(total: u32, bits: Vec<u8>) -> Result<Self> {
        if bits.len() < (total as usize).div_ceil(8) {
            return Err(QfsError::Format(format!(
                "bitmap too short: {} bytes for {total} blocks",
                bits.len()
            )));
        }
        if !bitmap_get(&bits, 0) {
            return Err(QfsError::Corruption {
                block: 0,
                detail: "sentinel block marked free in bitmap".into(),
            });
        }
        let free = bitmap_count_free(&bits, total);
        Ok(Self {
            total,
            state: Mutex::new(BitmapState { bits, free }),
        })
    }

    /// Snapshot the raw bitmap, for persisting back to its backing blocks.
    #[must_use]
    pub fn to_bits(&self) -> Vec<u8> {
        self.state.lock().bits.clone()
    }
}

impl Allocator for BitmapAllocator {
    fn allocate(&self) -> Result<Option<BlockId>> {
        let mut state = self.state.lock();
        let Some(idx) = bitmap_find_free(&state.bits, self.total, 1) else {
            return Ok(None);
        };
        bitmap_set(&mut state.bits, idx);
        state.free -= 1;
        trace!(block = idx, free = state.free, "allocated block");
        Ok(Some(BlockId(idx)))
    }

    fn release(&self, block: BlockId) -> Result<()> {
        if block.0 == 0 || block.0 >= self.total {
            return Err(QfsError::Corruption {
                block: block.0,
                detail: "release outside allocatable range".into(),
            });
        }
        let mut state = self.state.lock();
        if !bitmap_get(&state.bits, block.0) {
            return Err(QfsError::Corruption {
                block: block.0,
                detail: "double release: block already free in bitmap".into(),
            });
        }
        bitmap_clear(&mut state.bits, block.0);
        state.free += 1;
        trace!(block = block.0, free = state.free, "released block");
        Ok(())
    }

    fn free_count(&self) -> u64 {
        u64::from(self.state.lock().free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Bitmap tests ────────────────────────────────────────────────────

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert!(bitmap_get(&bm, 7));
        assert_eq!(bm[0], 0x80);

        bitmap_set(&mut bm, 8);
        assert!(bitmap_get(&bm, 8));
        assert_eq!(bm[1], 0x01);
    }

    #[test]
    fn bitmap_count_free_partial_byte() {
        let mut bm = vec![0u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 5);
        bitmap_set(&mut bm, 12);
        assert_eq!(bitmap_count_free(&bm, 16), 13);
        // Only count the first 10 bits.
        assert_eq!(bitmap_count_free(&bm, 10), 8);
    }

    #[test]
    fn bitmap_find_free_skips_allocated() {
        let mut bm = vec![0u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 1);
        assert_eq!(bitmap_find_free(&bm, 16, 0), Some(2));
        assert_eq!(bitmap_find_free(&bm, 16, 3), Some(3));
    }

    #[test]
    fn bitmap_find_free_exhausted() {
        let bm = vec![0xFFu8; 2];
        assert_eq!(bitmap_find_free(&bm, 16, 0), None);
    }

    // ── Allocator tests ─────────────────────────────────────────────────

    #[test]
    fn allocator_never_hands_out_sentinel() {
        let alloc = BitmapAllocator::new(64, 1).expect("alloc");
        let first = alloc.allocate().expect("allocate").expect("free block");
        assert_eq!(first, BlockId(1));
    }

    #[test]
    fn allocator_respects_reservation() {
        let alloc = BitmapAllocator::new(64, 8).expect("alloc");
        assert_eq!(alloc.free_count(), 56);
        let first = alloc.allocate().expect("allocate").expect("free block");
        assert_eq!(first, BlockId(8));
    }

    #[test]
    fn allocate_release_round_trip() {
        let alloc = BitmapAllocator::new(16, 1).expect("alloc");
        let a = alloc.allocate().expect("allocate").expect("block");
        let b = alloc.allocate().expect("allocate").expect("block");
        assert_ne!(a, b);
        assert_eq!(alloc.free_count(), 13);

        alloc.release(a).expect("release");
        assert_eq!(alloc.free_count(), 14);
        // Freed block is reused.
        let c = alloc.allocate().expect("allocate").expect("block");
        assert_eq!(c, a);
    }

    #[test]
    fn exhaustion_returns_none() {
        let alloc = BitmapAllocator::new(4, 1).expect("alloc");
        for _ in 0..3 {
            assert!(alloc.allocate().expect("allocate").is_some());
        }
        assert!(alloc.allocate().expect("allocate").is_none());
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn double_release_is_corruption() {
        let alloc = BitmapAllocator::new(16, 1).expect("alloc");
        let a = alloc.allocate().expect("allocate").expect("block");
        alloc.release(a).expect("release");
        let err = alloc.release(a).expect_err("double release");
        assert!(matches!(err, QfsError::Corruption { .. }));
    }

    #[test]
    fn release_sentinel_is_corruption() {
        let alloc = BitmapAllocator::new(16, 1).expect("alloc");
        assert!(alloc.release(BlockId(0)).is_err());
        assert!(alloc.release(BlockId(16)).is_err());
    }

    #[test]
    fn from_bits_round_trip() {
        let alloc = BitmapAllocator::new(32, 2).expect("alloc");
        let a = alloc.allocate().expect("allocate").expect("block");
        let bits = alloc.to_bits();

        let reloaded = BitmapAllocator::from_bits(32, bits).expect("reload");
        assert_eq!(reloaded.free_count(), alloc.free_count());
        // The allocated block stays allocated across reload.
        reloaded.release(a).expect("block survives reload as allocated");
    }

    #[test]
    fn from_bits_rejects_free_sentinel() {
        let bits = vec![0u8; 4];
        assert!(BitmapAllocator::from_bits(32, bits).is_err());
    }
}
