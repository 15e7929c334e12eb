#![forbid(unsafe_code)]
//! Per-file block index: descriptors and the bounded descriptor array.
//!
//! A file's content is a sequence of variable-length chunks, each held in one
//! physical block. A [`BlockDescriptor`] names the block and how many of its
//! bytes are live content (1..=4096); the [`IndexBlock`] is the ordered array
//! of descriptors, itself persisted in a single 4096-byte block.
//!
//! ## On-disk layout (format contract)
//!
//! One descriptor is a little-endian `u32` word:
//!
//! - bits 0..19 — physical block id (0 is the reserved sentinel),
//! - bits 19..31 — `used_size - 1` (so 1..=4096 fits in 12 bits),
//! - bit 31 — occupied flag.
//!
//! An unoccupied slot is the all-zero word. `used_size == 0` is expressed by
//! clearing the occupied flag, never by encoding zero in the size field.
//! The bit layout lives only in [`BlockDescriptor::encode`] and
//! [`BlockDescriptor::decode`]; everything above works with named fields.

mod store;

pub use store::{load_index, store_index};

use qfs_error::{QfsError, Result};
use qfs_types::{
    BlockId, ParseError, read_le_u32, write_le_u32, BLOCK_SIZE, BLOCK_SIZE_U32, DESCRIPTOR_SIZE,
    INDEX_ENTRIES, MAX_BLOCK_ID,
};

const OCCUPIED_BIT: u32 = 1 << 31;
const SIZE_SHIFT: u32 = qfs_types::BLOCK_ID_BITS;
const SIZE_MASK: u32 = 0xFFF;
const BLOCK_MASK: u32 = MAX_BLOCK_ID;

/// One chunk of file content: a physical block and its live byte count.
///
/// Invariant: `used_size() == 0` iff `!is_occupied()`, and `used_size()`
/// never exceeds [`BLOCK_SIZE_U32`]. An unoccupied descriptor carries the
/// sentinel block id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockDescriptor {
    block: BlockId,
    used_size: u32,
}

impl BlockDescriptor {
    /// An unoccupied slot.
    pub const EMPTY: Self = Self {
        block: BlockId::SENTINEL,
        used_size: 0,
    };

    /// Create an occupied descriptor. `used_size` must be 1..=4096 and
    /// `block` must be a valid data block id.
    pub fn new(block: BlockId, used_size: u32) -> Result<Self> {
        if used_size == 0 || used_size > BLOCK_SIZE_U32 {
            return Err(QfsError::SizeOutOfRange {
                size: i64::from(used_size),
            });
        }
        if !block.is_valid_data_block() {
            return Err(QfsError::Corruption {
                block: block.0,
                detail: "descriptor names an invalid data block".into(),
            });
        }
        Ok(Self { block, used_size })
    }

    #[must_use]
    pub fn block(&self) -> BlockId {
        self.block
    }

    #[must_use]
    pub fn used_size(&self) -> u32 {
        self.used_size
    }

    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.used_size > 0
    }

    /// Unused bytes between `used_size` and the end of the block.
    #[must_use]
    pub fn padding(&self) -> u32 {
        if self.is_occupied() {
            BLOCK_SIZE_U32 - self.used_size
        } else {
            0
        }
    }

    /// Set the live byte count. A size of 0 empties the slot; sizes above
    /// 4096 are rejected, never clamped.
    pub fn set_used_size(&mut self, size: u32) -> Result<()> {
        if size > BLOCK_SIZE_U32 {
            return Err(QfsError::SizeOutOfRange {
                size: i64::from(size),
            });
        }
        if size == 0 {
            *self = Self::EMPTY;
        } else {
            self.used_size = size;
        }
        Ok(())
    }

    /// Grow the live byte count. Only valid on occupied descriptors.
    pub fn grow(&mut self, delta: u32) -> Result<()> {
        if !self.is_occupied() {
            return Err(QfsError::SizeOutOfRange {
                size: i64::from(delta),
            });
        }
        let new = self.used_size.checked_add(delta).unwrap_or(u32::MAX);
        if new > BLOCK_SIZE_U32 {
            return Err(QfsError::SizeOutOfRange {
                size: i64::from(self.used_size) + i64::from(delta),
            });
        }
        self.used_size = new;
        Ok(())
    }

    /// Shrink the live byte count. Shrinking to exactly 0 empties the slot.
    pub fn shrink(&mut self, delta: u32) -> Result<()> {
        let Some(new) = self.used_size.checked_sub(delta) else {
            return Err(QfsError::SizeOutOfRange {
                size: i64::from(self.used_size) - i64::from(delta),
            });
        };
        self.set_used_size(new)
    }

    /// Pack into the on-disk word.
    #[must_use]
    pub fn encode(&self) -> u32 {
        if !self.is_occupied() {
            return 0;
        }
        OCCUPIED_BIT | ((self.used_size - 1) << SIZE_SHIFT) | (self.block.0 & BLOCK_MASK)
    }

    /// Unpack from the on-disk word.
    pub fn decode(word: u32) -> std::result::Result<Self, ParseError> {
        if word & OCCUPIED_BIT == 0 {
            if word != 0 {
                return Err(ParseError::InvalidField {
                    field: "descriptor",
                    reason: "unoccupied word has stray bits",
                });
            }
            return Ok(Self::EMPTY);
        }
        let block = word & BLOCK_MASK;
        if block == 0 {
            return Err(ParseError::InvalidField {
                field: "descriptor",
                reason: "occupied word names the sentinel block",
            });
        }
        let used_size = ((word >> SIZE_SHIFT) & SIZE_MASK) + 1;
        Ok(Self {
            block: BlockId(block),
            used_size,
        })
    }
}

/// Location of a logical byte offset within the index: the slot holding it
/// and the byte offset inside that slot's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub slot: usize,
    pub offset: u32,
}

/// Ordered, bounded array of block descriptors for one file.
///
/// Holds the live prefix of the on-disk array: every slot up to and including
/// the last occupied one. Interior unoccupied slots (holes) can only appear
/// transiently, during defragmentation; the write paths never create them.
/// Capacity is [`INDEX_ENTRIES`]; overflow is an explicit error, never a
/// silent wrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBlock {
    slots: Vec<BlockDescriptor>,
}

impl IndexBlock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live slots, including interior holes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Free slots remaining before the capacity bound.
    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        INDEX_ENTRIES - self.slots.len()
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&BlockDescriptor> {
        self.slots.get(slot)
    }

    #[must_use]
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut BlockDescriptor> {
        self.slots.get_mut(slot)
    }

    /// Iterate over live slots in logical order.
    pub fn slots(&self) -> impl Iterator<Item = &BlockDescriptor> {
        self.slots.iter()
    }

    /// Number of occupied descriptors (physical data blocks owned).
    #[must_use]
    pub fn occupied_count(&self) -> u32 {
        let count = self.slots.iter().filter(|d| d.is_occupied()).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Total live content bytes across all occupied descriptors.
    #[must_use]
    pub fn total_used(&self) -> u64 {
        self.slots
            .iter()
            .map(|d| u64::from(d.used_size()))
            .sum()
    }

    /// Slot index of the last occupied descriptor, if any.
    #[must_use]
    pub fn last_occupied(&self) -> Option<usize> {
        self.slots.iter().rposition(BlockDescriptor::is_occupied)
    }

    /// First occupied slot at or after `from`.
    #[must_use]
    pub fn next_occupied(&self, from: usize) -> Option<usize> {
        (from..self.slots.len()).find(|&i| self.slots[i].is_occupied())
    }

    /// Map a logical byte offset to its slot and in-block offset.
    ///
    /// This is the single addressing walk shared by the read, write, and
    /// insert engines: accumulate occupied descriptors' used sizes until the
    /// running total passes `offset`. Returns `None` when `offset` is at or
    /// past the end of the content (the append position).
    #[must_use]
    pub fn locate(&self, offset: u64) -> Option<Position> {
        let mut acc = 0u64;
        for (slot, desc) in self.slots.iter().enumerate() {
            let used = u64::from(desc.used_size());
            if used == 0 {
                continue;
            }
            if offset < acc + used {
                // offset - acc < used <= 4096, so the narrowing is lossless.
                #[expect(clippy::cast_possible_truncation)]
                let in_block = (offset - acc) as u32;
                return Some(Position {
                    slot,
                    offset: in_block,
                });
            }
            acc += used;
        }
        None
    }

    /// Append a descriptor after the last slot.
    pub fn push(&mut self, desc: BlockDescriptor) -> Result<()> {
        if self.slots.len() >= INDEX_ENTRIES {
            return Err(QfsError::NoSpace);
        }
        self.slots.push(desc);
        Ok(())
    }

    /// Insert a descriptor at `slot`, shifting later slots right.
    pub fn insert_at(&mut self, slot: usize, desc: BlockDescriptor) -> Result<()> {
        if self.slots.len() >= INDEX_ENTRIES {
            return Err(QfsError::NoSpace);
        }
        if slot > self.slots.len() {
            return Err(QfsError::Format(format!(
                "insert past live range: slot={slot} len={}",
                self.slots.len()
            )));
        }
        self.slots.insert(slot, desc);
        Ok(())
    }

    /// Open `count` empty slots at `slot`, shifting later slots right.
    /// The caller fills the gap before the index is persisted.
    pub fn open_gap(&mut self, slot: usize, count: usize) -> Result<()> {
        if self.slots.len() + count > INDEX_ENTRIES {
            return Err(QfsError::NoSpace);
        }
        if slot > self.slots.len() {
            return Err(QfsError::Format(format!(
                "gap past live range: slot={slot} len={}",
                self.slots.len()
            )));
        }
        self.slots
            .splice(slot..slot, std::iter::repeat_n(BlockDescriptor::EMPTY, count));
        Ok(())
    }

    /// Replace the descriptor at `slot`.
    pub fn set(&mut self, slot: usize, desc: BlockDescriptor) -> Result<()> {
        let entry = self.slots.get_mut(slot).ok_or_else(|| {
            QfsError::Format(format!("slot out of range: {slot}"))
        })?;
        *entry = desc;
        Ok(())
    }

    /// Drop unoccupied slots, preserving the order of occupied ones.
    /// Returns the number of slots removed.
    pub fn compact(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(BlockDescriptor::is_occupied);
        before - self.slots.len()
    }

    /// Drop every slot at or after `slot`.
    pub fn truncate_slots(&mut self, slot: usize) {
        self.slots.truncate(slot);
    }

    /// Serialize to one block of little-endian words; unoccupied and unused
    /// trailing slots encode as zero.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; BLOCK_SIZE];
        for (i, desc) in self.slots.iter().enumerate() {
            // Slots are bounded by INDEX_ENTRIES, so this never fails.
            let _ = write_le_u32(&mut bytes, i * DESCRIPTOR_SIZE, desc.encode());
        }
        bytes
    }

    /// Deserialize from one block. Trailing all-zero words are dropped;
    /// interior zero words are kept as holes.
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        if bytes.len() != BLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        let mut slots = Vec::new();
        let mut live_len = 0usize;
        for i in 0..INDEX_ENTRIES {
            let word = read_le_u32(bytes, i * DESCRIPTOR_SIZE)?;
            let desc = BlockDescriptor::decode(word)?;
            slots.push(desc);
            if desc.is_occupied() {
                live_len = i + 1;
            }
        }
        slots.truncate(live_len);
        Ok(Self { slots })
    }
}
