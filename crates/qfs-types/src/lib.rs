#![forbid(unsafe_code)]
//! Core types and geometry constants shared across QuiltFS crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed block size in bytes. Every data block and the index block itself
/// occupy exactly one block of this size on the device.
pub const BLOCK_SIZE: usize = 4096;

/// `BLOCK_SIZE` as `u32`, for descriptor size arithmetic.
pub const BLOCK_SIZE_U32: u32 = 4096;

/// `BLOCK_SIZE` as `u64`, for byte-offset arithmetic.
pub const BLOCK_SIZE_U64: u64 = 4096;

/// Number of descriptor slots in a file's index block (one 4-byte word per
/// descriptor, one block's worth of words).
pub const INDEX_ENTRIES: usize = BLOCK_SIZE / DESCRIPTOR_SIZE;

/// On-disk size of one packed block descriptor.
pub const DESCRIPTOR_SIZE: usize = 4;

/// Maximum addressable file size: every index slot full.
pub const MAX_FILE_SIZE: u64 = INDEX_ENTRIES as u64 * BLOCK_SIZE_U64;

/// Number of bits used for the physical block id in a packed descriptor.
pub const BLOCK_ID_BITS: u32 = 19;

/// Largest physical block id representable in a descriptor.
pub const MAX_BLOCK_ID: u32 = (1 << BLOCK_ID_BITS) - 1;

/// Physical block id.
///
/// Id 0 is a reserved sentinel (the superblock and root metadata occupy the
/// start of the device), so 0 never names an allocatable data block.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The reserved sentinel id.
    pub const SENTINEL: Self = Self(0);

    /// Whether this id can name an occupied descriptor's data block.
    #[must_use]
    pub fn is_valid_data_block(self) -> bool {
        self.0 != 0 && self.0 <= MAX_BLOCK_ID
    }

    /// Byte offset of this block on a byte-addressed device.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * BLOCK_SIZE_U64
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors produced while decoding on-disk bytes into typed values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Borrow `len` bytes at `offset`, with explicit bounds errors.
#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    if offset.checked_add(4).is_none_or(|end| end > data.len()) {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u64`. Infallible on every supported platform but
/// kept explicit so call sites never use `as`.
pub fn usize_to_u64(value: usize, field: &'static str) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Number of whole blocks needed to hold `bytes` bytes.
#[must_use]
pub fn blocks_for_bytes(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE_U64)
}
