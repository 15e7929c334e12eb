#![forbid(unsafe_code)]
//! Error types for QuiltFS.
//!
//! One user-facing error type, [`QfsError`], returned by every public
//! operation. Parse-layer errors (`ParseError` in `qfs-types`) are converted
//! into `QfsError` at crate boundaries; this crate stays independent of
//! `qfs-types` to avoid cyclic dependencies.
//!
//! Partial success is NOT an error: short reads and partial writes report
//! how many bytes actually moved, following the platform read()/write()
//! convention.
//!
//! ## errno mapping
//!
//! Every variant maps to exactly one POSIX errno via [`QfsError::to_errno`].
//! The match is exhaustive, so adding a variant without assigning an errno is
//! a compile error.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `NoSpace` | `ENOSPC` |
//! | `AllocFailed` | `ENOSPC` |
//! | `SizeOutOfRange` | `EINVAL` |
//! | `Format` | `EINVAL` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all QuiltFS operations.
#[derive(Debug, Error)]
pub enum QfsError {
    /// Underlying block storage read/write failed. Not retried internally;
    /// bytes already durably written before the failure are still reported
    /// in the caller's return count.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid on-disk state detected at a known block (bad descriptor word,
    /// double-free in the allocator bitmap).
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// Insufficient free blocks, or the operation would exceed the maximum
    /// file size or the index block's descriptor capacity. Guaranteed to be
    /// raised by the pre-flight check, before any mutation.
    #[error("no space left on device")]
    NoSpace,

    /// The allocator came back empty after the pre-flight check said space
    /// existed (lost a race with allocation elsewhere). Same errno as
    /// `NoSpace`, kept distinct for diagnostics.
    #[error("block allocation failed after pre-flight check")]
    AllocFailed,

    /// Descriptor size arithmetic left the 0..=4096 range. Indicates a logic
    /// bug in an engine, not a normal runtime condition.
    #[error("block used size out of range: {size}")]
    SizeOutOfRange { size: i64 },

    /// Malformed parameter or on-disk structure.
    #[error("invalid format: {0}")]
    Format(String),

    /// The backing image was opened read-only and a write was attempted.
    #[error("read-only image")]
    ReadOnly,
}

impl QfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::NoSpace | Self::AllocFailed => libc::ENOSPC,
            Self::SizeOutOfRange { .. } | Self::Format(_) => libc::EINVAL,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `QfsError`.
pub type Result<T> = std::result::Result<T, QfsError>;
