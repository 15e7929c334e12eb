#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed byte
//! device using pread/pwrite-style I/O, an adapter turning any byte device
//! into a block device, and an in-memory block device for tests and tooling.

use parking_lot::Mutex;
use qfs_error::{QfsError, Result};
use qfs_types::{BlockId, BLOCK_SIZE};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// A zeroed buffer of one block.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: vec![0u8; BLOCK_SIZE],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| QfsError::Format("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| QfsError::Format("read range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(QfsError::Format(format!(
                "read out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(QfsError::ReadOnly);
        }
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| QfsError::Format("write length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| QfsError::Format("write range overflows u64".to_owned()))?;
        if end > self.len {
            return Err(QfsError::Format(format!(
                "write out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by id.
    fn read_block(&self, block: BlockId) -> Result<BlockBuf>;

    /// Write a block by id. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing any [`ByteDevice`] as a [`BlockDevice`] with 4096-byte
/// blocks.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D) -> Result<Self> {
        let len = inner.len_bytes();
        let block_size = qfs_types::BLOCK_SIZE_U64;
        let remainder = len % block_size;
        if remainder != 0 {
            return Err(QfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        let block_count = len / block_size;
        Ok(Self { inner, block_count })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockId) -> Result<BlockBuf> {
        if u64::from(block.0) >= self.block_count {
            return Err(QfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let mut buf = vec![0u8; BLOCK_SIZE];
        self.inner.read_exact_at(block.byte_offset(), &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(QfsError::Format(format!(
                "write_block data size mismatch: got={} expected={BLOCK_SIZE}",
                data.len()
            )));
        }
        if u64::from(block.0) >= self.block_count {
            return Err(QfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        self.inner.write_all_at(block.byte_offset(), data)
    }

    fn block_size(&self) -> u32 {
        qfs_types::BLOCK_SIZE_U32
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// In-memory block device.
///
/// Unwritten blocks read back as zeroes, matching a freshly zeroed image.
/// Thread-safe; used by tests across the workspace and by tooling that wants
/// a scratch volume.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_count: u64,
    blocks: Mutex<HashMap<u32, Vec<u8>>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        Self {
            block_count,
            blocks: Mutex::new(HashMap::new()),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockId) -> Result<BlockBuf> {
        if u64::from(block.0) >= self.block_count {
            return Err(QfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        let blocks = self.blocks.lock();
        match blocks.get(&block.0) {
            Some(data) => Ok(BlockBuf::new(data.clone())),
            None => Ok(BlockBuf::zeroed()),
        }
    }

    fn write_block(&self, block: BlockId, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(QfsError::Format(format!(
                "write_block data size mismatch: got={} expected={BLOCK_SIZE}",
                data.len()
            )));
        }
        if u64::from(block.0) >= self.block_count {
            return Err(QfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.blocks.lock().insert(block.0, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        qfs_types::BLOCK_SIZE_U32
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
