//! Index block persistence.
//!
//! One load/store pair over a [`BlockDevice`], so the engines can treat the
//! index as an in-memory value for the duration of one operation. Decode
//! failures surface as corruption at the index block's id.

use crate::IndexBlock;
use qfs_block::BlockDevice;
use qfs_error::{QfsError, Result};
use qfs_types::BlockId;

/// Load a file's index block from the device.
pub fn load_index(dev: &dyn BlockDevice, index_block: BlockId) -> Result<IndexBlock> {
    let buf = dev.read_block(index_block)?;
    IndexBlock::from_bytes(buf.as_slice()).map_err(|e| QfsError::Corruption {
        block: index_block.0,
        detail: e.to_string(),
    })
}

/// Persist a file's index block back to the device.
pub fn store_index(dev: &dyn BlockDevice, index_block: BlockId, index: &IndexBlock) -> Result<()> {
    dev.write_block(index_block, &index.to_bytes())
}
