//! Block device support.
//!
//! The [`BlockDevice`] trait is the seam between the SD SPI adapter and the
//! validation sequencer: anything that can report its block count and read
//! single 512-byte blocks can be validated and mounted. Only devices up to
//! 2 TiB are supported.

mod block;
pub use block::*;

use crate::report::CardIdentity;

/// Errors from bringing a device up.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The card responded, but initialization polling exceeded its retry
    /// bound before the card became ready.
    Timeout,
    /// The bus produced no recognisable response pattern at all.
    NoCard,
}

/// Errors from reading a block.
///
/// Reads are deliberately not retried at this layer. Retry policy belongs
/// to the validation sequencer, so that callers can tell one bad read apart
/// from a systemically broken data path.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The card returned an error token, or the transfer failed.
    IoError,
}

/// A device addressed in 512-byte blocks by integer index.
pub trait BlockDevice {
    /// Bring the device to a readable state and report its identity.
    ///
    /// This is a full reset: a previously poisoned device is rebuilt from
    /// scratch, never resumed. The identity is re-read on every call.
    fn initialize(&mut self) -> Result<CardIdentity, InitError>;

    /// Read a single block into `block`.
    fn read_block(&mut self, block_idx: BlockIdx, block: &mut Block) -> Result<(), ReadError>;

    /// Record that a caller-imposed deadline expired while this device held
    /// the bus. A poisoned device must refuse reads until the next
    /// [`initialize`](BlockDevice::initialize).
    fn mark_poisoned(&mut self) {}
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    fn initialize(&mut self) -> Result<CardIdentity, InitError> {
        (*self).initialize()
    }

    fn read_block(&mut self, block_idx: BlockIdx, block: &mut Block) -> Result<(), ReadError> {
        (*self).read_block(block_idx, block)
    }

    fn mark_poisoned(&mut self) {
        (*self).mark_poisoned()
    }
}

/// A [`BlockDevice`] backed by a byte slice. Used for testing against disk
/// images without hardware.
#[derive(Debug)]
pub struct MemoryBlockDevice<'a> {
    memory: &'a [u8],
}

impl<'a> MemoryBlockDevice<'a> {
    pub fn new(memory: &'a [u8]) -> Self {
        Self { memory }
    }

    fn block_count(&self) -> BlockCount {
        BlockCount((self.memory.len() / Block::LEN) as u32)
    }
}

impl<'a> BlockDevice for MemoryBlockDevice<'a> {
    fn initialize(&mut self) -> Result<CardIdentity, InitError> {
        Ok(CardIdentity {
            block_count: self.block_count(),
        })
    }

    fn read_block(&mut self, block_idx: BlockIdx, block: &mut Block) -> Result<(), ReadError> {
        let start = block_idx.0 as usize * Block::LEN;
        let end = start + Block::LEN;
        if end > self.memory.len() {
            return Err(ReadError::IoError);
        }
        block.contents.copy_from_slice(&self.memory[start..end]);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_device_reads_in_place() {
        let mut data = [0u8; Block::LEN * 2];
        data[Block::LEN] = 0xA5;
        let mut device = MemoryBlockDevice::new(&data);

        let identity = device.initialize().unwrap();
        assert_eq!(identity.block_count, BlockCount(2));
        assert_eq!(identity.capacity_bytes(), 1024);

        let mut block = Block::new();
        device.read_block(BlockIdx(1), &mut block).unwrap();
        assert_eq!(block[0], 0xA5);

        assert_eq!(
            device.read_block(BlockIdx(2), &mut block),
            Err(ReadError::IoError)
        );
    }
}
