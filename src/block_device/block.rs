use core::ops::{Deref, DerefMut};

/// A single 512-byte sector, used as the unit of transfer everywhere.
#[derive(Clone)]
pub struct Block {
    /// The contents of this block.
    pub contents: [u8; Block::LEN],
}

impl Block {
    /// The length of a block in bytes. SPI-mode SD cards always transfer
    /// 512-byte sectors regardless of card capacity class.
    pub const LEN: usize = 512;

    /// Create a new, zeroed block.
    pub fn new() -> Block {
        Block {
            contents: [0u8; Self::LEN],
        }
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for Block {
    type Target = [u8; Block::LEN];

    fn deref(&self) -> &Self::Target {
        &self.contents
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.contents
    }
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Block(..)")
    }
}

/// The zero-indexed position of a block on a device.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockIdx(pub u32);

/// A number of blocks.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockCount(pub u32);

impl BlockCount {
    /// The total number of bytes these blocks hold.
    pub fn bytes(self) -> u64 {
        u64::from(self.0) * Block::LEN as u64
    }
}
