//! Master Boot Record interpretation.
//!
//! The bring-up core consumes the MBR read-only and only cares about two
//! things: the boot signature at offset 510 (is the data path returning a
//! sane block 0 at all?) and the partition-type byte of the first entry
//! (what the card claims to be formatted as). Everything else in the
//! partition table belongs to the filesystem layer.

use core::convert::TryInto;

use crate::block_device::Block;

/// The partition-type byte of the first partition entry, interpreted.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionKind {
    /// FAT32 with CHS/LBA addressing (0x0B). What the official SD-Card
    /// formatter and macOS Disk Utility tend to write.
    Fat32,
    /// FAT32 with LBA addressing (0x0C).
    Fat32Lba,
    /// Anything else, carrying the raw type byte.
    Unknown(u8),
}

impl PartitionKind {
    const FAT32: u8 = 0x0B;
    const FAT32_LBA: u8 = 0x0C;

    pub fn from_u8(value: u8) -> Self {
        match value {
            Self::FAT32 => Self::Fat32,
            Self::FAT32_LBA => Self::Fat32Lba,
            _ => Self::Unknown(value),
        }
    }

    /// Whether this is a partition type the usual FAT filesystem layers
    /// will accept without fuss.
    pub fn is_fat32(&self) -> bool {
        matches!(self, Self::Fat32 | Self::Fat32Lba)
    }
}

/// What the validation sequencer extracts from block 0.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MbrSummary {
    /// The two signature bytes observed at offset 510, whatever they were.
    pub signature: [u8; 2],
    /// Whether the signature was the required `0x55 0xAA`.
    pub signature_valid: bool,
    /// The interpreted partition-type byte of the first entry.
    pub partition_type: PartitionKind,
}

pub struct Mbr;

impl Mbr {
    const FOOTER_START: usize = 510;
    const FOOTER_VALUE: u16 = 0xAA55;
    const PARTITION1_START: usize = 446;
    const PARTITION_TYPE_IDX: usize = 4;

    /// Summarize a block assumed to hold the MBR.
    ///
    /// Never fails: an invalid signature is an observation to report, not
    /// an error to propagate.
    pub fn summarize(block: &Block) -> MbrSummary {
        let signature: [u8; 2] = block[Self::FOOTER_START..Self::FOOTER_START + 2]
            .try_into()
            .expect("Infallible");
        let footer = u16::from_le_bytes(signature);

        let type_byte = block[Self::PARTITION1_START + Self::PARTITION_TYPE_IDX];

        MbrSummary {
            signature,
            signature_valid: footer == Self::FOOTER_VALUE,
            partition_type: PartitionKind::from_u8(type_byte),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    fn mbr_block(type_byte: u8, signature: [u8; 2]) -> Block {
        let mut block = Block::new();
        block[446 + 4] = type_byte;
        block[510..512].copy_from_slice(&signature);
        block
    }

    #[test]
    fn valid_signature_and_fat32_lba() {
        let summary = Mbr::summarize(&mbr_block(0x0C, hex!("55 AA")));
        assert_eq!(
            summary,
            MbrSummary {
                signature: [0x55, 0xAA],
                signature_valid: true,
                partition_type: PartitionKind::Fat32Lba,
            }
        );
        assert!(summary.partition_type.is_fat32());
    }

    #[test]
    fn valid_signature_and_fat32_chs() {
        let summary = Mbr::summarize(&mbr_block(0x0B, hex!("55 AA")));
        assert_eq!(summary.partition_type, PartitionKind::Fat32);
    }

    #[test]
    fn invalid_signature_is_reported_not_rejected() {
        let summary = Mbr::summarize(&mbr_block(0x0C, hex!("00 00")));
        assert!(!summary.signature_valid);
        assert_eq!(summary.signature, [0x00, 0x00]);
    }

    #[test]
    fn unknown_partition_type_carries_raw_byte() {
        let summary = Mbr::summarize(&mbr_block(0x83, hex!("55 AA")));
        assert_eq!(summary.partition_type, PartitionKind::Unknown(0x83));
        assert!(!summary.partition_type.is_fat32());
    }
}
