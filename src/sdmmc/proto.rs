//! SD card SPI-mode protocol pieces: command numbers, response flags,
//! tokens, frame CRCs and the Card Specific Data register.

use bitflags::bitflags;

/// GO_IDLE_STATE - init card in SPI mode if CS asserted low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data register
pub const CMD9: u8 = 0x09;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_SEND_OP_COMD - send host capacity support; begin initialization
pub const ACMD41: u8 = 0x29;

bitflags! {
    /// The R1 status byte every command answers with. A response of all
    /// zeroes means ready; bit 7 is always clear in a valid response.
    pub struct R1Status: u8 {
        const IDLE_STATE = 0x01;
        const ERASE_RESET = 0x02;
        const ILLEGAL_COMMAND = 0x04;
        const COM_CRC_ERROR = 0x08;
        const ERASE_SEQUENCE_ERROR = 0x10;
        const ADDRESS_ERROR = 0x20;
        const PARAMETER_ERROR = 0x40;
    }
}

impl R1Status {
    /// Every status bit clear: initialization has completed.
    pub const READY: R1Status = R1Status::empty();
}

/// Token marking the start of a data block on the bus.
pub const DATA_START_BLOCK: u8 = 0xFE;

/// CRC for the first five bytes of a command frame, with the end bit set.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut byte in data.iter().cloned() {
        for _ in 0..8 {
            crc <<= 1;
            if ((byte & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            byte <<= 1;
        }
    }
    (crc << 1) | 1
}

/// CRC-CCITT over a data block, as appended by the card after every
/// data token payload.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Card Specific Data register, version 1 (standard capacity cards).
pub struct CsdV1 {
    /// The 16 bytes of the CSD register as clocked off the bus.
    pub data: [u8; 16],
}

impl CsdV1 {
    pub fn new() -> CsdV1 {
        CsdV1 { data: [0u8; 16] }
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);

    /// The capacity this card reports, in 512-byte blocks.
    pub fn card_capacity_blocks(&self) -> u32 {
        let multiplier = 1u32 << (u32::from(self.device_size_multiplier()) + 2);
        let block_length = 1u32 << self.read_block_length();
        (self.device_size() + 1) * multiplier * (block_length / 512)
    }
}

/// Card Specific Data register, version 2 (high and extended capacity).
pub struct CsdV2 {
    /// The 16 bytes of the CSD register as clocked off the bus.
    pub data: [u8; 16],
}

impl CsdV2 {
    pub fn new() -> CsdV2 {
        CsdV2 { data: [0u8; 16] }
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);

    /// The capacity this card reports, in 512-byte blocks.
    pub fn card_capacity_blocks(&self) -> u32 {
        (self.device_size() + 1) * 1024
    }
}

/// The CSD register of whichever version the card speaks.
pub enum Csd {
    V1(CsdV1),
    V2(CsdV2),
}

impl Csd {
    /// The capacity this card reports, in 512-byte blocks.
    pub fn card_capacity_blocks(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn crc7_of_cmd0_frame() {
        assert_eq!(crc7(&hex!("40 00 00 00 00")), 0x95);
    }

    #[test]
    fn crc7_of_cmd8_frame() {
        assert_eq!(crc7(&hex!("48 00 00 01 AA")), 0x87);
    }

    #[test]
    fn crc16_of_all_ones_block() {
        assert_eq!(crc16(&[0xFF; 512]), 0x7FA1);
    }

    #[test]
    fn csd_v2_device_size_spans_three_bytes() {
        let mut csd = CsdV2::new();
        csd.data[7] = 0x00;
        csd.data[8] = 0x12;
        csd.data[9] = 0x34;
        assert_eq!(csd.device_size(), 0x1234);
        assert_eq!(csd.card_capacity_blocks(), (0x1234 + 1) * 1024);
    }

    #[test]
    fn csd_v1_capacity_uses_size_multiplier() {
        let mut csd = CsdV1::new();
        // READ_BL_LEN = 9 (512-byte blocks)
        csd.data[5] = 0x09;
        // C_SIZE = 0b01_11111111_10 = 2046
        csd.data[6] = 0x01;
        csd.data[7] = 0xFF;
        csd.data[8] = 0x80;
        // C_SIZE_MULT = 0b11_1 = 7
        csd.data[9] = 0x03;
        csd.data[10] = 0x80;
        assert_eq!(csd.device_size(), 2046);
        assert_eq!(csd.device_size_multiplier(), 7);
        assert_eq!(csd.card_capacity_blocks(), 2047 * 512);
    }
}
