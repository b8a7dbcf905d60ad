use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};

use super::{CmdError, Delay};
use crate::sdmmc::proto::{crc16, crc7, DATA_START_BLOCK};

/// A guard ensuring that communication only occurs while CS is asserted
/// low, and that the bus is deselected again even on an error path.
pub(crate) struct BusGuard<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: &'spi mut SPI,
    cs: &'cs mut CS,
    check_crc: bool,
}

impl<'spi, 'cs, SPI, CS> Drop for BusGuard<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn drop(&mut self) {
        self.cs_high().ok();
    }
}

impl<'spi, 'cs, SPI, CS> BusGuard<'spi, 'cs, SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    pub fn new(spi: &'spi mut SPI, cs: &'cs mut CS, check_crc: bool) -> Result<Self, CmdError> {
        let mut me = Self { spi, cs, check_crc };
        me.cs_low()?;
        Ok(me)
    }

    fn cs_high(&mut self) -> Result<(), CmdError> {
        self.cs.set_high().map_err(|_| CmdError::Gpio)
    }

    fn cs_low(&mut self) -> Result<(), CmdError> {
        self.cs.set_low().map_err(|_| CmdError::Gpio)
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, CmdError> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| CmdError::Transport)
    }

    /// Receive a byte from the card by clocking out an 0xFF byte.
    pub fn receive(&mut self) -> Result<u8, CmdError> {
        self.transfer(0xFF)
    }

    /// Send a byte to the card.
    pub fn send(&mut self, out: u8) -> Result<(), CmdError> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Spin until the card returns 0xFF, or we spin too many times and
    /// time out.
    pub fn wait_not_busy(&mut self) -> Result<(), CmdError> {
        let mut delay = Delay::new();
        loop {
            let s = self.receive()?;
            if s == 0xFF {
                break;
            }
            delay.delay(CmdError::BusyTimeout)?;
        }
        Ok(())
    }

    /// Perform a command and return its R1 status byte.
    pub fn card_command(&mut self, command: u8, arg: u32) -> Result<u8, CmdError> {
        self.wait_not_busy()?;
        let mut buf = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        buf[5] = crc7(&buf[0..5]);

        for b in buf.iter() {
            self.send(*b)?;
        }

        for _ in 0..512 {
            let result = self.receive()?;
            if (result & 0x80) == 0 {
                return Ok(result);
            }
        }

        Err(CmdError::CommandTimeout(command))
    }

    /// Perform an application-specific command.
    pub fn card_acmd(&mut self, command: u8, arg: u32) -> Result<u8, CmdError> {
        self.card_command(crate::sdmmc::proto::CMD55, 0)?;
        self.card_command(command, arg)
    }

    /// Read a data token and its payload from the card. Always fills the
    /// given buffer, so make sure it's the right size.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), CmdError> {
        // Get first non-FF byte.
        let mut delay = Delay::new();
        let status = loop {
            let s = self.receive()?;
            if s != 0xFF {
                break s;
            }
            delay.delay(CmdError::ReadTimeout)?;
        };
        if status != DATA_START_BLOCK {
            return Err(CmdError::BadDataToken(status));
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }

        let mut crc = u16::from(self.receive()?);
        crc <<= 8;
        crc |= u16::from(self.receive()?);

        // Cards that refused CMD59 clock out junk here; skip the compare.
        if self.check_crc {
            let calc_crc = crc16(buffer);
            if crc != calc_crc {
                return Err(CmdError::Crc {
                    received: crc,
                    calculated: calc_crc,
                });
            }
        }

        Ok(())
    }
}
