//! The block device adapter: SD/MMC protocol over a generic SPI interface.
//!
//! This is optimised for readability and debugability, not performance.
//! Retry policy deliberately lives a layer up, in the validation
//! sequencer; the adapter classifies and reports, it never papers over.

mod busy;
use busy::BusGuard;

pub mod proto;
use proto::{Csd, CsdV1, CsdV2, R1Status, ACMD41, CMD0, CMD17, CMD58, CMD59, CMD8, CMD9};

use crate::block_device::{Block, BlockCount, BlockDevice, BlockIdx, InitError, ReadError};
use crate::report::CardIdentity;

use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

const DEFAULT_DELAY_COUNT: u32 = 32_000;

/// How often we retry the idle command before concluding nothing is
/// listening on the bus.
const ENTER_SPI_MODE_ATTEMPTS: i32 = 32;

/// Exclusive owner of the SPI bus and chip-select pin for the lifetime of
/// a mount session.
///
/// There is exactly one logical owner of the bus/CS pair at a time, by
/// construction: the handle is moved into an [`SdSpiDevice`] and the same
/// device is threaded through validation and mounting. Nothing in this
/// crate re-acquires the bus behind the caller's back, which removes the
/// "resource already claimed" failure class entirely.
pub struct HardwareHandle<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    spi: SPI,
    cs: CS,
    poisoned: bool,
}

impl<SPI, CS> HardwareHandle<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Take ownership of a raw SPI interface and its chip-select pin.
    ///
    /// Chip select must be separate from the SPI peripheral so we can
    /// clock out bytes without CS asserted, which is what puts the card
    /// into SPI mode.
    pub fn new(spi: SPI, cs: CS) -> Self {
        HardwareHandle {
            spi,
            cs,
            poisoned: false,
        }
    }

    /// Whether a deadline expired while this handle held the bus.
    ///
    /// A poisoned handle must be rebuilt by a full reset (the next
    /// [`BlockDevice::initialize`]), never resumed: there is no way to
    /// abort an SPI exchange mid-transfer, so the card's internal state
    /// after a blown budget is unknowable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Give the SPI interface and chip-select pin back, e.g. to tear the
    /// bus down and rebuild it from scratch.
    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }
}

/// The possible low-level failures on the bus.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub(crate) enum CmdError {
    /// The SPI peripheral itself failed.
    Transport,
    /// The chip-select pin could not be driven.
    Gpio,
    /// The card never exited its busy state.
    BusyTimeout,
    /// No response to this command within the polling bound.
    CommandTimeout(u8),
    /// No data token arrived for a read.
    ReadTimeout,
    /// Something other than a data token arrived for a read.
    BadDataToken(u8),
    /// An unexpected R1 status for this command.
    BadResponse(u8),
    /// The idle command was never acknowledged at all.
    NoResponse,
    /// A CRC mismatch (card gave us, we calculated).
    Crc { received: u16, calculated: u16 },
}

fn init_error(e: CmdError) -> InitError {
    match e {
        CmdError::Transport | CmdError::Gpio | CmdError::NoResponse => InitError::NoCard,
        _ => InitError::Timeout,
    }
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq)]
enum CardType {
    Sd1,
    Sd2,
    Sdhc,
}

/// A terrible hack for busy-waiting the CPU while we wait for the card to
/// sort itself out.
struct Delay(u32);

impl Delay {
    fn new() -> Delay {
        Delay(DEFAULT_DELAY_COUNT)
    }

    fn delay(&mut self, err: CmdError) -> Result<(), CmdError> {
        if self.0 == 0 {
            Err(err)
        } else {
            let dummy_var: u32 = 0;
            for _ in 0..100 {
                unsafe { core::ptr::read_volatile(&dummy_var) };
            }
            self.0 -= 1;
            Ok(())
        }
    }
}

/// The block device adapter over an SD card in SPI mode.
///
/// Owns the [`HardwareHandle`] for its whole life; validation and
/// mounting both operate on the same device value, so neither ever has to
/// re-open the bus.
pub struct SdSpiDevice<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    hw: HardwareHandle<SPI, CS>,
    card_type: CardType,
    check_crc: bool,
    identity: Option<CardIdentity>,
}

impl<SPI, CS> SdSpiDevice<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Create an adapter over an owned hardware handle. The card is not
    /// touched until [`BlockDevice::initialize`] is called.
    pub fn new(hw: HardwareHandle<SPI, CS>) -> Self {
        SdSpiDevice {
            hw,
            card_type: CardType::Sd1,
            check_crc: true,
            identity: None,
        }
    }

    /// The owned hardware handle.
    pub fn handle(&self) -> &HardwareHandle<SPI, CS> {
        &self.hw
    }

    /// Give the hardware handle back, e.g. after deciding to rebuild a
    /// poisoned bus from scratch.
    pub fn into_handle(self) -> HardwareHandle<SPI, CS> {
        self.hw
    }

    /// The identity read by the last successful initialization, if any.
    pub fn identity(&self) -> Option<CardIdentity> {
        self.identity
    }

    /// Clock out one byte with the card deselected.
    fn clock_idle(&mut self) -> Result<u8, CmdError> {
        self.hw
            .spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| CmdError::Transport)
    }

    /// Run `f` with chip select asserted.
    ///
    /// Chip select is always deasserted afterwards, even if `f` errored.
    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, CmdError>
    where
        F: FnOnce(&mut BusGuard<SPI, CS>) -> Result<R, CmdError>,
    {
        let mut bus = BusGuard::new(&mut self.hw.spi, &mut self.hw.cs, self.check_crc)?;
        f(&mut bus)
    }

    fn bring_up(&mut self) -> Result<CardIdentity, CmdError> {
        trace!("Reset card..");

        // Supply a minimum of 74 clock cycles without CS asserted.
        self.hw.cs.set_high().map_err(|_| CmdError::Gpio)?;
        for _ in 0..10 {
            self.clock_idle()?;
        }

        self.handshake()?;

        let csd = self.read_csd()?;
        Ok(CardIdentity {
            block_count: BlockCount(csd.card_capacity_blocks()),
        })
    }

    /// The SPI-mode entry handshake: idle command, CRC mode, interface
    /// condition, initialization polling, capacity class.
    fn handshake(&mut self) -> Result<(), CmdError> {
        let mut card_type = CardType::Sd1;
        let mut check_crc = true;

        {
            let mut bus = BusGuard::new(&mut self.hw.spi, &mut self.hw.cs, true)?;

            // Enter SPI mode
            let mut delay = Delay::new();
            let mut attempts = ENTER_SPI_MODE_ATTEMPTS;
            while attempts > 0 {
                trace!(
                    "Enter SPI mode, attempt: {}..",
                    ENTER_SPI_MODE_ATTEMPTS - attempts
                );
                match bus.card_command(CMD0, 0) {
                    Err(CmdError::CommandTimeout(0)) => {
                        warn!("Timed out, trying again..");
                        attempts -= 1;
                    }
                    Err(e) => {
                        return Err(e);
                    }
                    Ok(r) if r == R1Status::IDLE_STATE.bits() => {
                        break;
                    }
                    Ok(r) => {
                        warn!("Got response: {:x}, trying again..", r);
                    }
                }

                delay.delay(CmdError::CommandTimeout(CMD0))?;
            }
            if attempts == 0 {
                return Err(CmdError::NoResponse);
            }

            // Some cards don't support CRC mode. Tolerate them, but skip
            // the data CRC compare for the rest of the session.
            if bus.card_command(CMD59, 1)? != R1Status::IDLE_STATE.bits() {
                warn!("Card refused CRC mode, data CRC checking disabled");
                check_crc = false;
            }

            // Check card version
            let mut delay = Delay::new();
            loop {
                let r = R1Status::from_bits_truncate(bus.card_command(CMD8, 0x1AA)?);
                if r == (R1Status::ILLEGAL_COMMAND | R1Status::IDLE_STATE) {
                    card_type = CardType::Sd1;
                    break;
                }
                bus.receive()?;
                bus.receive()?;
                bus.receive()?;
                let status = bus.receive()?;
                if status == 0xAA {
                    card_type = CardType::Sd2;
                    break;
                }
                delay.delay(CmdError::CommandTimeout(CMD8))?;
            }
            debug!("Card version: {:?}", card_type);

            let arg = match card_type {
                CardType::Sd1 => 0,
                CardType::Sd2 | CardType::Sdhc => 0x4000_0000,
            };

            // Initialization polling, bounded by the delay budget.
            let mut delay = Delay::new();
            while bus.card_acmd(ACMD41, arg)? != R1Status::READY.bits() {
                delay.delay(CmdError::CommandTimeout(ACMD41))?;
            }

            if card_type == CardType::Sd2 {
                if bus.card_command(CMD58, 0)? != R1Status::READY.bits() {
                    return Err(CmdError::BadResponse(CMD58));
                }
                if (bus.receive()? & 0xC0) == 0xC0 {
                    card_type = CardType::Sdhc;
                }
                // Discard the other three OCR bytes
                bus.receive()?;
                bus.receive()?;
                bus.receive()?;
            }
        }

        self.card_type = card_type;
        self.check_crc = check_crc;
        Ok(())
    }

    /// Read the Card Specific Data register.
    fn read_csd(&mut self) -> Result<Csd, CmdError> {
        let card_type = self.card_type;
        self.with_chip_select(|bus| match card_type {
            CardType::Sd1 => {
                let mut csd = CsdV1::new();
                if bus.card_command(CMD9, 0)? != R1Status::READY.bits() {
                    return Err(CmdError::BadResponse(CMD9));
                }
                bus.read_data(&mut csd.data)?;
                Ok(Csd::V1(csd))
            }
            CardType::Sd2 | CardType::Sdhc => {
                let mut csd = CsdV2::new();
                if bus.card_command(CMD9, 0)? != R1Status::READY.bits() {
                    return Err(CmdError::BadResponse(CMD9));
                }
                bus.read_data(&mut csd.data)?;
                Ok(Csd::V2(csd))
            }
        })
    }
}

impl<SPI, CS> BlockDevice for SdSpiDevice<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    /// Perform the full SPI-mode bring-up handshake and read the card's
    /// identity. A poisoned handle is rebuilt here; the previous identity
    /// is forgotten either way.
    fn initialize(&mut self) -> Result<CardIdentity, InitError> {
        debug!("Acquiring card (poisoned: {})", self.hw.poisoned);
        self.identity = None;

        let result = self.bring_up();
        // Extra clocks with the card deselected, so it can finish
        // latching its previous response.
        let _ = self.clock_idle();

        match result {
            Ok(identity) => {
                self.hw.poisoned = false;
                self.identity = Some(identity);
                debug!(
                    "Card reports {} blocks ({} bytes)",
                    identity.block_count.0,
                    identity.capacity_bytes()
                );
                Ok(identity)
            }
            Err(e) => {
                warn!("Bring-up failed: {:?}", e);
                Err(init_error(e))
            }
        }
    }

    /// Read a single block with CMD17.
    ///
    /// Never retried internally; one call is one bus transaction.
    fn read_block(&mut self, block_idx: BlockIdx, block: &mut Block) -> Result<(), ReadError> {
        if self.hw.poisoned {
            warn!("Refusing read on a poisoned handle");
            return Err(ReadError::IoError);
        }
        if self.identity.is_none() {
            warn!("Refusing read before initialization");
            return Err(ReadError::IoError);
        }

        let addr = match self.card_type {
            CardType::Sd1 | CardType::Sd2 => block_idx.0 * 512,
            CardType::Sdhc => block_idx.0,
        };

        let result = self.with_chip_select(|bus| {
            if bus.card_command(CMD17, addr)? != R1Status::READY.bits() {
                return Err(CmdError::BadResponse(CMD17));
            }
            bus.read_data(&mut block.contents)
        });
        let _ = self.clock_idle();

        result.map_err(|e| {
            warn!("Reading block {} failed: {:?}", block_idx.0, e);
            ReadError::IoError
        })
    }

    fn mark_poisoned(&mut self) {
        warn!("Handle poisoned; a full reset is required before reuse");
        self.hw.poisoned = true;
    }
}
