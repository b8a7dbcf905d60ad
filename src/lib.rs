//! # sd-bringup
//!
//! > Pre-mount validation and adaptive bring-up for SD cards over SPI
//!
//! Cards, controllers and boards disagree about timing in ways that only
//! show up at mount time: reads that hang forever, capacities that are
//! half of what the label says, first reads that succeed while every
//! following read fails. This crate wakes a card over SPI, proves the
//! data path is alive with an ordered warm-up protocol, classifies the
//! failure modes into a [`ReadinessReport`], and only then hands the
//! block device to an external filesystem mounter. It is `#![no_std]`,
//! does not use `alloc`, and never spawns tasks or timers of its own.
//!
//! ## Using the crate
//!
//! Build a [`HardwareHandle`] from your SPI peripheral and chip-select
//! pin, wrap it in an [`SdSpiDevice`], validate, and mount:
//!
//! ```rust,ignore
//! use sd_bringup::{
//!     mount, HardwareHandle, MountOptions, SdSpiDevice, TimeBudget, Validator,
//! };
//!
//! let hw = HardwareHandle::new(spi, cs);
//! let mut device = SdSpiDevice::new(hw);
//!
//! let mut validator = Validator::new(&mut clock)
//!     .with_nominal_capacity(sd_bringup::size_class_bytes(64));
//! let report = validator.validate(&mut device, TimeBudget::DEFAULT);
//!
//! match mount(
//!     &mut device,
//!     &mut filesystem,
//!     &report,
//!     &mut delay,
//!     MountOptions::new("/sd").with_cache_priming(),
//! ) {
//!     Ok(session) => { /* read files via `filesystem` */ }
//!     Err(e) => { /* report; the filesystem was never touched on a dead path */ }
//! }
//! ```
//!
//! The same `device` value is threaded through validation and mounting:
//! the bus/CS pair has exactly one owner, so "resource already claimed"
//! failures cannot be constructed.
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the
//! `defmt-log` feature you can configure this crate to log messages over
//! defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod structure;

pub mod block_device;
pub mod keepalive;
pub mod mbr;
pub mod mount;
pub mod report;
pub mod sdmmc;
pub mod time;
pub mod validate;

pub use crate::block_device::{
    Block, BlockCount, BlockDevice, BlockIdx, InitError, MemoryBlockDevice, ReadError,
};
pub use crate::keepalive::LivenessKeeper;
pub use crate::mbr::{Mbr, MbrSummary, PartitionKind};
pub use crate::mount::{mount, unmount, Filesystem, MountError, MountOptions, MountSession};
pub use crate::report::{CardIdentity, ReadinessReport, StageTimings};
pub use crate::sdmmc::{HardwareHandle, SdSpiDevice};
pub use crate::time::{Clock, TimeBudget};
pub use crate::validate::{size_class_bytes, Validator};
