//! The readiness report produced by pre-mount validation.

use crate::block_device::BlockCount;
use crate::mbr::PartitionKind;

/// What a card says about itself after a successful reset.
///
/// Immutable once read; the adapter re-reads it after any reset.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardIdentity {
    /// The number of 512-byte blocks the card reports.
    pub block_count: BlockCount,
}

impl CardIdentity {
    /// The capacity the card claims, in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.block_count.bytes()
    }
}

/// Wall-clock cost of each validation stage, in milliseconds.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub comm_millis: u64,
    pub mbr_millis: u64,
    pub multiblock_millis: u64,
}

/// The structured outcome of one pre-mount validation attempt.
///
/// A report is created fresh per attempt and never mutated afterwards; a
/// new attempt produces a new report. Partial reports are meaningful: the
/// three stages fail independently, and the combination of which stages
/// failed is the diagnostic signal (a hang, a capacity misreport and a
/// first-read-succeeds-then-fails controller each show up at a different
/// stage).
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    /// Stage 1: the card answered the bring-up handshake.
    pub comm_init_ok: bool,
    /// The card reported no more than half its expected nominal size
    /// class. Advisory only; correlated with counterfeit or non-compliant
    /// firmware but never a hard failure by itself.
    pub capacity_mismatch: bool,
    /// The capacity the card claimed, in bytes. Zero if stage 1 failed.
    pub reported_capacity_bytes: u64,
    /// Stage 2: block 0 was read within budget.
    pub mbr_read_ok: bool,
    /// Stage 2 did not return within the caller's budget. The definitive
    /// signal that the card's SPI read path is non-functional; the device
    /// handle has been poisoned and must be rebuilt by a full reset.
    pub hung: bool,
    /// The two boot-signature bytes observed at offset 510, whatever they
    /// were.
    pub mbr_signature: [u8; 2],
    /// Whether the observed signature was `0x55 0xAA`.
    pub mbr_signature_valid: bool,
    /// The partition-type byte of the first partition entry, interpreted.
    pub partition_type: PartitionKind,
    /// Stage 3: several sequential reads past block 0 all succeeded.
    pub multiblock_read_ok: bool,
    /// Per-stage timings.
    pub timings: StageTimings,
}

impl ReadinessReport {
    pub(crate) fn new() -> Self {
        ReadinessReport {
            comm_init_ok: false,
            capacity_mismatch: false,
            reported_capacity_bytes: 0,
            mbr_read_ok: false,
            hung: false,
            mbr_signature: [0, 0],
            mbr_signature_valid: false,
            partition_type: PartitionKind::Unknown(0),
            multiblock_read_ok: false,
            timings: StageTimings::default(),
        }
    }

    /// All three stages completed and no hang was detected.
    pub fn usable(&self) -> bool {
        self.comm_init_ok && self.mbr_read_ok && self.multiblock_read_ok && !self.hung
    }

    /// Whether mounting may proceed. Only MBR readability gates mounting:
    /// a failed sustained read or a capacity mismatch is recorded but does
    /// not block.
    pub fn mountable(&self) -> bool {
        self.comm_init_ok && self.mbr_read_ok && !self.hung
    }
}
