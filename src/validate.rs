//! The validation sequencer: an ordered warm-up protocol that proves the
//! data path is alive before anything tries to mount a filesystem.
//!
//! Three stages, each independently timed and each allowed to fail
//! without aborting the whole sequence:
//!
//! 1. **Communication probe**: initialize the card and record its
//!    identity.
//! 2. **MBR read**: read block 0 under the caller's time budget and
//!    check the boot signature. The stage where hangs actually happen in
//!    the field, so a blown budget here poisons the device handle.
//! 3. **Multi-block sustained read**: sequential reads past block 0, for
//!    controllers whose first read succeeds and whose second read fails
//!    because their internal read pointer resets incorrectly.
//!
//! An MBR failure skips the sustained read; nothing else is skipped.
//! Per-stage outcomes are the point: a permanent hang, a capacity
//! misreport and a first-read-then-fail controller each manifest at a
//! different stage and need different operator guidance.

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

use crate::block_device::{Block, BlockDevice, BlockIdx};
use crate::mbr::Mbr;
use crate::report::ReadinessReport;
use crate::time::{Clock, TimeBudget};

/// How many sequential blocks past the MBR the sustained-read stage
/// covers.
const SUSTAINED_READ_BLOCKS: u32 = 4;

/// A marketed size class in bytes, e.g. `size_class_bytes(64)` for a card
/// sold as 64 GB.
pub const fn size_class_bytes(gigabytes: u32) -> u64 {
    gigabytes as u64 * 1024 * 1024 * 1024
}

/// Runs the pre-mount warm-up protocol against a block device and
/// produces a [`ReadinessReport`].
pub struct Validator<C>
where
    C: Clock,
{
    clock: C,
    nominal_capacity_bytes: Option<u64>,
}

impl<C> Validator<C>
where
    C: Clock,
{
    pub fn new(clock: C) -> Self {
        Validator {
            clock,
            nominal_capacity_bytes: None,
        }
    }

    /// The capacity this card is marketed as, e.g.
    /// [`size_class_bytes`]`(64)`. When set, a card reporting no more
    /// than half of it gets `capacity_mismatch` flagged in the report.
    ///
    /// The mismatch is empirically correlated with counterfeit and
    /// non-compliant firmware, but it is advisory only and never blocks
    /// mounting.
    pub fn with_nominal_capacity(mut self, bytes: u64) -> Self {
        self.nominal_capacity_bytes = Some(bytes);
        self
    }

    /// Run all three stages.
    pub fn validate<D>(&mut self, device: &mut D, budget: TimeBudget) -> ReadinessReport
    where
        D: BlockDevice,
    {
        self.run(device, budget, true)
    }

    /// Run the communication probe and MBR read only.
    ///
    /// For checking card compatibility before committing to a project; no
    /// filesystem is involved and the sustained-read stage is skipped.
    pub fn read_mbr_only<D>(&mut self, device: &mut D, budget: TimeBudget) -> ReadinessReport
    where
        D: BlockDevice,
    {
        self.run(device, budget, false)
    }

    fn run<D>(&mut self, device: &mut D, budget: TimeBudget, sustained: bool) -> ReadinessReport
    where
        D: BlockDevice,
    {
        let mut report = ReadinessReport::new();
        let start = self.clock.now_millis();
        let deadline = start + budget.total_millis;

        // Stage 1: communication probe.
        match device.initialize() {
            Ok(identity) => {
                report.comm_init_ok = true;
                report.reported_capacity_bytes = identity.capacity_bytes();
                debug!(
                    "Communication probe ok: {} blocks, {} bytes",
                    identity.block_count.0,
                    identity.capacity_bytes()
                );
                if let Some(nominal) = self.nominal_capacity_bytes {
                    report.capacity_mismatch =
                        identity.capacity_bytes().saturating_mul(2) <= nominal;
                    if report.capacity_mismatch {
                        warn!(
                            "Card reports {} bytes against a nominal class of {}",
                            identity.capacity_bytes(),
                            nominal
                        );
                    }
                }
            }
            Err(e) => {
                warn!("Communication probe failed: {:?}", e);
            }
        }
        let after_comm = self.clock.now_millis();
        report.timings.comm_millis = after_comm - start;

        // Stage 2: MBR read, under the caller's budget. The adapter has
        // no data-path timeout of its own, so the check happens between
        // exchanges: before issuing the read, and once it returns.
        if after_comm > deadline {
            self.hang(device, &mut report);
            return report;
        }

        let mut block = Block::new();
        let outcome = device.read_block(BlockIdx(0), &mut block);
        let after_mbr = self.clock.now_millis();
        report.timings.mbr_millis = after_mbr - after_comm;

        if after_mbr > deadline {
            // The read came back, but after the budget. The data path is
            // treated as wedged regardless of what it returned.
            self.hang(device, &mut report);
            return report;
        }

        match outcome {
            Ok(()) => {
                let summary = Mbr::summarize(&block);
                report.mbr_read_ok = true;
                report.mbr_signature = summary.signature;
                report.mbr_signature_valid = summary.signature_valid;
                report.partition_type = summary.partition_type;
                debug!(
                    "MBR signature {:x} {:x} (valid: {}), partition type {:?}",
                    summary.signature[0],
                    summary.signature[1],
                    summary.signature_valid,
                    summary.partition_type
                );
            }
            Err(e) => {
                warn!("MBR read failed: {:?}", e);
            }
        }

        // An unreadable MBR gates everything downstream; the sustained
        // read would only add noise.
        if !sustained || !report.mbr_read_ok {
            return report;
        }

        // Stage 3: sustained sequential reads. A failure here is recorded
        // but never overwrites the MBR stage's success.
        let mut all_ok = true;
        for idx in 1..=SUSTAINED_READ_BLOCKS {
            if let Err(e) = device.read_block(BlockIdx(idx), &mut block) {
                warn!("Sustained read failed at block {}: {:?}", idx, e);
                all_ok = false;
                break;
            }
        }
        report.multiblock_read_ok = all_ok;
        report.timings.multiblock_millis = self.clock.now_millis() - after_mbr;

        report
    }

    fn hang<D>(&mut self, device: &mut D, report: &mut ReadinessReport)
    where
        D: BlockDevice,
    {
        warn!("MBR stage exceeded its budget; treating the read path as hung");
        report.mbr_read_ok = false;
        report.hung = true;
        device.mark_poisoned();
    }
}
