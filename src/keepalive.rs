//! The liveness keeper: a cooperative nudge for cards that power
//! themselves down when the bus goes idle.
//!
//! Some board/card combinations drop into an idle power state after less
//! than a second without traffic and then miss the first real command
//! that follows. The keeper re-reads block 0 when the bus has been quiet
//! for too long. It never spawns a timer: the caller invokes
//! [`LivenessKeeper::tick`] from its own loop, because the bus has one
//! owner and no lock.

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

use crate::block_device::{Block, BlockDevice, BlockIdx, ReadError};
use crate::time::Clock;

/// Issues a trivial read when the bus has been idle past a threshold.
///
/// Stateless beyond the last-activity timestamp.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug)]
pub struct LivenessKeeper {
    idle_threshold_millis: u64,
    last_activity_millis: u64,
}

impl LivenessKeeper {
    /// The idle threshold observed to keep affected hardware awake.
    pub const DEFAULT_IDLE_THRESHOLD_MILLIS: u64 = 800;

    /// Create a keeper, treating `now_millis` as the moment of last bus
    /// activity.
    pub fn new(now_millis: u64) -> Self {
        LivenessKeeper {
            idle_threshold_millis: Self::DEFAULT_IDLE_THRESHOLD_MILLIS,
            last_activity_millis: now_millis,
        }
    }

    pub fn with_idle_threshold(mut self, millis: u64) -> Self {
        self.idle_threshold_millis = millis;
        self
    }

    /// Tell the keeper the bus was just used for something else, so it
    /// does not nudge needlessly.
    pub fn note_activity(&mut self, now_millis: u64) {
        self.last_activity_millis = now_millis;
    }

    /// Nudge the card with a block-0 read if the idle threshold has
    /// elapsed. Returns whether a bus transaction was performed.
    ///
    /// Must be called cooperatively from the owner's loop; under the
    /// threshold this touches nothing.
    pub fn tick<D, C>(&mut self, device: &mut D, clock: &mut C) -> Result<bool, ReadError>
    where
        D: BlockDevice,
        C: Clock,
    {
        let now = clock.now_millis();
        if now.saturating_sub(self.last_activity_millis) < self.idle_threshold_millis {
            return Ok(false);
        }

        trace!("Idle for {} ms, nudging card", now - self.last_activity_millis);
        // The bus was touched either way; an errored nudge must not turn
        // into a nudge storm.
        self.last_activity_millis = now;

        let mut block = Block::new();
        device.read_block(BlockIdx(0), &mut block)?;
        Ok(true)
    }
}
