//! Cooperative time keeping.
//!
//! The core never spawns timers of its own: the caller supplies a
//! monotonic millisecond source, and all deadline checks happen between
//! discrete command/response exchanges. A true mid-transfer abort is not
//! achievable over raw SPI, which is why a blown budget poisons the handle
//! instead of cancelling the transfer.

/// A monotonic millisecond clock supplied by the caller.
pub trait Clock {
    /// Milliseconds since some fixed epoch. Must never go backwards.
    fn now_millis(&mut self) -> u64;
}

impl<T> Clock for &mut T
where
    T: Clock,
{
    fn now_millis(&mut self) -> u64 {
        (*self).now_millis()
    }
}

/// How long a validation attempt is allowed to take, end to end.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimeBudget {
    /// Total budget across all stages, in milliseconds.
    pub total_millis: u64,
}

impl TimeBudget {
    /// The default budget of ten seconds, generous enough for slow cards
    /// on a slow clock while still converting a wedged read path into a
    /// prompt, reportable failure.
    pub const DEFAULT: TimeBudget = TimeBudget::from_secs(10);

    pub const fn from_millis(total_millis: u64) -> Self {
        TimeBudget { total_millis }
    }

    pub const fn from_secs(total_secs: u64) -> Self {
        TimeBudget {
            total_millis: total_secs * 1000,
        }
    }
}

impl Default for TimeBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}
