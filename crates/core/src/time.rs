use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A point on the kernel's monotonic clock, in nanoseconds.
///
/// Kernel buffer completions carry DMA-end times on this clock; everything
/// the timeline computes stays on the same base. Offsets can be negative
/// (a start-of-exposure estimate sits *before* the DMA-end time), so the
/// offset helper takes a signed nanosecond count and saturates at zero.
///
/// # Example
/// ```rust
/// use iris_core::prelude::Timestamp;
///
/// let dma_end = Timestamp::from_nanos(1_000_000_000);
/// let soe = dma_end.offset_by(-3_000_000);
/// assert_eq!(soe.as_nanos(), 997_000_000);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Shift by a signed nanosecond offset, saturating at the clock origin.
    pub fn offset_by(self, nanos: i64) -> Timestamp {
        if nanos >= 0 {
            Timestamp(self.0.saturating_add(nanos as u64))
        } else {
            Timestamp(self.0.saturating_sub(nanos.unsigned_abs()))
        }
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(rhs.as_nanos() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}
