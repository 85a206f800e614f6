//! Frame timestamps.
//!
//! The acquire loop asks a [`TimeSource`] for a stamp after each frame passes
//! the sync check. Timing-system integration lives behind this trait; the
//! default [`SystemClock`] reads the host clock and derives the pulse id from
//! the low bits of the nanoseconds field, which is where an event-timing
//! system encodes it.

use crate::error::Result;
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

/// Bits of the nanosecond field that carry the pulse id.
pub const PULSE_ID_MASK: u32 = 0x1FFFF;

/// Timestamp attached to one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameStamp {
    /// Wall-clock time of the frame.
    pub time: DateTime<Utc>,
    /// Timing-system pulse id.
    pub pulse_id: u32,
}

impl FrameStamp {
    /// Stamp for `time`, with the pulse id taken from its nanoseconds.
    #[must_use]
    pub fn from_time(time: DateTime<Utc>) -> Self {
        Self {
            time,
            pulse_id: time.nanosecond() & PULSE_ID_MASK,
        }
    }
}

/// Source of frame timestamps.
pub trait TimeSource: Send + Sync {
    /// Stamp for a frame, correlated with timing event `event`.
    ///
    /// An error means no trustworthy time is available and the frame is
    /// dropped.
    fn stamp(&self, event: u32) -> Result<FrameStamp>;
}

/// Host clock. Ignores the event number.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn stamp(&self, _event: u32) -> Result<FrameStamp> {
        Ok(FrameStamp::from_time(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pulse_id_is_low_nanosecond_bits() {
        let time = Utc
            .timestamp_opt(1_700_000_000, 0x0003_2345)
            .single()
            .unwrap();
        let stamp = FrameStamp::from_time(time);
        assert_eq!(stamp.pulse_id, 0x1_2345 & PULSE_ID_MASK);
        assert_eq!(stamp.time, time);
    }

    #[test]
    fn system_clock_stamps() {
        let stamp = SystemClock.stamp(140).unwrap();
        assert!(stamp.pulse_id <= PULSE_ID_MASK);
    }
}
