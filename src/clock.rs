//! Clock identities for timer sources
//!
//! Timer deadlines are absolute points on a selectable clock, expressed as a
//! [`Duration`](std::time::Duration) since that clock's epoch. The loop never
//! converts between clocks: every timer is compared against its own clock.

use std::io;
use std::time::Duration;

use rustix::time::{clock_gettime_dynamic, ClockId, DynamicClockId};

/// A clock a timer deadline can be placed on.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Clock {
    /// Wall-clock time since the UNIX epoch. The default for new timers.
    #[default]
    Realtime,

    /// Monotonic time since an unspecified starting point, unaffected by
    /// wall-clock adjustments.
    Monotonic,

    /// Like [`Clock::Monotonic`], but also advancing while the system is
    /// suspended. Not available on old kernels, in which case reading it
    /// fails.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Boottime,
}

impl Clock {
    /// Read the current time on this clock, as a duration since its epoch.
    ///
    /// This is the reading the loop itself uses to compute poll timeouts and
    /// decide which timers are due, so absolute deadlines computed from it
    /// compare exactly.
    pub fn now(self) -> io::Result<Duration> {
        let id = match self {
            Clock::Realtime => DynamicClockId::Known(ClockId::Realtime),
            Clock::Monotonic => DynamicClockId::Known(ClockId::Monotonic),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Clock::Boottime => DynamicClockId::Boottime,
        };
        let ts = clock_gettime_dynamic(id)?;
        Ok(Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec as u32))
    }
}

/// Caches one reading per clock for the duration of a prepare or dispatch
/// pass, so all timers on the same clock are compared against the same
/// instant. A clock that cannot be read is recorded as `None` and warned
/// about once per pass.
pub(crate) struct ClockCache {
    readings: Vec<(Clock, Option<Duration>)>,
}

impl ClockCache {
    pub(crate) fn new() -> ClockCache {
        ClockCache {
            readings: Vec::new(),
        }
    }

    pub(crate) fn now(&mut self, clock: Clock) -> Option<Duration> {
        if let Some(&(_, cached)) = self.readings.iter().find(|(c, _)| *c == clock) {
            return cached;
        }
        let reading = match clock.now() {
            Ok(now) => Some(now),
            Err(err) => {
                log::warn!("[polloop] failed to read the {:?} clock: {}", clock, err);
                None
            }
        };
        self.readings.push((clock, reading));
        reading
    }
}
