//! Time bases.
//!
//! Two clocks drive the layer:
//!  - the *rtimer*: a fast, wrapping 32-bit tick counter with microsecond-ish
//!    resolution, used for everything on the air (wake-up epochs, rendezvous
//!    times, acknowledgment windows)
//!  - the *slow clock*: a seconds/milliseconds-granularity uptime clock
//!    ([`embedded_time::Clock`]), used for CSMA-CA backoff deadlines,
//!    neighbor lifetimes, admission buckets, and the HELLO schedule
//!
//! Rtimer arithmetic is wrapping by construction; all comparisons go through
//! [`rtimer_lt`] / [`rtimer_delta`].

use embedded_time::duration::{Generic, Milliseconds, Seconds};
use embedded_time::Clock;

/// Fast tick counter value.
pub type RtimerClock = u32;

/// Rtimer ticks per second.
pub const RTIMER_SECOND: u32 = 32768;

/// Milliseconds of the slow clock, wrapping.
pub type ClockTime = u32;

pub const fn us_to_ticks(us: u32) -> RtimerClock {
    // rounded, without overflowing for the ranges used here
    (us as u64 * RTIMER_SECOND as u64 / 1_000_000) as RtimerClock + 1
}

pub const fn ticks_to_seconds(ticks: RtimerClock) -> u32 {
    ticks / RTIMER_SECOND
}

/// `a < b` under wrapping arithmetic.
pub fn rtimer_lt(a: RtimerClock, b: RtimerClock) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// Ticks from `a` forward to `b`.
pub fn rtimer_delta(a: RtimerClock, b: RtimerClock) -> RtimerClock {
    b.wrapping_sub(a)
}

/// `a < b` on the wrapping slow clock.
pub fn clock_lt(a: ClockTime, b: ClockTime) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

/// The hard-real-time timer. One timer instance backs both the duty-cycle
/// and the transmission state machine; the host invokes the MAC's
/// `on_timer` when it fires.
pub trait Rtimer {
    fn now(&self) -> RtimerClock;

    /// Arms the timer, replacing any earlier deadline.
    fn schedule(&mut self, at: RtimerClock);

    /// Arms the timer only if `at` is still comfortably in the future.
    fn schedule_precise(&mut self, at: RtimerClock) -> Result<(), TooLate>;

    /// Disarms the timer. Returns whether a deadline was pending.
    fn cancel(&mut self) -> bool;
}

/// The requested deadline was already (or almost) due.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TooLate;

/// The slow clock as this crate consumes it: any [`embedded_time::Clock`]
/// whose instants convert to milliseconds and seconds.
///
/// A clock that cannot be read is treated as stuck at zero; every user of
/// `ClockTime` degrades gracefully to "retry now" in that case.
pub trait SlowClock: Clock {
    /// Uptime in wrapping milliseconds.
    fn uptime_ms(&self) -> ClockTime;

    /// Uptime in whole seconds.
    fn uptime_seconds(&self) -> u32;
}

impl<C> SlowClock for C
where
    C: Clock,
    Milliseconds<u32>: TryFrom<Generic<C::T>>,
    Seconds<u32>: TryFrom<Generic<C::T>>,
{
    fn uptime_ms(&self) -> ClockTime {
        self.try_now()
            .ok()
            .and_then(|instant| {
                let since_epoch: Generic<C::T> = instant.duration_since_epoch();
                Milliseconds::<u32>::try_from(since_epoch).ok()
            })
            .map(|ms| ms.0)
            .unwrap_or(0)
    }

    fn uptime_seconds(&self) -> u32 {
        self.try_now()
            .ok()
            .and_then(|instant| {
                let since_epoch: Generic<C::T> = instant.duration_since_epoch();
                Seconds::<u32>::try_from(since_epoch).ok()
            })
            .map(|s| s.0)
            .unwrap_or(0)
    }
}
