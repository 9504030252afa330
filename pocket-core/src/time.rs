//! Monotonic tick time built from a narrow free-running hardware counter.
//!
//! The hardware counter only provides `BITS` bits; [`TimeBase`] extends it to
//! 32 bits in software by counting overflow interrupts. All comparisons
//! between [`Instant`]s go through a signed 32-bit delta so the 2^32 wrap is
//! invisible to callers as long as compared instants stay within 2^31 ticks
//! of each other.

use core::ops::Add;

use portable_atomic::{AtomicU32, Ordering};

/// Tick count used for durations and latencies.
pub type Ticks = u32;

/// Point on the wrapping 32-bit tick timeline.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Instant(u32);

impl Instant {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_ticks(ticks: u32) -> Self {
        Self(ticks)
    }

    #[must_use]
    pub const fn ticks(self) -> u32 {
        self.0
    }

    /// Signed distance from `self` to `later`; positive when `later` is ahead.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn ticks_until(self, later: Instant) -> i32 {
        later.0.wrapping_sub(self.0) as i32
    }

    /// Returns `true` once `self` has reached or passed `deadline`.
    #[must_use]
    pub const fn has_reached(self, deadline: Instant) -> bool {
        self.ticks_until(deadline) <= 0
    }

    #[must_use]
    pub const fn wrapping_add(self, ticks: Ticks) -> Self {
        Self(self.0.wrapping_add(ticks))
    }

    #[must_use]
    pub const fn wrapping_sub(self, ticks: Ticks) -> Self {
        Self(self.0.wrapping_sub(ticks))
    }
}

impl Add<Ticks> for Instant {
    type Output = Instant;

    fn add(self, rhs: Ticks) -> Self::Output {
        self.wrapping_add(rhs)
    }
}

/// Tick frequency expressed as `num / den` ticks per microsecond.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickRate {
    num: u32,
    den: u32,
}

impl TickRate {
    /// One tick per millisecond; convenient for host tests and the simulator.
    pub const MILLIS: Self = Self::from_hz(1_000);

    #[must_use]
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    #[must_use]
    pub const fn from_hz(hz: u32) -> Self {
        Self::new(hz, 1_000_000)
    }

    /// Converts microseconds to ticks, rounding up so delays are never short.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn ticks_from_micros(self, micros: u64) -> Ticks {
        let num = self.num as u64;
        let den = self.den as u64;
        ((micros * num + den - 1) / den) as Ticks
    }

    #[must_use]
    pub const fn ticks_from_millis(self, millis: u32) -> Ticks {
        self.ticks_from_micros(millis as u64 * 1_000)
    }

    /// Converts ticks back to whole milliseconds (truncating).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn millis_from_ticks(self, ticks: Ticks) -> u32 {
        (ticks as u64 * self.den as u64 / (self.num as u64 * 1_000)) as u32
    }
}

/// Source of the current tick time.
pub trait Clock {
    fn now(&self) -> Instant;

    /// Busy-waits until `deadline`. Only meant for short alignment waits.
    fn wait_until(&self, deadline: Instant) {
        while self.now().ticks_until(deadline) > 0 {
            core::hint::spin_loop();
        }
    }

    fn delay(&self, ticks: Ticks) {
        self.wait_until(self.now().wrapping_add(ticks));
    }
}

/// Clock that also owns the single compare channel used to wake from sleep.
pub trait WakeupTimer: Clock {
    /// Programs the comparator to fire at `at`. Returns `false` (and leaves
    /// the comparator disarmed) when `at` is outside the comparator window.
    fn arm_wakeup(&self, at: Instant, now: Instant) -> bool;

    fn disarm_wakeup(&self);
}

/// Free-running hardware counter with one compare channel.
pub trait Counter {
    /// Counter width. Must be below 32.
    const BITS: u32;

    /// Live counter value (low `BITS` bits).
    fn count(&self) -> u32;

    /// Whether an overflow happened that the ISR has not serviced yet.
    fn overflow_pending(&self) -> bool;

    fn set_compare(&self, value: u32);

    fn disable_compare(&self);
}

/// Counter extended to 32 bits by counting overflow interrupts.
pub struct TimeBase<C> {
    counter: C,
    high: AtomicU32,
}

impl<C: Counter> TimeBase<C> {
    const LOW_MASK: u32 = (1 << C::BITS) - 1;

    #[must_use]
    pub const fn new(counter: C) -> Self {
        Self {
            counter,
            high: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn counter(&self) -> &C {
        &self.counter
    }

    /// Must be called from the counter overflow ISR once the flag is cleared.
    pub fn on_overflow(&self) {
        self.high.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> Instant {
        critical_section::with(|_| {
            let mut high = self.high.load(Ordering::Relaxed);
            let pending = self.counter.overflow_pending();
            let mut low = self.counter.count();

            if pending {
                high = high.wrapping_add(1);
            } else if self.counter.overflow_pending() {
                // Wrapped between the two reads; the first sample may predate it.
                high = high.wrapping_add(1);
                low = self.counter.count();
            }

            Instant::from_ticks((high << C::BITS) | (low & Self::LOW_MASK))
        })
    }
}

impl<C: Counter> Clock for TimeBase<C> {
    fn now(&self) -> Instant {
        self.get()
    }
}

impl<C: Counter> WakeupTimer for TimeBase<C> {
    fn arm_wakeup(&self, at: Instant, now: Instant) -> bool {
        let period_start = now.ticks() & !Self::LOW_MASK;
        let offset = at.ticks().wrapping_sub(period_start);

        if offset <= Self::LOW_MASK {
            self.counter.set_compare(offset);
            true
        } else {
            self.counter.disable_compare();
            false
        }
    }

    fn disarm_wakeup(&self) {
        self.counter.disable_compare();
    }
}
