#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Counters shared between the low-power backend, interrupt handlers and the
//! status job.
//!
//! Everything is a relaxed atomic: the status job only needs a consistent
//! enough view to log residency, never an exact snapshot.

use pocket_core::{InputEvent, SleepState};
use portable_atomic::{AtomicU32, Ordering};

pub struct StatusCounters {
    sleep_entries: [AtomicU32; SleepState::COUNT],
    slept_ticks: [AtomicU32; SleepState::COUNT],
    input_events: AtomicU32,
    long_presses: AtomicU32,
    backlight_wakes: AtomicU32,
}

/// Point-in-time copy of [`StatusCounters`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct StatusSnapshot {
    pub sleep_entries: [u32; SleepState::COUNT],
    pub slept_ticks: [u32; SleepState::COUNT],
    pub input_events: u32,
    pub long_presses: u32,
    pub backlight_wakes: u32,
}

impl StatusCounters {
    pub const fn new() -> Self {
        Self {
            sleep_entries: [const { AtomicU32::new(0) }; SleepState::COUNT],
            slept_ticks: [const { AtomicU32::new(0) }; SleepState::COUNT],
            input_events: AtomicU32::new(0),
            long_presses: AtomicU32::new(0),
            backlight_wakes: AtomicU32::new(0),
        }
    }

    /// Records one completed stay in `state` lasting `ticks`.
    pub fn record_sleep(&self, state: SleepState, ticks: u32) {
        let index = state.as_index();
        self.sleep_entries[index].fetch_add(1, Ordering::Relaxed);
        self.slept_ticks[index].fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn record_input(&self, event: InputEvent) {
        if event.long_press {
            self.long_presses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.input_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_backlight_wake(&self) {
        self.backlight_wakes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let load = |counters: &[AtomicU32; SleepState::COUNT]| {
            core::array::from_fn(|index| counters[index].load(Ordering::Relaxed))
        };
        StatusSnapshot {
            sleep_entries: load(&self.sleep_entries),
            slept_ticks: load(&self.slept_ticks),
            input_events: self.input_events.load(Ordering::Relaxed),
            long_presses: self.long_presses.load(Ordering::Relaxed),
            backlight_wakes: self.backlight_wakes.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatusCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSnapshot {
    /// Counter increments between `earlier` and `self`.
    pub fn since(&self, earlier: &StatusSnapshot) -> StatusSnapshot {
        let delta = |now: &[u32; SleepState::COUNT], then: &[u32; SleepState::COUNT]| {
            core::array::from_fn(|index| now[index].wrapping_sub(then[index]))
        };
        StatusSnapshot {
            sleep_entries: delta(&self.sleep_entries, &earlier.sleep_entries),
            slept_ticks: delta(&self.slept_ticks, &earlier.slept_ticks),
            input_events: self.input_events.wrapping_sub(earlier.input_events),
            long_presses: self.long_presses.wrapping_sub(earlier.long_presses),
            backlight_wakes: self.backlight_wakes.wrapping_sub(earlier.backlight_wakes),
        }
    }

    /// Share of the sampled time spent in `state`, in per mille.
    pub fn residency_permille(&self, state: SleepState, elapsed: u32) -> u32 {
        if elapsed == 0 {
            return 0;
        }
        let slept = u64::from(self.slept_ticks[state.as_index()]);
        let permille = slept * 1_000 / u64::from(elapsed);
        u32::try_from(permille.min(1_000)).unwrap_or(1_000)
    }
}
