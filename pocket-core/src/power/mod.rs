//! Sleep depth selection and the reference-counted locks that cap it.
//!
//! Peripherals that cannot survive a given depth take a lock on the deepest
//! state they tolerate; [`PowerStateController::max_state`] reports the
//! shallowest locked state (or the board ceiling). Given the time left until
//! the next job, [`PowerStateController::configure_wakeup`] picks the deepest
//! state whose enter plus exit latency fits, and arms the wakeup comparator
//! early by the exit latency so the core is running again when the job is due.
//! The register-level sleep sequence lives behind [`LowPowerBackend`].

use core::fmt;
use core::ops::BitOr;

use portable_atomic::{AtomicU16, AtomicU32, Ordering};

use crate::time::{Instant, Ticks, WakeupTimer};

/// CPU sleep depth, ordered from shallowest to deepest.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SleepState {
    Run,
    S1,
    S2,
    S3,
}

impl SleepState {
    pub const COUNT: usize = 4;
    pub const ALL: [SleepState; Self::COUNT] = [
        SleepState::Run,
        SleepState::S1,
        SleepState::S2,
        SleepState::S3,
    ];
    /// States that actually suspend the core.
    pub const SLEEPING: [SleepState; Self::COUNT - 1] =
        [SleepState::S1, SleepState::S2, SleepState::S3];

    #[must_use]
    pub const fn as_index(self) -> usize {
        match self {
            SleepState::Run => 0,
            SleepState::S1 => 1,
            SleepState::S2 => 2,
            SleepState::S3 => 3,
        }
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(SleepState::Run),
            1 => Some(SleepState::S1),
            2 => Some(SleepState::S2),
            3 => Some(SleepState::S3),
            _ => None,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            SleepState::Run => "run",
            SleepState::S1 => "s1",
            SleepState::S2 => "s2",
            SleepState::S3 => "s3",
        }
    }
}

impl fmt::Display for SleepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Enter and exit latency of one sleep state, in ticks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StateLatency {
    pub enter: Ticks,
    pub exit: Ticks,
}

impl StateLatency {
    #[must_use]
    pub const fn new(enter: Ticks, exit: Ticks) -> Self {
        Self { enter, exit }
    }

    /// Smallest time budget for which sleeping in this state pays off.
    #[must_use]
    pub const fn threshold(self) -> Ticks {
        self.enter.saturating_add(self.exit)
    }
}

/// Board description of the available sleep states.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SleepProfile {
    /// Latencies of `S1`, `S2` and `S3`, in that order.
    pub latencies: [StateLatency; SleepState::COUNT - 1],
    pub highest_allowed: SleepState,
}

impl SleepProfile {
    #[must_use]
    pub const fn new(
        latencies: [StateLatency; SleepState::COUNT - 1],
        highest_allowed: SleepState,
    ) -> Self {
        Self {
            latencies,
            highest_allowed,
        }
    }

    /// Latency of a sleeping state; `None` for [`SleepState::Run`].
    #[must_use]
    pub const fn latency(&self, state: SleepState) -> Option<StateLatency> {
        match state {
            SleepState::Run => None,
            _ => Some(self.latencies[state.as_index() - 1]),
        }
    }

    /// Checks that deeper states never need a smaller budget than shallower
    /// ones, up to the ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::ThresholdDecreases`] naming the first offending
    /// state.
    pub const fn validate(&self) -> Result<(), ProfileError> {
        let ceiling = self.highest_allowed.as_index();
        let mut index = 1;
        while index < ceiling {
            let shallower = self.latencies[index - 1].threshold();
            let deeper = self.latencies[index].threshold();
            if deeper < shallower {
                return Err(ProfileError::ThresholdDecreases {
                    state: SleepState::ALL[index + 1],
                });
            }
            index += 1;
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProfileError {
    ThresholdDecreases { state: SleepState },
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::ThresholdDecreases { state } => {
                write!(f, "{state} wakes faster than a shallower state")
            }
        }
    }
}

/// Per-holder record of the state it currently keeps locked.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LockFlag {
    held: Option<SleepState>,
}

impl LockFlag {
    #[must_use]
    pub const fn new() -> Self {
        Self { held: None }
    }

    #[must_use]
    pub const fn held(self) -> Option<SleepState> {
        self.held
    }

    #[must_use]
    pub const fn is_held(self) -> bool {
        self.held.is_some()
    }
}

/// GPIO lines, one bit per pin number.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PinMask(u32);

impl PinMask {
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn pin(pin: u8) -> Self {
        Self(1 << (pin & 31))
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, pin: u8) -> bool {
        self.0 & Self::pin(pin).0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for PinMask {
    type Output = PinMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// Hardware side of entering a sleep state.
pub trait LowPowerBackend {
    type Error;

    /// Suspends the core in `state` and returns once it has woken with clocks
    /// and peripherals restored. Pins in `exempt` keep their configuration.
    ///
    /// # Errors
    ///
    /// A clock or regulator transition that could not complete.
    fn enter(&mut self, state: SleepState, exempt: PinMask) -> Result<(), Self::Error>;

    /// Handles an unrecoverable transition failure, typically by resetting.
    fn fatal(&mut self, error: Self::Error) -> !;
}

pub struct PowerStateController {
    profile: SleepProfile,
    locks: [AtomicU16; SleepState::COUNT],
    exempt: AtomicU32,
}

impl PowerStateController {
    #[must_use]
    pub const fn new(profile: SleepProfile) -> Self {
        Self {
            profile,
            locks: [
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
                AtomicU16::new(0),
            ],
            exempt: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub const fn profile(&self) -> &SleepProfile {
        &self.profile
    }

    /// Forbids every state deeper than `state` until the matching unlock.
    /// Does nothing while `flag` already holds a lock.
    ///
    /// Each state counts up to `u16::MAX` concurrent holders. Past that the
    /// lock is refused and `flag` stays clear, which
    /// [`LockFlag::is_held`] reports.
    pub fn lock_max_state(&self, state: SleepState, flag: &mut LockFlag) {
        if flag.held.is_some() {
            return;
        }
        let counter = &self.locks[state.as_index()];
        if counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_add(1)
            })
            .is_ok()
        {
            flag.held = Some(state);
        }
    }

    /// Releases the lock `flag` holds on `state`; a no-op otherwise.
    pub fn unlock_max_state(&self, state: SleepState, flag: &mut LockFlag) {
        if flag.held != Some(state) {
            return;
        }
        let previous = self.locks[state.as_index()].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unbalanced {state:?} unlock");
        flag.held = None;
    }

    #[must_use]
    pub fn lock_count(&self, state: SleepState) -> u16 {
        self.locks[state.as_index()].load(Ordering::Acquire)
    }

    /// Deepest state currently allowed.
    #[must_use]
    pub fn max_state(&self) -> SleepState {
        let ceiling = self.profile.highest_allowed;
        SleepState::ALL
            .into_iter()
            .take_while(|state| *state < ceiling)
            .find(|state| self.lock_count(*state) > 0)
            .unwrap_or(ceiling)
    }

    /// Marks pins that must keep their configuration while asleep.
    pub fn exempt_pins(&self, mask: PinMask) {
        self.exempt.fetch_or(mask.bits(), Ordering::AcqRel);
    }

    pub fn release_pins(&self, mask: PinMask) {
        self.exempt.fetch_and(!mask.bits(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn exempt_mask(&self) -> PinMask {
        PinMask::from_bits(self.exempt.load(Ordering::Acquire))
    }

    /// Deepest allowed state whose latency fits in `delta` ticks, if any.
    #[must_use]
    pub fn select_state(&self, delta: i32) -> Option<(SleepState, StateLatency)> {
        let budget = Ticks::try_from(delta).ok()?;
        let max = self.max_state();

        let mut chosen = None;
        for state in SleepState::SLEEPING {
            if state > max {
                break;
            }
            let latency = self.profile.latency(state)?;
            if latency.threshold() > budget {
                break;
            }
            chosen = Some((state, latency));
        }
        chosen
    }

    /// Picks the sleep state for a wait until `target` and programs the
    /// wakeup comparator for it.
    ///
    /// When the early wakeup time is outside the comparator window the
    /// comparator stays disarmed; the counter overflow interrupt then wakes
    /// the core and the main loop re-evaluates.
    pub fn configure_wakeup<T: WakeupTimer>(&self, timer: &T, target: Instant) -> SleepState {
        let now = timer.now();
        match self.select_state(now.ticks_until(target)) {
            Some((state, latency)) => {
                timer.arm_wakeup(target.wrapping_sub(latency.exit), now);
                state
            }
            None => {
                timer.disarm_wakeup();
                SleepState::Run
            }
        }
    }

    /// Suspends the core in `state`. `Run` returns immediately.
    ///
    /// # Errors
    ///
    /// Propagates the backend failure; callers treat it as fatal.
    pub fn enter_state<B: LowPowerBackend>(
        &self,
        backend: &mut B,
        state: SleepState,
    ) -> Result<(), B::Error> {
        if state == SleepState::Run {
            return Ok(());
        }
        backend.enter(state, self.exempt_mask())
    }
}
