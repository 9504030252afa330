#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Application context handed to every job callback.
//!
//! Owns the input debouncer and the backlight. The backlight holds an `S1`
//! lock while lit because the display refresh needs the high-speed clocks.

use embedded_hal::digital::OutputPin;
use pocket_core::input::{InputContext, InputDebouncer, InputParts, InputPins};
use pocket_core::jobs::{Fired, JobApi, SharedScheduler, WakeTime};
use pocket_core::power::{LockFlag, PowerStateController};
use pocket_core::{Clock, InputChannel, InputEvent, Instant, Level, SleepState};

use crate::board::{
    BACKLIGHT_JOB, BACKLIGHT_TIMEOUT_MS, CHANNELS, INPUT_CONFIG, JOB_SLOTS, STATUS_JOB,
    STATUS_PERIOD_MS, TICK_RATE, wake_pins,
};
use crate::status::{StatusCounters, StatusSnapshot};

pub type Scheduler<P, L, T> = SharedScheduler<App<P, L, T>, JOB_SLOTS>;

pub struct App<P: 'static, L: 'static, T: 'static> {
    jobs: &'static Scheduler<P, L, T>,
    power: &'static PowerStateController,
    clock: &'static T,
    status: &'static StatusCounters,
    debouncer: InputDebouncer<Self>,
    pins: P,
    backlight: L,
    backlight_lock: LockFlag,
    last_report: (Instant, StatusSnapshot),
}

impl<P, L, T> App<P, L, T>
where
    P: InputPins,
    L: OutputPin,
    T: Clock,
{
    pub fn new(
        jobs: &'static Scheduler<P, L, T>,
        power: &'static PowerStateController,
        clock: &'static T,
        status: &'static StatusCounters,
        pins: P,
        backlight: L,
    ) -> Self {
        Self {
            jobs,
            power,
            clock,
            status,
            debouncer: InputDebouncer::new(INPUT_CONFIG),
            pins,
            backlight,
            backlight_lock: LockFlag::new(),
            last_report: (Instant::ZERO, StatusSnapshot::default()),
        }
    }

    /// Attaches every input line and starts the client jobs.
    pub fn start(&mut self) {
        for wiring in CHANNELS {
            self.debouncer
                .attach(&mut self.pins, wiring.channel, wiring.long_press);
        }
        self.debouncer.register_handler(Self::on_input);
        self.power.exempt_pins(wake_pins());

        let now = self.clock.now();
        self.last_report = (now, self.status.snapshot());
        self.jobs.schedule(
            STATUS_JOB,
            Self::status_elapsed,
            WakeTime::At(now + TICK_RATE.ticks_from_millis(STATUS_PERIOD_MS)),
        );
        self.backlight_on(now);
    }

    fn on_input(app: &mut Self, event: InputEvent) {
        app.status.record_input(event);
        log_input(event);

        let wakes_display = match event.channel {
            InputChannel::Left | InputChannel::Middle | InputChannel::Right => {
                event.state == Level::High && !event.long_press
            }
            InputChannel::VbusSense => event.state == Level::High,
            InputChannel::Charging => false,
        };
        if wakes_display {
            let now = app.clock.now();
            app.backlight_on(now);
        }
    }

    fn backlight_on(&mut self, now: Instant) {
        if self.backlight.set_high().is_err() {
            log_backlight_fault();
        }
        if !self.backlight_lock.is_held() {
            self.status.record_backlight_wake();
        }
        self.power
            .lock_max_state(SleepState::S1, &mut self.backlight_lock);
        self.jobs.schedule(
            BACKLIGHT_JOB,
            Self::backlight_elapsed,
            WakeTime::At(now + TICK_RATE.ticks_from_millis(BACKLIGHT_TIMEOUT_MS)),
        );
    }

    fn backlight_elapsed(app: &mut Self, _: Fired) {
        if app.backlight.set_low().is_err() {
            log_backlight_fault();
        }
        app.power
            .unlock_max_state(SleepState::S1, &mut app.backlight_lock);
    }

    fn status_elapsed(app: &mut Self, fired: Fired) {
        let now = app.clock.now();
        let snapshot = app.status.snapshot();
        let (since, previous) = app.last_report;
        let window = snapshot.since(&previous);
        let elapsed = now.ticks().wrapping_sub(since.ticks());
        log_status(&window, elapsed, app.power.max_state());
        app.last_report = (now, snapshot);

        if let WakeTime::At(at) = fired.wake {
            app.jobs.schedule(
                STATUS_JOB,
                Self::status_elapsed,
                WakeTime::At(at + TICK_RATE.ticks_from_millis(STATUS_PERIOD_MS)),
            );
        }
    }
}

impl<P, L, T> InputContext for App<P, L, T>
where
    P: InputPins,
    L: OutputPin,
    T: Clock,
{
    type Pins = P;
    type Jobs = Scheduler<P, L, T>;

    fn input_parts(&mut self) -> InputParts<'_, Self> {
        InputParts {
            debouncer: &mut self.debouncer,
            pins: &mut self.pins,
            jobs: self.jobs,
            now: self.clock.now(),
        }
    }
}

/// Channel and what happened to it, as both log builds print them.
fn describe_input(event: InputEvent) -> (&'static str, &'static str) {
    let what = if event.long_press {
        "long press"
    } else {
        event.state.label()
    };
    (event.channel.label(), what)
}

#[cfg(target_os = "none")]
fn log_input(event: InputEvent) {
    let (channel, what) = describe_input(event);
    defmt::info!("input: {} {}", channel, what);
}

#[cfg(not(target_os = "none"))]
fn log_input(event: InputEvent) {
    let (channel, what) = describe_input(event);
    println!("input: {channel} {what}");
}

#[cfg(target_os = "none")]
fn log_backlight_fault() {
    defmt::warn!("backlight: pin write failed");
}

#[cfg(not(target_os = "none"))]
fn log_backlight_fault() {}

#[cfg(target_os = "none")]
fn log_status(window: &StatusSnapshot, elapsed: u32, max_state: SleepState) {
    let [s1, s2, s3] =
        SleepState::SLEEPING.map(|state| window.residency_permille(state, elapsed));
    defmt::info!(
        "status: run={} s1={} s2={} s3={} (permille of {} ticks) inputs={} long={} wakes={} max={}",
        1_000u32.saturating_sub(s1 + s2 + s3),
        s1,
        s2,
        s3,
        elapsed,
        window.input_events,
        window.long_presses,
        window.backlight_wakes,
        max_state.label()
    );
}

#[cfg(not(target_os = "none"))]
fn log_status(_: &StatusSnapshot, _: u32, _: SleepState) {}

#[cfg(test)]
mod tests {
    use core::cell::Cell;
    use core::convert::Infallible;

    use embedded_hal::digital::ErrorType;
    use pocket_core::input::{Edge, edge_detected};
    use pocket_core::jobs::Job;

    use super::*;
    use crate::board::SLEEP_PROFILE;

    #[derive(Default)]
    struct FakeClock {
        now: Cell<u32>,
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            Instant::from_ticks(self.now.get())
        }
    }

    #[derive(Default)]
    struct FakePins {
        high: [bool; InputChannel::COUNT],
        armed: [Option<Edge>; InputChannel::COUNT],
    }

    impl InputPins for FakePins {
        fn level(&self, channel: InputChannel) -> Level {
            Level::from_high(self.high[channel.as_index()])
        }

        fn arm_edge(&mut self, channel: InputChannel, edge: Edge) {
            self.armed[channel.as_index()] = Some(edge);
        }
    }

    #[derive(Default)]
    struct FakeBacklight {
        lit: bool,
    }

    impl ErrorType for FakeBacklight {
        type Error = Infallible;
    }

    impl OutputPin for FakeBacklight {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.lit = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            self.lit = true;
            Ok(())
        }
    }

    type TestApp = App<FakePins, FakeBacklight, FakeClock>;

    const TIMEOUT: u32 = TICK_RATE.ticks_from_millis(BACKLIGHT_TIMEOUT_MS);
    const PERIOD: u32 = TICK_RATE.ticks_from_millis(STATUS_PERIOD_MS);

    fn started() -> TestApp {
        let mut app = App::new(
            Box::leak(Box::new(Scheduler::new())),
            Box::leak(Box::new(PowerStateController::new(SLEEP_PROFILE))),
            Box::leak(Box::new(FakeClock::default())),
            Box::leak(Box::new(StatusCounters::new())),
            FakePins::default(),
            FakeBacklight::default(),
        );
        app.start();
        app
    }

    /// Runs every job due by `ticks`, each at its own wake time.
    fn run_until(app: &mut TestApp, ticks: u32) {
        let deadline = Instant::from_ticks(ticks);
        loop {
            let due = app.jobs.lock(|queue| match queue.peek() {
                Some(head) if head.wake.is_due(deadline) => queue.pop(),
                _ => None,
            });
            let Some((fired, callback)) = due else {
                break;
            };
            if let WakeTime::At(at) = fired.wake {
                app.clock.now.set(at.ticks());
            }
            callback(app, fired);
        }
        app.clock.now.set(ticks);
    }

    fn press(app: &mut TestApp, channel: InputChannel) {
        app.pins.high[channel.as_index()] = true;
        edge_detected::<TestApp, _>(app.jobs, &INPUT_CONFIG, channel, app.clock.now());
        let settled = app.clock.now.get() + INPUT_CONFIG.debounce;
        run_until(app, settled);
    }

    fn wake_of(app: &TestApp, job: Job) -> Option<WakeTime> {
        app.jobs.lock(|queue| {
            queue
                .iter()
                .find(|fired| fired.job == job)
                .map(|fired| fired.wake)
        })
    }

    #[test]
    fn start_attaches_inputs_and_lights_backlight() {
        let app = started();

        assert!(app.backlight.lit);
        assert_eq!(app.power.lock_count(SleepState::S1), 1);
        assert_eq!(app.power.max_state(), SleepState::S1);
        assert_eq!(app.power.exempt_mask(), wake_pins());
        assert_eq!(app.pins.armed, [Some(Edge::Rising); InputChannel::COUNT]);
        assert_eq!(
            wake_of(&app, BACKLIGHT_JOB),
            Some(WakeTime::At(Instant::from_ticks(TIMEOUT)))
        );
        assert_eq!(
            wake_of(&app, STATUS_JOB),
            Some(WakeTime::At(Instant::from_ticks(PERIOD)))
        );
    }

    #[test]
    fn backlight_timeout_releases_sleep_lock() {
        let mut app = started();

        run_until(&mut app, TIMEOUT);

        assert!(!app.backlight.lit);
        assert_eq!(app.power.lock_count(SleepState::S1), 0);
        assert_eq!(app.power.max_state(), SleepState::S3);
    }

    #[test]
    fn button_press_restarts_backlight_timer() {
        let mut app = started();
        run_until(&mut app, TIMEOUT + 100);

        press(&mut app, InputChannel::Middle);
        let lit_at = TIMEOUT + 100 + INPUT_CONFIG.debounce;

        assert!(app.backlight.lit);
        assert_eq!(app.power.lock_count(SleepState::S1), 1);
        assert_eq!(
            wake_of(&app, BACKLIGHT_JOB),
            Some(WakeTime::At(Instant::from_ticks(lit_at + TIMEOUT)))
        );
        assert_eq!(app.status.snapshot().backlight_wakes, 2);
        assert_eq!(app.status.snapshot().input_events, 1);
    }

    #[test]
    fn repeated_presses_hold_a_single_lock() {
        let mut app = started();

        press(&mut app, InputChannel::Left);
        press(&mut app, InputChannel::Right);

        assert_eq!(app.power.lock_count(SleepState::S1), 1);
        assert_eq!(app.status.snapshot().backlight_wakes, 1);
    }

    #[test]
    fn charging_changes_leave_backlight_alone() {
        let mut app = started();
        run_until(&mut app, TIMEOUT);

        press(&mut app, InputChannel::Charging);

        assert!(!app.backlight.lit);
        assert_eq!(app.debouncer.state(InputChannel::Charging), Some(Level::High));
        assert_eq!(app.power.max_state(), SleepState::S3);
    }

    #[test]
    fn input_log_names_level_or_long_press() {
        let event = |state, long_press| InputEvent {
            channel: InputChannel::Left,
            state,
            long_press,
        };

        assert_eq!(describe_input(event(Level::High, false)), ("left", "high"));
        assert_eq!(describe_input(event(Level::Low, false)), ("left", "low"));
        assert_eq!(
            describe_input(event(Level::High, true)),
            ("left", "long press")
        );
    }

    #[test]
    fn status_job_keeps_its_period() {
        let mut app = started();

        run_until(&mut app, 3 * PERIOD + 1);

        assert_eq!(
            wake_of(&app, STATUS_JOB),
            Some(WakeTime::At(Instant::from_ticks(4 * PERIOD)))
        );
        assert_eq!(app.last_report.0, Instant::from_ticks(3 * PERIOD));
    }
}
