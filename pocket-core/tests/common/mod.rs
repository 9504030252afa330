#![allow(dead_code)]

use core::cell::{Cell, RefCell};
use core::convert::Infallible;

use heapless::Vec;
use pocket_core::input::{
    Edge, InputConfig, InputContext, InputDebouncer, InputEvent, InputParts, InputPins,
    edge_detected,
};
use pocket_core::jobs::{MainLoop, SharedScheduler, Step};
use pocket_core::power::{
    LowPowerBackend, PinMask, PowerStateController, SleepProfile, SleepState, StateLatency,
};
use pocket_core::time::{Clock, Instant, WakeupTimer};
use pocket_core::{InputChannel, Level};

pub const SLOTS: usize = 24;
pub const COMPARE_WINDOW: u32 = 0xFFFF;

/// Latencies of the production handheld board.
pub const PROFILE: SleepProfile = SleepProfile::new(
    [
        StateLatency::new(5, 2),
        StateLatency::new(5, 3),
        StateLatency::new(5, 3),
    ],
    SleepState::S3,
);

/// Clock that only moves when the bench or a sleeping backend moves it.
#[derive(Default)]
pub struct FakeClock {
    now: Cell<u32>,
    armed: Cell<Option<u32>>,
    horizon: Cell<Option<u32>>,
}

impl FakeClock {
    pub fn set(&self, ticks: u32) {
        self.now.set(ticks);
    }

    pub fn advance(&self, ticks: u32) {
        self.now.set(self.now.get().wrapping_add(ticks));
    }

    pub fn armed(&self) -> Option<Instant> {
        self.armed.get().map(Instant::from_ticks)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.now.get())
    }

    fn wait_until(&self, deadline: Instant) {
        if self.now().ticks_until(deadline) > 0 {
            self.now.set(deadline.ticks());
        }
    }
}

impl WakeupTimer for FakeClock {
    fn arm_wakeup(&self, at: Instant, now: Instant) -> bool {
        let period_start = now.ticks() & !COMPARE_WINDOW;
        if at.ticks().wrapping_sub(period_start) <= COMPARE_WINDOW {
            self.armed.set(Some(at.ticks()));
            true
        } else {
            self.armed.set(None);
            false
        }
    }

    fn disarm_wakeup(&self) {
        self.armed.set(None);
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Transition {
    pub at: u32,
    pub channel: InputChannel,
    pub level: Level,
}

/// Raw pin levels over time.
#[derive(Default)]
pub struct Script {
    initial: Cell<[Option<Level>; InputChannel::COUNT]>,
    transitions: RefCell<Vec<Transition, 64>>,
    delivered: Cell<usize>,
}

impl Script {
    pub fn initial(&self, channel: InputChannel, level: Level) {
        let mut initial = self.initial.get();
        initial[channel.as_index()] = Some(level);
        self.initial.set(initial);
    }

    /// Adds a transition, keeping the script ordered by time.
    pub fn push(&self, at: u32, channel: InputChannel, level: Level) {
        let mut transitions = self.transitions.borrow_mut();
        let position = transitions
            .iter()
            .position(|existing| existing.at > at)
            .unwrap_or(transitions.len());
        transitions
            .insert(position, Transition { at, channel, level })
            .expect("script capacity");
    }

    pub fn level_at(&self, channel: InputChannel, at: u32) -> Level {
        let initial = self.initial.get()[channel.as_index()].unwrap_or(Level::Low);
        self.transitions
            .borrow()
            .iter()
            .rev()
            .find(|t| t.channel == channel && t.at <= at)
            .map_or(initial, |t| t.level)
    }

    fn next_after(&self, now: u32) -> Option<u32> {
        self.transitions
            .borrow()
            .iter()
            .skip(self.delivered.get())
            .map(|t| t.at)
            .find(|at| *at > now)
    }

    /// Next undelivered transition at or before `now`, with the level the
    /// channel had just before it.
    fn take_due(&self, now: u32) -> Option<(Transition, Level)> {
        let transitions = self.transitions.borrow();
        let delivered = self.delivered.get();
        let next = *transitions.get(delivered)?;
        if next.at > now {
            return None;
        }
        self.delivered.set(delivered + 1);

        let before = transitions[..delivered]
            .iter()
            .rev()
            .find(|t| t.channel == next.channel)
            .map(|t| t.level)
            .or(self.initial.get()[next.channel.as_index()])
            .unwrap_or(Level::Low);
        Some((next, before))
    }
}

pub struct ScriptPins {
    script: &'static Script,
    clock: &'static FakeClock,
    armed: [Option<Edge>; InputChannel::COUNT],
}

impl ScriptPins {
    pub fn armed(&self, channel: InputChannel) -> Option<Edge> {
        self.armed[channel.as_index()]
    }
}

impl InputPins for ScriptPins {
    fn level(&self, channel: InputChannel) -> Level {
        self.script.level_at(channel, self.clock.now().ticks())
    }

    fn arm_edge(&mut self, channel: InputChannel, edge: Edge) {
        self.armed[channel.as_index()] = Some(edge);
    }
}

/// Sleeps by fast-forwarding the clock to the first wake source.
pub struct FakeBackend {
    clock: &'static FakeClock,
    script: &'static Script,
    profile: SleepProfile,
    pub entries: [u32; SleepState::COUNT],
    pub last_exempt: PinMask,
}

impl LowPowerBackend for FakeBackend {
    type Error = Infallible;

    fn enter(&mut self, state: SleepState, exempt: PinMask) -> Result<(), Self::Error> {
        self.entries[state.as_index()] += 1;
        self.last_exempt = exempt;

        let now = self.clock.now.get();
        let exit = self.profile.latency(state).map_or(0, |latency| latency.exit);
        let mut wake = (now | COMPARE_WINDOW).wrapping_add(1);
        let mut consider = |candidate: u32| {
            if Instant::from_ticks(candidate).ticks_until(Instant::from_ticks(wake)) > 0 {
                wake = candidate;
            }
        };

        if let Some(at) = self.clock.armed.get() {
            consider(at.wrapping_add(exit));
        }
        if let Some(edge) = self.script.next_after(now) {
            consider(edge);
        }
        if let Some(horizon) = self.clock.horizon.get() {
            consider(horizon);
        }

        if Instant::from_ticks(now).ticks_until(Instant::from_ticks(wake)) > 0 {
            self.clock.now.set(wake);
        }
        Ok(())
    }

    fn fatal(&mut self, error: Self::Error) -> ! {
        match error {}
    }
}

/// Application context used by the scenarios.
pub struct Bench {
    pub jobs: &'static SharedScheduler<Bench, SLOTS>,
    pub clock: &'static FakeClock,
    pub debouncer: InputDebouncer<Bench>,
    pub pins: ScriptPins,
    pub events: Vec<(u32, InputEvent), 32>,
    pub runs: Vec<(u8, u32), 64>,
}

impl InputContext for Bench {
    type Pins = ScriptPins;
    type Jobs = SharedScheduler<Bench, SLOTS>;

    fn input_parts(&mut self) -> InputParts<'_, Self> {
        InputParts {
            debouncer: &mut self.debouncer,
            pins: &mut self.pins,
            jobs: self.jobs,
            now: self.clock.now(),
        }
    }
}

fn record_event(bench: &mut Bench, event: InputEvent) {
    let now = bench.clock.now().ticks();
    bench.events.push((now, event)).expect("event log capacity");
}

pub struct Harness {
    pub ctx: Bench,
    pub jobs: &'static SharedScheduler<Bench, SLOTS>,
    pub power: &'static PowerStateController,
    pub clock: &'static FakeClock,
    pub script: &'static Script,
    main: MainLoop<'static, Bench, FakeClock, FakeBackend, SLOTS>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_profile(PROFILE, InputConfig::default())
    }

    pub fn with_profile(profile: SleepProfile, input: InputConfig) -> Self {
        let jobs: &'static SharedScheduler<Bench, SLOTS> = Box::leak(Box::new(SharedScheduler::new()));
        let power: &'static PowerStateController =
            Box::leak(Box::new(PowerStateController::new(profile)));
        let clock: &'static FakeClock = Box::leak(Box::new(FakeClock::default()));
        let script: &'static Script = Box::leak(Box::new(Script::default()));

        let mut debouncer = InputDebouncer::new(input);
        debouncer.register_handler(record_event);

        let ctx = Bench {
            jobs,
            clock,
            debouncer,
            pins: ScriptPins {
                script,
                clock,
                armed: [None; InputChannel::COUNT],
            },
            events: Vec::new(),
            runs: Vec::new(),
        };
        let backend = FakeBackend {
            clock,
            script,
            profile,
            entries: [0; SleepState::COUNT],
            last_exempt: PinMask::EMPTY,
        };

        Self {
            ctx,
            jobs,
            power,
            clock,
            script,
            main: MainLoop::new(jobs, power, clock, backend),
        }
    }

    pub fn attach(&mut self, channel: InputChannel, long_press_enabled: bool) {
        let Bench {
            debouncer, pins, ..
        } = &mut self.ctx;
        debouncer.attach(pins, channel, long_press_enabled);
    }

    pub fn now(&self) -> u32 {
        self.clock.now().ticks()
    }

    pub fn backend(&self) -> &FakeBackend {
        self.main.backend()
    }

    pub fn step(&mut self) -> Step {
        let Ok(step) = self.main.step(&mut self.ctx);
        if step == Step::Idle {
            self.clock.advance(1);
        }
        step
    }

    /// Runs the main loop, delivering scripted edges, until `deadline`.
    pub fn run_until(&mut self, deadline: u32) {
        self.clock.horizon.set(Some(deadline));
        loop {
            self.deliver_edges();
            if self.clock.now().has_reached(Instant::from_ticks(deadline)) {
                break;
            }
            self.step();
        }
        self.clock.horizon.set(None);
    }

    fn deliver_edges(&mut self) {
        let now = self.now();
        while let Some((transition, before)) = self.script.take_due(now) {
            if before == transition.level {
                continue;
            }
            let edge = match transition.level {
                Level::High => Edge::Rising,
                Level::Low => Edge::Falling,
            };
            if self.ctx.pins.armed(transition.channel) == Some(edge) {
                edge_detected::<Bench, _>(
                    self.jobs,
                    self.ctx.debouncer.config(),
                    transition.channel,
                    Instant::from_ticks(transition.at),
                );
            }
        }
    }
}
