//! Host model of the handheld: a 16-bit counter behind the real [`TimeBase`],
//! a sleep backend that fast-forwards to the next wake source, scripted GPIO
//! levels, and the periodic render and emulation clients.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::convert::Infallible;

use pocket_core::input::{
    self, Edge, InputConfig, InputContext, InputDebouncer, InputParts, InputPins,
};
use pocket_core::jobs::{Fired, Job, JobApi, JobTag, MainLoop, SharedScheduler, Step, WakeTime};
use pocket_core::power::{
    LowPowerBackend, PinMask, PowerStateController, SleepProfile, SleepState, StateLatency,
};
use pocket_core::time::{Clock, Counter, TimeBase, WakeupTimer};
use pocket_core::{InputChannel, InputEvent, Instant, Level, TickRate, Ticks};

pub const SLOTS: usize = 16;

const RENDER_SLOT: u8 = 0;
const EMULATION_SLOT: u8 = 1;
const FIRST_INPUT_SLOT: u8 = 2;

const RENDER_ID: u8 = 1;
const EMULATION_ID: u8 = 2;

const RENDER: Job = Job::tagged(RENDER_SLOT, JobTag::Client(RENDER_ID));
const EMULATION: Job = Job::tagged(EMULATION_SLOT, JobTag::Client(EMULATION_ID));

const RENDER_PERIOD_MS: u32 = 50;
const EMULATION_PERIOD_MS: u32 = 10;
const EMULATION_BURST_MS: u32 = 3;
const BOUNCE_SPACING_MS: u32 = 5;

/// Sleep latencies of the simulated board, in ticks.
pub const SIM_PROFILE: SleepProfile = SleepProfile::new(
    [
        StateLatency::new(1, 1),
        StateLatency::new(2, 2),
        StateLatency::new(4, 6),
    ],
    SleepState::S3,
);

const COUNTER_MASK: u32 = 0xFFFF;

type Scheduler = SharedScheduler<Handheld, SLOTS>;

#[derive(Default)]
pub struct SimCounter {
    ticks: Cell<u32>,
    pending: Cell<bool>,
    compare: Cell<Option<u32>>,
}

impl Counter for SimCounter {
    const BITS: u32 = 16;

    fn count(&self) -> u32 {
        self.ticks.get() & COUNTER_MASK
    }

    fn overflow_pending(&self) -> bool {
        self.pending.get()
    }

    fn set_compare(&self, value: u32) {
        self.compare.set(Some(value));
    }

    fn disable_compare(&self) {
        self.compare.set(None);
    }
}

/// Simulated time. Only moves when sleeping, busy-waiting or burning work.
pub struct SimTimer {
    base: TimeBase<SimCounter>,
}

impl SimTimer {
    fn new() -> Self {
        Self {
            base: TimeBase::new(SimCounter::default()),
        }
    }

    /// Moves time forward, raising the overflow interrupt at each wrap.
    pub fn advance_to(&self, target: Instant) {
        let counter = self.base.counter();
        loop {
            let now = Instant::from_ticks(counter.ticks.get());
            let remaining = now.ticks_until(target);
            if remaining <= 0 {
                return;
            }

            let boundary = Instant::from_ticks((now.ticks() | COUNTER_MASK).wrapping_add(1));
            if now.ticks_until(boundary) <= remaining {
                counter.ticks.set(boundary.ticks());
                counter.pending.set(true);
                // Overflow ISR: acknowledge, then extend.
                counter.pending.set(false);
                self.base.on_overflow();
            } else {
                counter.ticks.set(target.ticks());
            }
        }
    }

    pub fn advance(&self, ticks: Ticks) {
        self.advance_to(self.now().wrapping_add(ticks));
    }

    fn compare_at(&self) -> Option<Instant> {
        let counter = self.base.counter();
        let low = counter.compare.get()?;
        Some(Instant::from_ticks(
            (counter.ticks.get() & !COUNTER_MASK) | low,
        ))
    }
}

impl Clock for SimTimer {
    fn now(&self) -> Instant {
        self.base.get()
    }

    fn wait_until(&self, deadline: Instant) {
        self.advance_to(deadline);
    }
}

impl WakeupTimer for SimTimer {
    fn arm_wakeup(&self, at: Instant, now: Instant) -> bool {
        self.base.arm_wakeup(at, now)
    }

    fn disarm_wakeup(&self) {
        self.base.disarm_wakeup();
    }
}

#[derive(Copy, Clone, Debug)]
struct Transition {
    at: Instant,
    channel: InputChannel,
    level: Level,
}

/// Raw pin levels plus transitions queued for the future.
#[derive(Default)]
pub struct Stimuli {
    levels: Cell<[Option<Level>; InputChannel::COUNT]>,
    pending: RefCell<VecDeque<Transition>>,
    horizon: Cell<Option<Instant>>,
}

impl Stimuli {
    fn level(&self, channel: InputChannel) -> Level {
        self.levels.get()[channel.as_index()].unwrap_or(Level::Low)
    }

    fn set_level(&self, channel: InputChannel, level: Level) {
        let mut levels = self.levels.get();
        levels[channel.as_index()] = Some(level);
        self.levels.set(levels);
    }

    fn push(&self, at: Instant, channel: InputChannel, level: Level) {
        let mut pending = self.pending.borrow_mut();
        let position = pending
            .iter()
            .position(|existing| at.ticks_until(existing.at) > 0)
            .unwrap_or(pending.len());
        pending.insert(position, Transition { at, channel, level });
    }

    fn next_at(&self) -> Option<Instant> {
        self.pending.borrow().front().map(|transition| transition.at)
    }

    fn take_due(&self, now: Instant) -> Option<Transition> {
        let mut pending = self.pending.borrow_mut();
        if pending.front()?.at.ticks_until(now) >= 0 {
            pending.pop_front()
        } else {
            None
        }
    }
}

pub struct SimPins {
    stimuli: &'static Stimuli,
    armed: [Option<Edge>; InputChannel::COUNT],
}

impl InputPins for SimPins {
    fn level(&self, channel: InputChannel) -> Level {
        self.stimuli.level(channel)
    }

    fn arm_edge(&mut self, channel: InputChannel, edge: Edge) {
        self.armed[channel.as_index()] = Some(edge);
    }
}

/// Time spent in, and number of entries into, each sleep state.
#[derive(Copy, Clone, Debug, Default)]
pub struct Residency {
    pub ticks: [u64; SleepState::COUNT],
    pub entries: [u64; SleepState::COUNT],
}

pub struct SimBackend {
    timer: &'static SimTimer,
    stimuli: &'static Stimuli,
    profile: SleepProfile,
    residency: Residency,
}

impl LowPowerBackend for SimBackend {
    type Error = Infallible;

    fn enter(&mut self, state: SleepState, _exempt: PinMask) -> Result<(), Self::Error> {
        let now = self.timer.now();
        let exit = self.profile.latency(state).map_or(0, |latency| latency.exit);

        let mut wake = Instant::from_ticks((now.ticks() | COUNTER_MASK).wrapping_add(1));
        let mut consider = |candidate: Instant| {
            if now.ticks_until(candidate) >= 0 && candidate.ticks_until(wake) > 0 {
                wake = candidate;
            }
        };
        if let Some(compare) = self
            .timer
            .compare_at()
            .filter(|compare| now.ticks_until(*compare) >= 0)
        {
            consider(compare.wrapping_add(exit));
        }
        if let Some(edge) = self.stimuli.next_at() {
            consider(edge);
        }
        if let Some(horizon) = self.stimuli.horizon.get() {
            consider(horizon);
        }

        self.timer.advance_to(wake);

        let index = state.as_index();
        self.residency.ticks[index] += u64::from(now.ticks_until(wake).unsigned_abs());
        self.residency.entries[index] += 1;
        Ok(())
    }

    fn fatal(&mut self, error: Self::Error) -> ! {
        match error {}
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct EmulationStats {
    pub slices: u64,
    pub yields: u64,
    remaining: Ticks,
    frame_start: Option<Instant>,
}

/// Application context handed to every job.
pub struct Handheld {
    jobs: &'static Scheduler,
    timer: &'static SimTimer,
    rate: TickRate,
    debouncer: InputDebouncer<Handheld>,
    pins: SimPins,
    frames: u64,
    emulation: EmulationStats,
    log: Vec<String>,
}

impl Handheld {
    fn stamp(&self) -> u32 {
        self.rate.millis_from_ticks(self.timer.now().ticks())
    }
}

impl InputContext for Handheld {
    type Pins = SimPins;
    type Jobs = Scheduler;

    fn input_parts(&mut self) -> InputParts<'_, Self> {
        InputParts {
            debouncer: &mut self.debouncer,
            pins: &mut self.pins,
            jobs: self.jobs,
            now: self.timer.now(),
        }
    }
}

fn on_input(ctx: &mut Handheld, event: InputEvent) {
    let what = if event.long_press {
        "long-press".to_string()
    } else {
        event.state.to_string()
    };
    let line = format!("[{:>8}ms] input {} {what}", ctx.stamp(), event.channel);
    ctx.log.push(line);
}

fn render(ctx: &mut Handheld, fired: Fired) {
    ctx.frames += 1;
    let period = ctx.rate.ticks_from_millis(RENDER_PERIOD_MS);
    let next = match fired.wake {
        WakeTime::At(at) => at.wrapping_add(period),
        WakeTime::Asap => ctx.timer.now().wrapping_add(period),
    };
    ctx.jobs.schedule(RENDER, render, WakeTime::At(next));
}

/// Burns a fixed amount of CPU time per frame in one-tick slices, yielding
/// to any job that becomes due in the middle of it.
fn emulate(ctx: &mut Handheld, _fired: Fired) {
    let now = ctx.timer.now();
    let frame_start = match ctx.emulation.frame_start {
        Some(start) => start,
        None => {
            ctx.emulation.remaining = ctx.rate.ticks_from_millis(EMULATION_BURST_MS);
            ctx.emulation.frame_start = Some(now);
            now
        }
    };

    while ctx.emulation.remaining > 0 {
        ctx.timer.advance(1);
        ctx.emulation.remaining -= 1;
        ctx.emulation.slices += 1;

        let now = ctx.timer.now();
        if ctx.emulation.remaining > 0 && ctx.jobs.should_yield(now) {
            ctx.emulation.yields += 1;
            ctx.jobs.schedule(EMULATION, emulate, WakeTime::At(now));
            return;
        }
    }

    ctx.emulation.frame_start = None;
    let period = ctx.rate.ticks_from_millis(EMULATION_PERIOD_MS);
    ctx.jobs.schedule(
        EMULATION,
        emulate,
        WakeTime::At(frame_start.wrapping_add(period)),
    );
}

/// Snapshot of the simulated device for `status`.
pub struct Status {
    pub now: Instant,
    pub millis: u32,
    pub max_state: SleepState,
    pub locks: [u16; SleepState::COUNT],
    pub queue: Vec<String>,
    pub inputs: Vec<(InputChannel, Option<Level>)>,
    pub residency: Residency,
    pub frames: u64,
    pub emulation: EmulationStats,
}

pub struct Simulator {
    ctx: Handheld,
    main: MainLoop<'static, Handheld, SimTimer, SimBackend, SLOTS>,
    jobs: &'static Scheduler,
    power: &'static PowerStateController,
    timer: &'static SimTimer,
    stimuli: &'static Stimuli,
    input: InputConfig,
}

impl Simulator {
    pub fn new(rate: TickRate) -> Self {
        let jobs: &'static Scheduler = Box::leak(Box::new(SharedScheduler::new()));
        let power: &'static PowerStateController =
            Box::leak(Box::new(PowerStateController::new(SIM_PROFILE)));
        let timer: &'static SimTimer = Box::leak(Box::new(SimTimer::new()));
        let stimuli: &'static Stimuli = Box::leak(Box::new(Stimuli::default()));
        let input = InputConfig::new(FIRST_INPUT_SLOT, rate);

        let mut ctx = Handheld {
            jobs,
            timer,
            rate,
            debouncer: InputDebouncer::new(input),
            pins: SimPins {
                stimuli,
                armed: [None; InputChannel::COUNT],
            },
            frames: 0,
            emulation: EmulationStats::default(),
            log: Vec::new(),
        };
        ctx.debouncer.register_handler(on_input);
        for channel in InputChannel::ALL {
            let long_press = matches!(
                channel,
                InputChannel::Left | InputChannel::Middle | InputChannel::Right
            );
            ctx.debouncer.attach(&mut ctx.pins, channel, long_press);
        }

        jobs.schedule(RENDER, render, WakeTime::Asap);
        jobs.schedule(EMULATION, emulate, WakeTime::Asap);

        let backend = SimBackend {
            timer,
            stimuli,
            profile: SIM_PROFILE,
            residency: Residency::default(),
        };

        Self {
            ctx,
            main: MainLoop::new(jobs, power, timer, backend),
            jobs,
            power,
            timer,
            stimuli,
            input,
        }
    }

    pub fn rate(&self) -> TickRate {
        self.ctx.rate
    }

    pub fn power(&self) -> &PowerStateController {
        self.power
    }

    pub fn level(&self, channel: InputChannel) -> Level {
        self.stimuli.level(channel)
    }

    /// Drives `channel` to `level` now and, when `hold` is set, back again
    /// after `hold` ticks.
    pub fn drive(&mut self, channel: InputChannel, level: Level, hold: Option<Ticks>) {
        let now = self.timer.now();
        let previous = self.stimuli.level(channel);
        self.stimuli.push(now, channel, level);
        if let Some(hold) = hold {
            self.stimuli.push(now.wrapping_add(hold), channel, previous);
        }
        self.deliver_edges();
    }

    /// Toggles `channel` `2 * edges + 1` times a few milliseconds apart so it
    /// settles on the opposite level.
    pub fn bounce(&mut self, channel: InputChannel, edges: u8) {
        let spacing = self.ctx.rate.ticks_from_millis(BOUNCE_SPACING_MS);
        let mut at = self.timer.now();
        let mut level = self.stimuli.level(channel);
        for _ in 0..=(u32::from(edges) * 2) {
            level = match level {
                Level::Low => Level::High,
                Level::High => Level::Low,
            };
            self.stimuli.push(at, channel, level);
            at = at.wrapping_add(spacing);
        }
        self.deliver_edges();
    }

    /// Runs the main loop for `ticks` of simulated time.
    pub fn run_for(&mut self, ticks: Ticks) {
        let deadline = self.timer.now().wrapping_add(ticks);
        self.stimuli.horizon.set(Some(deadline));
        loop {
            self.deliver_edges();
            if self.timer.now().has_reached(deadline) {
                break;
            }
            let Ok(step) = self.main.step(&mut self.ctx);
            if step == Step::Idle {
                self.timer.advance(1);
            }
        }
        self.stimuli.horizon.set(None);
    }

    pub fn drain_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.ctx.log)
    }

    pub fn status(&self) -> Status {
        let now = self.timer.now();
        let queue: Vec<String> = self
            .jobs
            .lock(|queue| queue.iter().map(|fired| self.describe(fired, now)).collect());
        let inputs: Vec<_> = InputChannel::ALL
            .into_iter()
            .map(|channel| (channel, self.ctx.debouncer.state(channel)))
            .collect();
        let locks = SleepState::ALL.map(|state| self.power.lock_count(state));

        Status {
            now,
            millis: self.ctx.stamp(),
            max_state: self.power.max_state(),
            locks,
            queue,
            inputs,
            residency: self.main.backend().residency,
            frames: self.ctx.frames,
            emulation: self.ctx.emulation,
        }
    }

    fn describe(&self, fired: Fired, now: Instant) -> String {
        let name = match fired.job.tag {
            JobTag::Client(RENDER_ID) => "render".to_string(),
            JobTag::Client(EMULATION_ID) => "emulation".to_string(),
            JobTag::Input(channel) if fired.job == self.input.long_press_job(channel) => {
                format!("{channel}-long-press")
            }
            JobTag::Input(channel) => format!("{channel}-debounce"),
            JobTag::Client(id) => format!("client-{id}"),
            JobTag::Untagged => format!("slot-{}", fired.job.slot),
        };
        match fired.wake {
            WakeTime::Asap => format!("{name}@asap"),
            WakeTime::At(at) => {
                let ticks = now.ticks_until(at);
                let ms = self.ctx.rate.millis_from_ticks(ticks.unsigned_abs());
                if ticks < 0 {
                    format!("{name}@-{ms}ms")
                } else {
                    format!("{name}@+{ms}ms")
                }
            }
        }
    }

    fn deliver_edges(&mut self) {
        let now = self.timer.now();
        while let Some(transition) = self.stimuli.take_due(now) {
            let previous = self.stimuli.level(transition.channel);
            self.stimuli.set_level(transition.channel, transition.level);
            if previous == transition.level {
                continue;
            }
            let edge = match transition.level {
                Level::High => Edge::Rising,
                Level::Low => Edge::Falling,
            };
            if self.ctx.pins.armed[transition.channel.as_index()] == Some(edge) {
                input::edge_detected::<Handheld, _>(
                    self.jobs,
                    &self.input,
                    transition.channel,
                    transition.at,
                );
            }
        }
    }
}
