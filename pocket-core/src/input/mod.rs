//! Debounce and long-press detection built on the job scheduler.
//!
//! Each channel stores only its committed level. An edge interrupt (armed for
//! the edge leaving the committed level) schedules the channel's debounce job;
//! the "in flight" phase is nothing more than that job being queued. When the
//! job fires the raw level is sampled again: a changed level is committed and
//! reported, an unchanged one is resampled as soon as possible a bounded
//! number of times before the edge is dropped as a glitch.

use core::fmt;

use crate::jobs::{Fired, Job, JobApi, JobTag, WakeTime};
use crate::time::{Instant, TickRate, Ticks};

pub const DEBOUNCE_MS: u32 = 100;
pub const LONG_PRESS_MS: u32 = 1_000;
pub const DEFAULT_MAX_RESAMPLES: u8 = 8;

/// Physical signals watched by the debouncer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InputChannel {
    Left,
    Middle,
    Right,
    Charging,
    VbusSense,
}

impl InputChannel {
    pub const COUNT: usize = 5;
    pub const ALL: [InputChannel; Self::COUNT] = [
        InputChannel::Left,
        InputChannel::Middle,
        InputChannel::Right,
        InputChannel::Charging,
        InputChannel::VbusSense,
    ];

    #[must_use]
    pub const fn as_index(self) -> usize {
        match self {
            InputChannel::Left => 0,
            InputChannel::Middle => 1,
            InputChannel::Right => 2,
            InputChannel::Charging => 3,
            InputChannel::VbusSense => 4,
        }
    }

    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(InputChannel::Left),
            1 => Some(InputChannel::Middle),
            2 => Some(InputChannel::Right),
            3 => Some(InputChannel::Charging),
            4 => Some(InputChannel::VbusSense),
            _ => None,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            InputChannel::Left => "left",
            InputChannel::Middle => "middle",
            InputChannel::Right => "right",
            InputChannel::Charging => "charging",
            InputChannel::VbusSense => "vbus",
        }
    }

    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|channel| channel.label().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for InputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[must_use]
    pub const fn from_high(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }

    #[must_use]
    pub const fn is_high(self) -> bool {
        matches!(self, Level::High)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Level::Low => "low",
            Level::High => "high",
        }
    }

    /// Edge that leaves this level.
    #[must_use]
    pub const fn arming_edge(self) -> Edge {
        match self {
            Level::Low => Edge::Rising,
            Level::High => Edge::Falling,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    Rising,
    Falling,
}

/// Debounced transition delivered to the registered handler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InputEvent {
    pub channel: InputChannel,
    pub state: Level,
    pub long_press: bool,
}

/// GPIO access needed by the debouncer.
pub trait InputPins {
    fn level(&self, channel: InputChannel) -> Level;

    /// Arms the edge interrupt of `channel` for `edge` only.
    fn arm_edge(&mut self, channel: InputChannel, edge: Edge);
}

/// Debounce timing and the job slots reserved for input channels.
///
/// Each channel owns two consecutive slots starting at `first_slot`: the
/// debounce job and the long-press job.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InputConfig {
    pub first_slot: u8,
    pub debounce: Ticks,
    pub long_press: Ticks,
    pub max_resamples: u8,
}

impl InputConfig {
    /// Number of job slots the debouncer needs.
    #[allow(clippy::cast_possible_truncation)]
    pub const SLOTS: u8 = 2 * InputChannel::COUNT as u8;

    #[must_use]
    pub const fn new(first_slot: u8, rate: TickRate) -> Self {
        Self {
            first_slot,
            debounce: rate.ticks_from_millis(DEBOUNCE_MS),
            long_press: rate.ticks_from_millis(LONG_PRESS_MS),
            max_resamples: DEFAULT_MAX_RESAMPLES,
        }
    }

    #[must_use]
    pub const fn with_max_resamples(mut self, max_resamples: u8) -> Self {
        self.max_resamples = max_resamples;
        self
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn debounce_job(&self, channel: InputChannel) -> Job {
        Job::tagged(
            self.first_slot + 2 * channel.as_index() as u8,
            JobTag::Input(channel),
        )
    }

    #[must_use]
    pub const fn long_press_job(&self, channel: InputChannel) -> Job {
        let debounce = self.debounce_job(channel);
        Job::tagged(debounce.slot + 1, JobTag::Input(channel))
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self::new(0, TickRate::MILLIS)
    }
}

pub type InputHandler<C> = fn(&mut C, InputEvent);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct ChannelState {
    committed: Level,
    long_press_enabled: bool,
    resamples: u8,
}

/// Committed levels of every attached channel plus the event handler.
pub struct InputDebouncer<C> {
    config: InputConfig,
    channels: [Option<ChannelState>; InputChannel::COUNT],
    handler: Option<InputHandler<C>>,
}

impl<C> InputDebouncer<C> {
    #[must_use]
    pub const fn new(config: InputConfig) -> Self {
        Self {
            config,
            channels: [None; InputChannel::COUNT],
            handler: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &InputConfig {
        &self.config
    }

    /// Starts tracking `channel` from its current raw level.
    pub fn attach<P: InputPins>(
        &mut self,
        pins: &mut P,
        channel: InputChannel,
        long_press_enabled: bool,
    ) {
        let level = pins.level(channel);
        self.channels[channel.as_index()] = Some(ChannelState {
            committed: level,
            long_press_enabled,
            resamples: 0,
        });
        pins.arm_edge(channel, level.arming_edge());
    }

    pub fn register_handler(&mut self, handler: InputHandler<C>) {
        self.handler = Some(handler);
    }

    /// Committed level of `channel`, `None` when it was never attached.
    #[must_use]
    pub fn state(&self, channel: InputChannel) -> Option<Level> {
        self.channels[channel.as_index()].map(|state| state.committed)
    }
}

impl<C: InputContext> InputDebouncer<C> {
    fn settle<P, J>(
        &mut self,
        channel: InputChannel,
        wake: WakeTime,
        pins: &mut P,
        jobs: &J,
        now: Instant,
    ) -> Option<InputEvent>
    where
        P: InputPins,
        J: JobApi<C> + ?Sized,
    {
        let config = self.config;
        let state = self.channels[channel.as_index()].as_mut()?;

        // A timed wake starts a fresh debounce window.
        if matches!(wake, WakeTime::At(_)) {
            state.resamples = 0;
        }

        let raw = pins.level(channel);
        if raw == state.committed {
            if state.resamples < config.max_resamples {
                state.resamples += 1;
                jobs.schedule(
                    config.debounce_job(channel),
                    debounce_elapsed::<C>,
                    WakeTime::Asap,
                );
            }
            return None;
        }

        state.committed = raw;
        state.resamples = 0;
        pins.arm_edge(channel, raw.arming_edge());

        match raw {
            Level::High if state.long_press_enabled => jobs.schedule(
                config.long_press_job(channel),
                long_press_elapsed::<C>,
                WakeTime::At(now.wrapping_add(config.long_press)),
            ),
            Level::High => {}
            Level::Low => {
                jobs.cancel(config.long_press_job(channel));
            }
        }

        Some(InputEvent {
            channel,
            state: raw,
            long_press: false,
        })
    }
}

/// Borrowed pieces of the application context used by the input callbacks.
pub struct InputParts<'a, C: InputContext> {
    pub debouncer: &'a mut InputDebouncer<C>,
    pub pins: &'a mut C::Pins,
    pub jobs: &'a C::Jobs,
    pub now: Instant,
}

/// Application context that owns an [`InputDebouncer`].
pub trait InputContext: Sized {
    type Pins: InputPins;
    type Jobs: JobApi<Self> + ?Sized;

    fn input_parts(&mut self) -> InputParts<'_, Self>;
}

/// Edge interrupt entry point: (re)starts the debounce window of `channel`.
pub fn edge_detected<C, J>(jobs: &J, config: &InputConfig, channel: InputChannel, now: Instant)
where
    C: InputContext,
    J: JobApi<C> + ?Sized,
{
    jobs.schedule(
        config.debounce_job(channel),
        debounce_elapsed::<C>,
        WakeTime::At(now.wrapping_add(config.debounce)),
    );
}

/// Debounce job callback.
pub fn debounce_elapsed<C: InputContext>(ctx: &mut C, fired: Fired) {
    let JobTag::Input(channel) = fired.job.tag else {
        return;
    };

    let dispatch = {
        let parts = ctx.input_parts();
        let event = parts
            .debouncer
            .settle(channel, fired.wake, parts.pins, parts.jobs, parts.now);
        event.zip(parts.debouncer.handler)
    };

    if let Some((event, handler)) = dispatch {
        handler(ctx, event);
    }
}

/// Long-press job callback.
pub fn long_press_elapsed<C: InputContext>(ctx: &mut C, fired: Fired) {
    let JobTag::Input(channel) = fired.job.tag else {
        return;
    };

    let handler = {
        let parts = ctx.input_parts();
        if parts.debouncer.state(channel) != Some(Level::High) {
            return;
        }
        parts.debouncer.handler
    };

    if let Some(handler) = handler {
        handler(
            ctx,
            InputEvent {
                channel,
                state: Level::High,
                long_press: true,
            },
        );
    }
}
