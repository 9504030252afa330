#![cfg_attr(not(target_os = "none"), allow(dead_code))]

//! Board constants for the handheld: tick source, sleep latencies, input
//! wiring and job slot layout.

use pocket_core::input::InputConfig;
use pocket_core::jobs::{Job, JobTag};
use pocket_core::power::{PinMask, SleepProfile, SleepState, StateLatency};
use pocket_core::{InputChannel, TickRate};

/// LPTIM1 clocked from LSE / 4.
pub const TICK_RATE: TickRate = TickRate::from_hz(32_768 / 4);

/// Entry/exit latencies of sleep, stop 0 and stop 1 (with GPIO parking), in
/// ticks.
pub const SLEEP_PROFILE: SleepProfile = SleepProfile::new(
    [
        StateLatency::new(5, 2),
        StateLatency::new(5, 3),
        StateLatency::new(5, 3),
    ],
    SleepState::S3,
);

const _: () = assert!(
    SLEEP_PROFILE.validate().is_ok(),
    "sleep thresholds must not decrease with depth"
);

pub const BACKLIGHT_JOB: Job = Job::tagged(0, JobTag::Client(0));
pub const STATUS_JOB: Job = Job::tagged(1, JobTag::Client(1));

/// Debounce and long-press jobs follow the client jobs.
pub const INPUT_CONFIG: InputConfig = InputConfig::new(2, TICK_RATE);

pub const JOB_SLOTS: usize = INPUT_CONFIG.first_slot as usize + InputConfig::SLOTS as usize;

pub const BACKLIGHT_TIMEOUT_MS: u32 = 10_000;
pub const STATUS_PERIOD_MS: u32 = 60_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Port {
    A,
    B,
}

impl Port {
    pub const fn index(self) -> u8 {
        match self {
            Port::A => 0,
            Port::B => 1,
        }
    }
}

/// One debounced input line.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelWiring {
    pub channel: InputChannel,
    pub port: Port,
    /// Pin number, which is also the EXTI line.
    pub pin: u8,
    pub long_press: bool,
}

impl ChannelWiring {
    const fn new(channel: InputChannel, port: Port, pin: u8, long_press: bool) -> Self {
        Self {
            channel,
            port,
            pin,
            long_press,
        }
    }

    /// Bit of this line in a [`PinMask`]: 16 bits per port.
    pub const fn mask(self) -> PinMask {
        PinMask::pin(self.port.index() * 16 + self.pin)
    }
}

/// Indexed by [`InputChannel::as_index`].
pub const CHANNELS: [ChannelWiring; InputChannel::COUNT] = [
    ChannelWiring::new(InputChannel::Left, Port::A, 0, true),
    ChannelWiring::new(InputChannel::Middle, Port::A, 1, true),
    ChannelWiring::new(InputChannel::Right, Port::A, 2, true),
    ChannelWiring::new(InputChannel::Charging, Port::B, 3, false),
    ChannelWiring::new(InputChannel::VbusSense, Port::A, 9, false),
];

/// Lines that must keep their digital configuration in stop 1.
pub const fn wake_pins() -> PinMask {
    let mut mask = PinMask::EMPTY;
    let mut index = 0;
    while index < CHANNELS.len() {
        mask = mask.union(CHANNELS[index].mask());
        index += 1;
    }
    mask
}
