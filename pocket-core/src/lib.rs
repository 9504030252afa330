#![no_std]

// Real-time nucleus shared by the handheld firmware and the host simulator.
//
// Everything here is hardware agnostic: the tick counter, comparator, GPIO
// lines and low-power entry sequence are reached through traits so the same
// scheduling, sleep-selection and debouncing logic runs on the MCU and in
// host tests.

pub mod input;
pub mod jobs;
pub mod power;
pub mod time;

pub use input::{InputChannel, InputEvent, Level};
pub use jobs::{Job, JobTag, SharedScheduler, WakeTime};
pub use power::{PowerStateController, SleepProfile, SleepState};
pub use time::{Clock, Instant, TickRate, Ticks};
