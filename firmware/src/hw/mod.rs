//! STM32G0 implementations of the core's hardware traits.

#![cfg(target_os = "none")]

pub mod exti;
pub mod lptim;
pub mod power;

pub use exti::ExtiPins;
pub use lptim::Lptim1;
pub use power::StopModes;
