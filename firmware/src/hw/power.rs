//! Sleep, stop 0 and stop 1 entry for the STM32G0.
//!
//! | State | Mode   | Notes                                           |
//! |-------|--------|-------------------------------------------------|
//! | `S1`  | sleep  | WFI with SLEEPDEEP clear; clocks keep running.  |
//! | `S2`  | stop 0 | Main regulator on; HSI16 restarts on wakeup.    |
//! | `S3`  | stop 1 | Low-power regulator; unexempt GPIOs parked.     |
//!
//! The system clock is HSI16, which is also what stop mode wakes up on, so
//! restoring the clock tree reduces to waiting for HSIRDY.

use core::fmt;

use cortex_m::peripheral::SCB;
use embassy_stm32::pac;
use embassy_stm32::pac::gpio::regs::Moder;
use embassy_stm32::pac::pwr::vals::Lpms;
use pocket_core::power::{LowPowerBackend, PinMask, SleepState};
use pocket_core::Clock;

use crate::status::StatusCounters;

const HSI_READY_SPINS: u32 = 10_000;
const ANALOG_MODER: u32 = u32::MAX;
const PORTS: [pac::gpio::Gpio; 2] = [pac::GPIOA, pac::GPIOB];

#[derive(Copy, Clone, Debug, Eq, PartialEq, defmt::Format)]
pub enum PowerError {
    ClockNotReady,
}

impl fmt::Display for PowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClockNotReady => f.write_str("HSI16 did not restart after stop"),
        }
    }
}

pub struct StopModes<T: 'static> {
    scb: SCB,
    clock: &'static T,
    status: &'static StatusCounters,
}

impl<T: Clock> StopModes<T> {
    pub fn new(scb: SCB, clock: &'static T, status: &'static StatusCounters) -> Self {
        Self { scb, clock, status }
    }

    fn stop(&mut self, mode: Lpms) -> Result<(), PowerError> {
        pac::PWR.cr1().modify(|w| w.set_lpms(mode));
        self.scb.set_sleepdeep();
        cortex_m::asm::dsb();
        cortex_m::asm::wfi();
        self.scb.clear_sleepdeep();
        wait_hsi_ready()
    }
}

impl<T: Clock> LowPowerBackend for StopModes<T> {
    type Error = PowerError;

    fn enter(&mut self, state: SleepState, exempt: PinMask) -> Result<(), Self::Error> {
        let start = self.clock.now();
        match state {
            SleepState::Run => return Ok(()),
            SleepState::S1 => {
                self.scb.clear_sleepdeep();
                cortex_m::asm::dsb();
                cortex_m::asm::wfi();
            }
            SleepState::S2 => self.stop(Lpms::STOP0)?,
            SleepState::S3 => {
                let saved = park_gpio(exempt);
                let woke = self.stop(Lpms::STOP1);
                restore_gpio(saved);
                woke?;
            }
        }

        let slept = self.clock.now().ticks().wrapping_sub(start.ticks());
        self.status.record_sleep(state, slept);
        Ok(())
    }

    fn fatal(&mut self, error: Self::Error) -> ! {
        defmt::error!("power: {}", error);
        SCB::sys_reset()
    }
}

fn wait_hsi_ready() -> Result<(), PowerError> {
    for _ in 0..HSI_READY_SPINS {
        if pac::RCC.cr().read().hsirdy() {
            return Ok(());
        }
    }
    Err(PowerError::ClockNotReady)
}

/// Switches every pin outside `exempt` to analog and returns the previous
/// mode registers.
fn park_gpio(exempt: PinMask) -> [u32; PORTS.len()] {
    core::array::from_fn(|port| {
        let gpio = PORTS[port];
        let saved = gpio.moder().read().0;
        let keep = (exempt.bits() >> (port * 16)) & 0xFFFF;

        let mut parked = ANALOG_MODER;
        for pin in 0..16 {
            if keep & (1 << pin) != 0 {
                let field = 0b11 << (2 * pin);
                parked = (parked & !field) | (saved & field);
            }
        }
        gpio.moder().write_value(Moder(parked));
        saved
    })
}

fn restore_gpio(saved: [u32; PORTS.len()]) {
    for (gpio, moder) in PORTS.iter().zip(saved) {
        gpio.moder().write_value(Moder(moder));
    }
}
