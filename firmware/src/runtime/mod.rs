use cortex_m::peripheral::NVIC;
use cortex_m::register::primask;
use cortex_m_rt::entry;
use critical_section::{self, RawRestoreState};
use defmt_rtt as _;
use embassy_stm32 as hal;
use embassy_stm32::gpio::{Input, Level as PinLevel, Output, Pull, Speed};
use embassy_stm32::pac::{self, interrupt};
use embassy_stm32::rcc::LsConfig;
use pocket_core::input::edge_detected;
use pocket_core::jobs::{MainLoop, SharedScheduler};
use pocket_core::power::{PinMask, PowerStateController};
use pocket_core::time::TimeBase;
use pocket_core::Clock;
use static_cell::StaticCell;

use crate::app::{App, Scheduler};
use crate::board::{INPUT_CONFIG, JOB_SLOTS, SLEEP_PROFILE, TICK_RATE};
use crate::hw::{ExtiPins, Lptim1, StopModes};
use crate::status::StatusCounters;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        cortex_m::interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                cortex_m::interrupt::enable();
            }
        }
    }
}

type Board = App<ExtiPins, Output<'static>, TimeBase<Lptim1>>;

/// SWDIO and SWCLK stay configured so a probe survives stop 1.
const SWD_PINS: PinMask = PinMask::pin(13).union(PinMask::pin(14));

static TIME: TimeBase<Lptim1> = TimeBase::new(Lptim1);
static JOBS: Scheduler<ExtiPins, Output<'static>, TimeBase<Lptim1>> = SharedScheduler::new();
static POWER: PowerStateController = PowerStateController::new(SLEEP_PROFILE);
static STATUS: StatusCounters = StatusCounters::new();
static APP: StaticCell<Board> = StaticCell::new();

#[entry]
fn main() -> ! {
    let mut config = hal::Config::default();
    config.rcc.ls = LsConfig::default_lse();
    let p = hal::init(config);
    let core = cortex_m::Peripherals::take().expect("core peripherals already taken");

    Lptim1::start();

    let pins = ExtiPins::new([
        Input::new(p.PA0, Pull::Down),
        Input::new(p.PA1, Pull::Down),
        Input::new(p.PA2, Pull::Down),
        Input::new(p.PB3, Pull::None),
        Input::new(p.PA9, Pull::Down),
    ]);
    let backlight = Output::new(p.PB8, PinLevel::Low, Speed::Low);

    POWER.exempt_pins(SWD_PINS);
    let app = APP.init(App::new(&JOBS, &POWER, &TIME, &STATUS, pins, backlight));
    app.start();

    defmt::info!(
        "boot: {} Hz tick, {} job slots, sleep ceiling {}",
        TICK_RATE.ticks_from_millis(1_000),
        JOB_SLOTS,
        POWER.profile().highest_allowed.label()
    );

    unsafe {
        NVIC::unmask(pac::Interrupt::TIM6_DAC_LPTIM1);
        NVIC::unmask(pac::Interrupt::EXTI0_1);
        NVIC::unmask(pac::Interrupt::EXTI2_3);
        NVIC::unmask(pac::Interrupt::EXTI4_15);
    }

    let backend = StopModes::new(core.SCB, &TIME, &STATUS);
    MainLoop::new(&JOBS, &POWER, &TIME, backend).run(app)
}

#[interrupt]
fn TIM6_DAC_LPTIM1() {
    let counter = TIME.counter();
    if counter.take_overflow() {
        TIME.on_overflow();
    }
    counter.clear_compare();
}

#[interrupt]
fn EXTI0_1() {
    dispatch_edges();
}

#[interrupt]
fn EXTI2_3() {
    dispatch_edges();
}

#[interrupt]
fn EXTI4_15() {
    dispatch_edges();
}

fn dispatch_edges() {
    let now = TIME.now();
    for channel in ExtiPins::take_pending() {
        edge_detected::<Board, _>(&JOBS, &INPUT_CONFIG, channel, now);
    }
}
