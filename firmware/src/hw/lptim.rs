//! LPTIM1 as the free-running tick counter.
//!
//! The timer keeps counting LSE / 4 through stop 1, so its auto-reload match
//! drives the software high half and its compare match is the sleep wakeup.

use embassy_stm32::pac;
use embassy_stm32::pac::lptim::vals::Presc;
use pocket_core::time::Counter;

const AUTO_RELOAD: u16 = u16::MAX;

/// Handle to LPTIM1. The registers are only touched through this type and
/// the LPTIM1 interrupt.
pub struct Lptim1;

impl Lptim1 {
    /// Starts the counter in continuous mode.
    ///
    /// Requires a running LSE. Interrupts stay masked in the NVIC until the
    /// caller unmasks them.
    pub fn start() {
        pac::RCC.apbenr1().modify(|w| w.set_lptim1en(true));
        pac::RCC
            .ccipr()
            .modify(|w| w.set_lptim1sel(pac::rcc::vals::Lptimsel::LSE));

        let lptim = pac::LPTIM1;
        // CFGR and IER are only writable while the timer is disabled.
        lptim.cfgr().write(|w| w.set_presc(Presc::DIV4));
        lptim.ier().write(|w| {
            w.set_arrmie(true);
            w.set_cmpmie(true);
        });
        lptim.cr().write(|w| w.set_enable(true));

        lptim.arr().write(|w| w.set_arr(AUTO_RELOAD));
        while !lptim.isr().read().arrok() {}
        lptim.icr().write(|w| w.set_arrokcf(true));

        Self.write_compare(AUTO_RELOAD);
        lptim.cr().modify(|w| w.set_cntstrt(true));
    }

    /// Clears a pending auto-reload match, returning whether there was one.
    pub fn take_overflow(&self) -> bool {
        let lptim = pac::LPTIM1;
        let pending = lptim.isr().read().arrm();
        if pending {
            lptim.icr().write(|w| w.set_arrmcf(true));
        }
        pending
    }

    pub fn clear_compare(&self) {
        pac::LPTIM1.icr().write(|w| w.set_cmpmcf(true));
    }

    fn write_compare(&self, value: u16) {
        let lptim = pac::LPTIM1;
        lptim.icr().write(|w| w.set_cmpokcf(true));
        lptim.cmp().write(|w| w.set_cmp(value));
        // A second write before CMPOK is lost.
        while !lptim.isr().read().cmpok() {}
    }
}

impl Counter for Lptim1 {
    const BITS: u32 = 16;

    fn count(&self) -> u32 {
        // CNT is clocked asynchronously; only two matching reads are valid.
        let cnt = pac::LPTIM1.cnt();
        loop {
            let first = cnt.read().cnt();
            if cnt.read().cnt() == first {
                return u32::from(first);
            }
        }
    }

    fn overflow_pending(&self) -> bool {
        pac::LPTIM1.isr().read().arrm()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set_compare(&self, value: u32) {
        self.write_compare(value as u16);
    }

    fn disable_compare(&self) {
        // CMPMIE cannot change while enabled; parking the compare on the
        // auto-reload value folds its match into the overflow interrupt.
        self.write_compare(AUTO_RELOAD);
    }
}
