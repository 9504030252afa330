//! Debounced input lines on EXTI.

use embassy_stm32::gpio::Input;
use embassy_stm32::pac;
use pocket_core::InputChannel;
use pocket_core::input::{Edge, InputPins};
use pocket_core::Level;

use crate::board::CHANNELS;

/// GPIO inputs in [`CHANNELS`] order, each routed to its EXTI line.
pub struct ExtiPins {
    inputs: [Input<'static>; InputChannel::COUNT],
}

impl ExtiPins {
    pub fn new(inputs: [Input<'static>; InputChannel::COUNT]) -> Self {
        let exti = pac::EXTI;
        for wiring in CHANNELS {
            let line = usize::from(wiring.pin);
            exti.exticr(line / 4)
                .modify(|w| w.set_exti(line % 4, wiring.port.index()));
            exti.imr(0).modify(|w| w.set_line(line, true));
        }
        Self { inputs }
    }

    /// Acknowledges every pending edge and yields the channels that had one.
    pub fn take_pending() -> impl Iterator<Item = InputChannel> {
        let exti = pac::EXTI;
        let rising = exti.rpr(0).read();
        let falling = exti.fpr(0).read();
        // Pending bits are write-one-to-clear.
        exti.rpr(0).write_value(rising);
        exti.fpr(0).write_value(falling);

        CHANNELS
            .into_iter()
            .filter(move |wiring| {
                let line = usize::from(wiring.pin);
                rising.line(line) || falling.line(line)
            })
            .map(|wiring| wiring.channel)
    }
}

impl InputPins for ExtiPins {
    fn level(&self, channel: InputChannel) -> Level {
        Level::from_high(self.inputs[channel.as_index()].is_high())
    }

    fn arm_edge(&mut self, channel: InputChannel, edge: Edge) {
        let exti = pac::EXTI;
        let line = usize::from(CHANNELS[channel.as_index()].pin);
        exti.rtsr(0)
            .modify(|w| w.set_line(line, edge == Edge::Rising));
        exti.ftsr(0)
            .modify(|w| w.set_line(line, edge == Edge::Falling));
    }
}
