use crate::power::{LowPowerBackend, PowerStateController, SleepState};
use crate::time::WakeupTimer;

use super::{Callback, Fired, Job, SharedScheduler, WakeTime};

/// Outcome of one main loop iteration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Step {
    Ran(Job),
    Slept(SleepState),
    Idle,
}

enum Decision<C> {
    Run(Fired, Callback<C>),
    Sleep(SleepState),
    Idle,
}

/// Alternates between running due jobs and sleeping until the next one.
pub struct MainLoop<'a, C, T, B, const N: usize> {
    jobs: &'a SharedScheduler<C, N>,
    power: &'a PowerStateController,
    timer: &'a T,
    backend: B,
}

impl<'a, C, T, B, const N: usize> MainLoop<'a, C, T, B, N>
where
    T: WakeupTimer,
    B: LowPowerBackend,
{
    #[must_use]
    pub fn new(
        jobs: &'a SharedScheduler<C, N>,
        power: &'a PowerStateController,
        timer: &'a T,
        backend: B,
    ) -> Self {
        Self {
            jobs,
            power,
            timer,
            backend,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Runs one iteration: one due job, one sleep period, or nothing.
    ///
    /// The queue inspection, wakeup programming and sleep entry all happen in
    /// a single critical section so an interrupt that schedules a job cannot
    /// slip in between the decision and the sleep instruction; it stays
    /// pending and wakes the core instead.
    ///
    /// Only a due head is popped. When the wait is too short for any sleep
    /// state, or a `Run` lock is held, the iteration returns [`Step::Idle`]
    /// and the next one looks at the queue again, so a job scheduled from an
    /// interrupt in the meantime can still go first.
    ///
    /// # Errors
    ///
    /// Returns the backend error when entering a sleep state failed.
    pub fn step(&mut self, ctx: &mut C) -> Result<Step, B::Error> {
        let decision = critical_section::with(|cs| -> Result<Decision<C>, B::Error> {
            let mut queue = self.jobs.queue(cs);
            let state = match queue.peek() {
                Some(head) if head.wake.is_due(self.timer.now()) => {
                    return Ok(Self::take_head(queue.pop()));
                }
                Some(Fired {
                    wake: WakeTime::At(at),
                    ..
                }) => self.power.configure_wakeup(self.timer, at),
                Some(_) => SleepState::Run,
                None => {
                    self.timer.disarm_wakeup();
                    self.power.max_state()
                }
            };

            drop(queue);
            if state == SleepState::Run {
                return Ok(Decision::Idle);
            }

            self.power.enter_state(&mut self.backend, state)?;
            Ok(Decision::Sleep(state))
        })?;

        Ok(match decision {
            Decision::Run(fired, callback) => {
                // Absorbs jitter from leaving a sleep state early.
                if let WakeTime::At(at) = fired.wake {
                    self.timer.wait_until(at);
                }
                callback(ctx, fired);
                Step::Ran(fired.job)
            }
            Decision::Sleep(state) => Step::Slept(state),
            Decision::Idle => Step::Idle,
        })
    }

    /// Never returns. A failed power transition is handed to
    /// [`LowPowerBackend::fatal`].
    pub fn run(mut self, ctx: &mut C) -> ! {
        loop {
            if let Err(error) = self.step(ctx) {
                self.backend.fatal(error);
            }
        }
    }

    fn take_head(head: Option<(Fired, Callback<C>)>) -> Decision<C> {
        match head {
            Some((fired, callback)) => Decision::Run(fired, callback),
            None => Decision::Idle,
        }
    }
}
