//! Time-ordered cooperative job queue.
//!
//! Jobs are statically declared handles (`const` [`Job`] values) that index a
//! fixed slot array inside the queue. Each slot carries the callback, wake
//! time and an intrusive `next` link, so scheduling never allocates and a job
//! can be queued at most once. Ordering uses the wraparound-safe signed delta
//! of [`Instant`], with [`WakeTime::Asap`] ahead of every timed entry and ties
//! kept in insertion order.

mod mainloop;

use core::cell::{RefCell, RefMut};

use critical_section::CriticalSection;
use embassy_sync::blocking_mutex::CriticalSectionMutex;
use heapless::Vec;

use crate::input::InputChannel;
use crate::time::Instant;

pub use mainloop::{MainLoop, Step};

/// Payload resolved by a callback when its job fires.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JobTag {
    Untagged,
    Input(InputChannel),
    Client(u8),
}

/// Handle naming one slot of a [`JobQueue`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Job {
    pub slot: u8,
    pub tag: JobTag,
}

impl Job {
    #[must_use]
    pub const fn new(slot: u8) -> Self {
        Self::tagged(slot, JobTag::Untagged)
    }

    #[must_use]
    pub const fn tagged(slot: u8, tag: JobTag) -> Self {
        Self { slot, tag }
    }
}

/// When a queued job becomes due.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WakeTime {
    Asap,
    At(Instant),
}

impl WakeTime {
    #[must_use]
    pub const fn is_due(self, now: Instant) -> bool {
        match self {
            WakeTime::Asap => true,
            WakeTime::At(at) => now.has_reached(at),
        }
    }

    /// Whether an entry waking at `self` stays ahead of one waking at `other`.
    #[must_use]
    pub const fn sorts_at_or_before(self, other: WakeTime) -> bool {
        match (self, other) {
            (WakeTime::Asap, _) => true,
            (WakeTime::At(_), WakeTime::Asap) => false,
            (WakeTime::At(a), WakeTime::At(b)) => a.ticks_until(b) >= 0,
        }
    }
}

/// A queued or firing job together with the wake time it was scheduled for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Fired {
    pub job: Job,
    pub wake: WakeTime,
}

/// Job callback. Runs to completion on the main loop with `C` as context.
pub type Callback<C> = fn(&mut C, Fired);

struct Slot<C> {
    wake: WakeTime,
    tag: JobTag,
    callback: Option<Callback<C>>,
    next: Option<u8>,
    queued: bool,
}

impl<C> Clone for Slot<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Slot<C> {}

impl<C> Slot<C> {
    const EMPTY: Self = Self {
        wake: WakeTime::Asap,
        tag: JobTag::Untagged,
        callback: None,
        next: None,
        queued: false,
    };

    fn fired(&self, slot: u8) -> Fired {
        Fired {
            job: Job::tagged(slot, self.tag),
            wake: self.wake,
        }
    }
}

/// Intrusive singly linked job list over a fixed slot array.
pub struct JobQueue<C, const N: usize> {
    slots: [Slot<C>; N],
    head: Option<u8>,
}

impl<C, const N: usize> Default for JobQueue<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, const N: usize> JobQueue<C, N> {
    const CAPACITY_FITS_SLOT: () = assert!(N <= 256);

    #[must_use]
    pub const fn new() -> Self {
        let () = Self::CAPACITY_FITS_SLOT;
        Self {
            slots: [Slot::EMPTY; N],
            head: None,
        }
    }

    /// Queues `job`, first removing any earlier occurrence of it.
    ///
    /// A job whose slot is outside the queue capacity is ignored.
    pub fn schedule(&mut self, job: Job, callback: Callback<C>, wake: WakeTime) {
        let index = usize::from(job.slot);
        if index >= N {
            return;
        }

        self.unlink(job.slot);

        let mut previous = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let entry = &self.slots[usize::from(current)];
            if !entry.wake.sorts_at_or_before(wake) {
                break;
            }
            previous = cursor;
            cursor = entry.next;
        }

        self.slots[index] = Slot {
            wake,
            tag: job.tag,
            callback: Some(callback),
            next: cursor,
            queued: true,
        };
        match previous {
            Some(prev) => self.slots[usize::from(prev)].next = Some(job.slot),
            None => self.head = Some(job.slot),
        }
    }

    /// Removes `job` if it is queued. Returns whether it was.
    pub fn cancel(&mut self, job: Job) -> bool {
        if usize::from(job.slot) >= N {
            return false;
        }
        self.unlink(job.slot)
    }

    #[must_use]
    pub fn peek(&self) -> Option<Fired> {
        let head = self.head?;
        Some(self.slots[usize::from(head)].fired(head))
    }

    /// Detaches the head job and hands back its callback.
    pub fn pop(&mut self) -> Option<(Fired, Callback<C>)> {
        let head = self.head?;
        let entry = &mut self.slots[usize::from(head)];
        let callback = entry.callback?;

        self.head = entry.next;
        entry.next = None;
        entry.queued = false;

        Some((entry.fired(head), callback))
    }

    #[must_use]
    pub fn is_queued(&self, job: Job) -> bool {
        self.slots
            .get(usize::from(job.slot))
            .is_some_and(|slot| slot.queued)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Queued jobs in firing order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, C, N> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    /// Copies up to `M` queued jobs in firing order.
    #[must_use]
    pub fn snapshot<const M: usize>(&self) -> Vec<Fired, M> {
        self.iter().take(M).collect()
    }

    fn unlink(&mut self, slot: u8) -> bool {
        if !self.slots[usize::from(slot)].queued {
            return false;
        }

        let mut previous: Option<u8> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            let next = self.slots[usize::from(current)].next;
            if current == slot {
                match previous {
                    Some(prev) => self.slots[usize::from(prev)].next = next,
                    None => self.head = next,
                }
                let entry = &mut self.slots[usize::from(slot)];
                entry.next = None;
                entry.queued = false;
                return true;
            }
            previous = cursor;
            cursor = next;
        }

        false
    }
}

pub struct Iter<'a, C, const N: usize> {
    queue: &'a JobQueue<C, N>,
    cursor: Option<u8>,
}

impl<C, const N: usize> Iterator for Iter<'_, C, N> {
    type Item = Fired;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        let entry = &self.queue.slots[usize::from(current)];
        self.cursor = entry.next;
        Some(entry.fired(current))
    }
}

/// Scheduler operations shared by interrupt handlers and job callbacks.
pub trait JobApi<C> {
    fn schedule(&self, job: Job, callback: Callback<C>, wake: WakeTime);

    fn cancel(&self, job: Job) -> bool;

    /// Head of the queue without removing it.
    fn next(&self) -> Option<Fired>;

    /// Whether a queued job is already due, so a long running job should
    /// reschedule itself and return.
    fn should_yield(&self, now: Instant) -> bool {
        self.next().is_some_and(|head| head.wake.is_due(now))
    }
}

/// [`JobQueue`] guarded by a critical section so it can be shared with ISRs.
pub struct SharedScheduler<C, const N: usize> {
    queue: CriticalSectionMutex<RefCell<JobQueue<C, N>>>,
}

impl<C, const N: usize> Default for SharedScheduler<C, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, const N: usize> SharedScheduler<C, N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: CriticalSectionMutex::new(RefCell::new(JobQueue::new())),
        }
    }

    /// Runs `f` on the queue inside a critical section.
    pub fn lock<R>(&self, f: impl FnOnce(&mut JobQueue<C, N>) -> R) -> R {
        self.queue.lock(|queue| f(&mut queue.borrow_mut()))
    }

    /// Borrows the queue inside a critical section the caller already holds.
    pub fn queue<'cs>(&'cs self, cs: CriticalSection<'cs>) -> RefMut<'cs, JobQueue<C, N>> {
        self.queue.borrow(cs).borrow_mut()
    }
}

impl<C, const N: usize> JobApi<C> for SharedScheduler<C, N> {
    fn schedule(&self, job: Job, callback: Callback<C>, wake: WakeTime) {
        self.lock(|queue| queue.schedule(job, callback, wake));
    }

    fn cancel(&self, job: Job) -> bool {
        self.lock(|queue| queue.cancel(job))
    }

    fn next(&self) -> Option<Fired> {
        self.lock(|queue| queue.peek())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ctx;

    fn noop(_: &mut Ctx, _: Fired) {}

    fn at(ticks: u32) -> WakeTime {
        WakeTime::At(Instant::from_ticks(ticks))
    }

    fn order<const N: usize>(queue: &JobQueue<Ctx, N>) -> Vec<u8, N> {
        queue.iter().map(|fired| fired.job.slot).collect()
    }

    #[test]
    fn asap_sorts_first_and_ties_keep_insertion_order() {
        let mut queue: JobQueue<Ctx, 8> = JobQueue::new();
        queue.schedule(Job::new(0), noop, at(50));
        queue.schedule(Job::new(1), noop, at(20));
        queue.schedule(Job::new(2), noop, WakeTime::Asap);
        queue.schedule(Job::new(3), noop, at(20));
        queue.schedule(Job::new(4), noop, WakeTime::Asap);

        assert_eq!(order(&queue).as_slice(), &[2, 4, 1, 3, 0]);
    }

    #[test]
    fn reschedule_relocates_instead_of_duplicating() {
        let mut queue: JobQueue<Ctx, 4> = JobQueue::new();
        queue.schedule(Job::new(0), noop, at(10));
        queue.schedule(Job::new(1), noop, at(20));
        queue.schedule(Job::new(0), noop, at(30));

        assert_eq!(order(&queue).as_slice(), &[1, 0]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut queue: JobQueue<Ctx, 4> = JobQueue::new();
        queue.schedule(Job::new(1), noop, at(10));

        assert!(queue.cancel(Job::new(1)));
        assert!(!queue.cancel(Job::new(1)));
        assert!(!queue.cancel(Job::new(3)));
        assert!(queue.is_empty());
    }

    #[test]
    fn out_of_range_slot_is_ignored() {
        let mut queue: JobQueue<Ctx, 2> = JobQueue::new();
        queue.schedule(Job::new(7), noop, WakeTime::Asap);

        assert!(queue.is_empty());
        assert!(!queue.is_queued(Job::new(7)));
        assert!(!queue.cancel(Job::new(7)));
    }

    #[test]
    fn pop_returns_tag_and_wake_time() {
        let mut queue: JobQueue<Ctx, 4> = JobQueue::new();
        let job = Job::tagged(2, JobTag::Client(9));
        queue.schedule(job, noop, at(5));

        let (fired, _) = queue.pop().expect("queued job");
        assert_eq!(fired, Fired { job, wake: at(5) });
        assert!(!queue.is_queued(job));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn should_yield_reports_due_head() {
        let scheduler: SharedScheduler<Ctx, 4> = SharedScheduler::new();
        assert!(!scheduler.should_yield(Instant::ZERO));

        scheduler.schedule(Job::new(0), noop, at(100));
        assert!(!scheduler.should_yield(Instant::from_ticks(99)));
        assert!(scheduler.should_yield(Instant::from_ticks(100)));

        scheduler.schedule(Job::new(1), noop, WakeTime::Asap);
        assert!(scheduler.should_yield(Instant::ZERO));
    }
}
