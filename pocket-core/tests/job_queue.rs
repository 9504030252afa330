mod common;

use common::{Bench, Harness, SLOTS};
use pocket_core::jobs::{Fired, Job, JobApi, JobQueue, JobTag, WakeTime};
use pocket_core::time::{Clock, Instant};

const TICK: Job = Job::tagged(21, JobTag::Client(2));
const EMULATE: Job = Job::tagged(22, JobTag::Client(3));
const URGENT: Job = Job::tagged(23, JobTag::Client(4));

fn noop(_: &mut Bench, _: Fired) {}

fn assert_ordered(queue: &JobQueue<Bench, SLOTS>) {
    let entries = queue.snapshot::<SLOTS>();
    for pair in entries.windows(2) {
        assert!(
            pair[0].wake.sorts_at_or_before(pair[1].wake),
            "{:?} queued ahead of {:?}",
            pair[0],
            pair[1]
        );
    }
    for (index, entry) in entries.iter().enumerate() {
        assert!(
            entries[index + 1..]
                .iter()
                .all(|other| other.job.slot != entry.job.slot),
            "slot {} queued twice",
            entry.job.slot
        );
    }
}

#[test]
fn random_schedule_and_cancel_keep_queue_sorted() {
    let mut queue: JobQueue<Bench, SLOTS> = JobQueue::new();
    let mut queued = [false; SLOTS];
    let base = u32::MAX - 400;
    let mut seed: u32 = 0x1234_5678;

    for _ in 0..2_000 {
        seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let slot = (seed >> 8) % 16;
        let job = Job::new(u8::try_from(slot).expect("slot fits"));
        let index = slot as usize;

        match seed >> 28 {
            0..=2 => {
                queue.cancel(job);
                queued[index] = false;
            }
            3 => {
                queue.schedule(job, noop, WakeTime::Asap);
                queued[index] = true;
            }
            _ => {
                let at = base.wrapping_add((seed >> 4) % 800);
                queue.schedule(job, noop, WakeTime::At(Instant::from_ticks(at)));
                queued[index] = true;
            }
        }

        assert_ordered(&queue);
        assert_eq!(queue.len(), queued.iter().filter(|q| **q).count());
    }
}

#[test]
fn ordering_survives_counter_wraparound() {
    let mut queue: JobQueue<Bench, 4> = JobQueue::new();
    queue.schedule(Job::new(0), noop, WakeTime::At(Instant::from_ticks(5)));
    queue.schedule(
        Job::new(1),
        noop,
        WakeTime::At(Instant::from_ticks(u32::MAX - 10)),
    );

    let order: Vec<u8> = queue.iter().map(|fired| fired.job.slot).collect();
    assert_eq!(order, [1, 0]);
}

fn periodic_tick(bench: &mut Bench, fired: Fired) {
    let now = bench.clock.now().ticks();
    bench.runs.push((2, now)).expect("run log capacity");
    if let WakeTime::At(at) = fired.wake {
        bench.jobs.schedule(fired.job, periodic_tick, WakeTime::At(at + 100));
    }
}

#[test]
fn self_rearming_job_keeps_its_period() {
    let mut bench = Harness::new();
    bench
        .jobs
        .schedule(TICK, periodic_tick, WakeTime::At(Instant::from_ticks(100)));

    bench.run_until(1_050);

    let times: Vec<u32> = bench.ctx.runs.iter().map(|(_, at)| *at).collect();
    assert_eq!(times, (1..=10).map(|n| n * 100).collect::<Vec<_>>());
}

fn urgent(bench: &mut Bench, _: Fired) {
    let now = bench.clock.now().ticks();
    bench.runs.push((4, now)).expect("run log capacity");
}

/// Emulates in slices of 10 ticks and yields once another job is due.
fn emulate(bench: &mut Bench, fired: Fired) {
    loop {
        bench.clock.advance(10);
        let now = bench.clock.now();
        if bench.jobs.should_yield(now) {
            bench.runs.push((3, now.ticks())).expect("run log capacity");
            // Resume behind whatever became due meanwhile.
            bench.jobs.schedule(fired.job, emulate, WakeTime::At(now));
            return;
        }
        if now.ticks() >= 400 {
            bench.runs.push((3, now.ticks())).expect("run log capacity");
            return;
        }
    }
}

#[test]
fn long_job_yields_to_due_work() {
    let mut bench = Harness::new();
    bench.jobs.schedule(EMULATE, emulate, WakeTime::Asap);
    bench
        .jobs
        .schedule(URGENT, urgent, WakeTime::At(Instant::from_ticks(125)));

    bench.run_until(500);

    assert_eq!(
        bench.ctx.runs.as_slice(),
        &[(3, 130), (4, 130), (3, 400)],
        "emulation pauses for the urgent job and then resumes"
    );
}

#[test]
fn job_scheduled_from_callback_runs_in_order() {
    fn first(bench: &mut Bench, _: Fired) {
        let now = bench.clock.now();
        bench.runs.push((1, now.ticks())).expect("run log capacity");
        bench.jobs.schedule(URGENT, urgent, WakeTime::Asap);
    }

    let mut bench = Harness::new();
    bench
        .jobs
        .schedule(TICK, first, WakeTime::At(Instant::from_ticks(50)));
    bench
        .jobs
        .schedule(EMULATE, noop, WakeTime::At(Instant::from_ticks(60)));

    bench.run_until(100);

    assert_eq!(bench.ctx.runs.as_slice(), &[(1, 50), (4, 50)]);
    assert!(bench.jobs.lock(|queue| queue.is_empty()));
}

#[test]
fn cancelled_job_never_runs() {
    let mut bench = Harness::new();
    bench
        .jobs
        .schedule(URGENT, urgent, WakeTime::At(Instant::from_ticks(80)));
    assert!(bench.jobs.cancel(URGENT));
    assert!(!bench.jobs.cancel(URGENT));

    bench.run_until(200);

    assert!(bench.ctx.runs.is_empty());
}
