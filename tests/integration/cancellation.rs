//! Tag-driven cancellation and pausing across a job group.

use std::cell::Cell;
use std::rc::Rc;

use weft::sched::job::from_fn;
use weft::sched::{JobError, NextRun, Scheduler, Tag, Time};

fn fixture() -> (Scheduler, Rc<Cell<Time>>) {
    let clock = Rc::new(Cell::new(0));
    let source = Rc::clone(&clock);
    (Scheduler::new(move || source.get()), clock)
}

fn looping_counter(counter: &Rc<Cell<u32>>) -> impl weft::sched::JobBody {
    let counter = Rc::clone(counter);
    from_fn(move |job| loop {
        counter.set(counter.get() + 1);
        job.yield_now()?;
    })
}

#[test]
fn stopping_one_stage_leaves_the_other_running() {
    let (mut sched, _clock) = fixture();
    let root = Tag::new("pipeline");
    let stage_a = Tag::with_parent("stage-a", &root);
    let stage_b = Tag::with_parent("stage-b", &root);

    let count_a = Rc::new(Cell::new(0));
    let count_b = Rc::new(Cell::new(0));
    let a = sched.add_job_with_tags("a", looping_counter(&count_a), &[stage_a.clone()]);
    let b = sched.add_job_with_tags("b", looping_counter(&count_b), &[stage_b]);

    sched.work();
    stage_a.stop(&sched, Rc::new("done with a"));
    sched.work();
    assert!(sched.job_terminated(a));
    assert!(!sched.job_terminated(b));
    let after_stop = count_b.get();
    sched.work();
    assert!(count_b.get() > after_stop);
}

#[test]
fn stopping_the_root_cancels_every_stage() {
    let (mut sched, _clock) = fixture();
    let root = Tag::new("pipeline");
    let stage_a = Tag::with_parent("stage-a", &root);
    let stage_b = Tag::with_parent("stage-b", &root);

    let count = Rc::new(Cell::new(0));
    let a = sched.add_job_with_tags("a", looping_counter(&count), &[stage_a]);
    let b = sched.add_job_with_tags("b", looping_counter(&count), &[stage_b]);

    sched.work();
    root.stop(&sched, Rc::new(()));
    sched.work();
    assert!(sched.job_terminated(a));
    assert!(sched.job_terminated(b));
}

#[test]
fn freezing_the_root_pauses_every_stage() {
    let (mut sched, _clock) = fixture();
    let root = Tag::new("pipeline");
    let stage = Tag::with_parent("stage", &root);

    let count = Rc::new(Cell::new(0));
    let id = sched.add_job_with_tags("worker", looping_counter(&count), &[stage]);

    sched.work();
    assert_eq!(count.get(), 1);

    root.freeze(&sched);
    sched.work();
    sched.work();
    assert_eq!(count.get(), 1);
    assert!(!sched.job_terminated(id));

    root.unfreeze(&sched);
    sched.work();
    assert_eq!(count.get(), 2);
}

#[test]
fn cleanup_runs_when_a_tagged_job_is_stopped() {
    let (mut sched, _clock) = fixture();
    let tag = Tag::new("session");
    let cleaned = Rc::new(Cell::new(false));

    let flag = Rc::clone(&cleaned);
    sched.add_job_with_tags(
        "session-worker",
        from_fn(move |job| {
            let result = loop {
                match job.yield_now() {
                    Ok(()) => continue,
                    Err(error) => break error,
                }
            };
            // Unwind path: record the cleanup, then report the failure.
            flag.set(true);
            Err(result)
        }),
        &[tag.clone()],
    );

    sched.work();
    tag.stop(&sched, Rc::new(()));
    sched.work();
    assert!(cleaned.get());
}

#[test]
fn killall_after_partial_cancellation_exits() {
    let (mut sched, _clock) = fixture();
    let tag = Tag::new("batch");
    let count = Rc::new(Cell::new(0));
    sched.add_job_with_tags("tagged", looping_counter(&count), &[tag.clone()]);
    sched.add_job("untagged", looping_counter(&count));

    sched.work();
    tag.stop(&sched, Rc::new(()));
    sched.work();

    sched.killall_jobs();
    assert_eq!(sched.work(), NextRun::Exit);
    assert!(sched.jobs_get().is_empty());
}

#[test]
fn stopped_error_carries_the_payload() {
    let (mut sched, _clock) = fixture();
    let tag = Tag::new("with-payload");
    let seen = Rc::new(Cell::new(None));

    let out = Rc::clone(&seen);
    sched.add_job_with_tags(
        "observer",
        from_fn(move |job| loop {
            if let Err(JobError::Stopped { payload, .. }) = job.yield_now() {
                out.set(payload.downcast_ref::<&str>().copied());
                return Ok(());
            }
        }),
        &[tag.clone()],
    );

    sched.work();
    tag.stop(&sched, Rc::new("deadline reached"));
    sched.work();
    assert_eq!(seen.get(), Some("deadline reached"));
}
