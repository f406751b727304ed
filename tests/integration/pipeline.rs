//! Producer/consumer pipeline over one scheduler.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use weft::sched::job::from_fn;
use weft::sched::{NextRun, Scheduler, Time};

fn fixture() -> (Scheduler, Rc<Cell<Time>>) {
    let clock = Rc::new(Cell::new(0));
    let source = Rc::clone(&clock);
    (Scheduler::new(move || source.get()), clock)
}

/// Run rounds until no job is left, with a hard cap so a scheduling bug
/// fails the test instead of hanging it.
fn drive(sched: &mut Scheduler, max_rounds: u32) {
    for _ in 0..max_rounds {
        let next = sched.work();
        if next != NextRun::Immediate && sched.jobs_get().is_empty() {
            return;
        }
    }
    panic!("pipeline did not drain within {max_rounds} rounds");
}

#[test]
fn producer_feeds_consumer_in_order() {
    let (mut sched, _clock) = fixture();
    let queue: Rc<RefCell<VecDeque<u32>>> = Rc::new(RefCell::new(VecDeque::new()));
    let received = Rc::new(RefCell::new(Vec::new()));

    let q = Rc::clone(&queue);
    let producer = sched.add_job(
        "producer",
        from_fn(move |job| {
            for i in 0..10u32 {
                q.borrow_mut().push_back(i);
                job.yield_now()?;
            }
            Ok(())
        }),
    );

    let q = Rc::clone(&queue);
    let out = Rc::clone(&received);
    sched.add_job(
        "consumer",
        from_fn(move |job| {
            loop {
                while let Some(item) = q.borrow_mut().pop_front() {
                    out.borrow_mut().push(item);
                }
                if out.borrow().len() == 10 {
                    return Ok(());
                }
                job.yield_now()?;
            }
        }),
    );

    drive(&mut sched, 100);
    assert!(sched.job_terminated(producer));
    assert_eq!(*received.borrow(), (0..10).collect::<Vec<_>>());
}

#[test]
fn consumer_waits_for_producer_termination() {
    let (mut sched, _clock) = fixture();
    let queue: Rc<RefCell<VecDeque<u32>>> = Rc::new(RefCell::new(VecDeque::new()));
    let total = Rc::new(Cell::new(0u32));

    let q = Rc::clone(&queue);
    let producer = sched.add_job(
        "producer",
        from_fn(move |job| {
            for i in 1..=5u32 {
                q.borrow_mut().push_back(i);
                job.yield_now()?;
            }
            Ok(())
        }),
    );

    let q = Rc::clone(&queue);
    let sum = Rc::clone(&total);
    sched.add_job(
        "drain-after",
        from_fn(move |job| {
            // Let the producer finish entirely, then drain in one go.
            job.yield_until_terminated(producer)?;
            while let Some(item) = q.borrow_mut().pop_front() {
                sum.set(sum.get() + item);
            }
            Ok(())
        }),
    );

    drive(&mut sched, 100);
    assert_eq!(total.get(), 15);
    assert!(queue.borrow().is_empty());
}

#[test]
fn fan_out_workers_spawned_by_coordinator() {
    let (mut sched, _clock) = fixture();
    let done = Rc::new(Cell::new(0u32));

    let counter = Rc::clone(&done);
    sched.add_job(
        "coordinator",
        from_fn(move |job| {
            let workers: Vec<_> = (0..4)
                .map(|i| {
                    let counter = Rc::clone(&counter);
                    job.spawn(
                        format!("worker-{i}"),
                        from_fn(move |job| {
                            job.yield_now()?;
                            counter.set(counter.get() + 1);
                            Ok(())
                        }),
                    )
                })
                .collect();
            for worker in workers {
                job.yield_until_terminated(worker)?;
            }
            Ok(())
        }),
    );

    drive(&mut sched, 100);
    assert_eq!(done.get(), 4);
}
