//! Deadline-driven scheduling against a hand-cranked clock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use weft::sched::job::from_fn;
use weft::sched::{NextRun, Scheduler, Time};

fn fixture() -> (Scheduler, Rc<Cell<Time>>) {
    let clock = Rc::new(Cell::new(0));
    let source = Rc::clone(&clock);
    (Scheduler::new(move || source.get()), clock)
}

/// Embedder loop: honor every returned deadline by jumping the clock to
/// it, exactly as a real event loop would sleep until then.
fn drive_by_deadlines(sched: &mut Scheduler, clock: &Rc<Cell<Time>>, max_rounds: u32) {
    for _ in 0..max_rounds {
        match sched.work() {
            NextRun::Exit => return,
            NextRun::Immediate => {}
            NextRun::At(deadline) => {
                if sched.jobs_get().is_empty() || deadline == Time::MAX {
                    return;
                }
                clock.set(deadline);
            }
        }
    }
    panic!("timers did not settle within {max_rounds} rounds");
}

#[test]
fn sleepers_wake_in_deadline_order() {
    let (mut sched, clock) = fixture();
    let wakeups = Rc::new(RefCell::new(Vec::new()));
    for deadline in [30, 10, 20] {
        let log = Rc::clone(&wakeups);
        sched.add_job(
            format!("sleep-until-{deadline}"),
            from_fn(move |job| {
                job.yield_until(deadline)?;
                log.borrow_mut().push((deadline, job.time()));
                Ok(())
            }),
        );
    }
    drive_by_deadlines(&mut sched, &clock, 100);
    let wakeups = wakeups.borrow();
    assert_eq!(
        wakeups
            .iter()
            .map(|(deadline, _)| *deadline)
            .collect::<Vec<_>>(),
        [10, 20, 30]
    );
    // No sleeper woke before its own deadline.
    for (deadline, woke_at) in wakeups.iter() {
        assert!(woke_at >= deadline);
    }
}

#[test]
fn periodic_ticker_advances_with_the_clock() {
    let (mut sched, clock) = fixture();
    let ticks = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&ticks);
    sched.add_job(
        "ticker",
        from_fn(move |job| {
            for _ in 0..3 {
                let next = job.time() + 10;
                job.yield_until(next)?;
                log.borrow_mut().push(job.time());
            }
            Ok(())
        }),
    );
    drive_by_deadlines(&mut sched, &clock, 100);
    assert_eq!(*ticks.borrow(), [10, 20, 30]);
}

#[test]
fn ready_job_keeps_sleeper_company() {
    let (mut sched, clock) = fixture();
    let woke = Rc::new(Cell::new(false));
    let flag = Rc::clone(&woke);
    sched.add_job(
        "sleeper",
        from_fn(move |job| {
            job.yield_until(50)?;
            flag.set(true);
            Ok(())
        }),
    );
    sched.add_job(
        "busy",
        from_fn(|job| {
            for _ in 0..3 {
                job.yield_now()?;
            }
            Ok(())
        }),
    );

    // While the busy job still wants the CPU, rounds stay immediate.
    assert_eq!(sched.work(), NextRun::Immediate);
    assert_eq!(sched.work(), NextRun::Immediate);
    assert_eq!(sched.work(), NextRun::Immediate);
    // Busy job done; only the sleeper's deadline remains.
    assert_eq!(sched.work(), NextRun::At(50));
    assert!(!woke.get());

    clock.set(50);
    sched.work();
    assert!(woke.get());
}

#[test]
fn past_deadline_runs_in_the_very_next_round() {
    let (mut sched, clock) = fixture();
    clock.set(1000);
    let woke_at = Rc::new(Cell::new(0));
    let out = Rc::clone(&woke_at);
    sched.add_job(
        "overdue",
        from_fn(move |job| {
            job.yield_until(10)?;
            out.set(job.time());
            Ok(())
        }),
    );
    sched.work();
    sched.work();
    assert_eq!(woke_at.get(), 1000);
}
