//! OS-thread-backed coroutine contexts.
//!
//! Drop-in substitute for the stack-switching backend: every context runs
//! on a dedicated thread, and a pair of binary semaphores guarantees that
//! at most one side of a context pair executes at any instant. Observable
//! behavior matches the switching backend, with OS scheduling overhead.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::{ResumeOutcome, StartFn, Yielder};

/// Binary semaphore: one pending wakeup at most.
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
        *open = false;
    }
}

struct Shared {
    /// Lets the host run; signalled by the coroutine when it suspends.
    host: Gate,
    /// Lets the coroutine run; signalled by the host on resume.
    coro: Gate,
    finished: AtomicBool,
    /// Set when the context is being torn down while still suspended.
    die: AtomicBool,
}

/// Panic payload used to unwind a coroutine thread during teardown.
struct CoroKilled;

/// Carries the start closure onto the coroutine thread.
///
/// The closure is not required to be `Send`: the semaphore handshake makes
/// the two sides of a context pair strictly alternate, so everything the
/// closure touches is accessed by one thread at a time, with the gate's
/// lock ordering the hand-offs.
struct Handoff(StartFn);
unsafe impl Send for Handoff {}

pub(super) struct Coro {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    stack_size: usize,
}

pub(super) struct YielderImpl {
    shared: Arc<Shared>,
}

impl Coro {
    pub(super) fn new(stack_size: usize, f: StartFn) -> Self {
        let shared = Arc::new(Shared {
            host: Gate::new(),
            coro: Gate::new(),
            finished: AtomicBool::new(false),
            die: AtomicBool::new(false),
        });
        let handoff = Handoff(f);
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("weft-coroutine".into())
            .stack_size(stack_size)
            .spawn(move || coro_main(thread_shared, handoff))
            .expect("failed to spawn coroutine thread");
        Self {
            shared,
            thread: Some(thread),
            stack_size,
        }
    }

    pub(super) fn resume(&mut self) -> ResumeOutcome {
        debug_assert!(
            !self.shared.finished.load(Ordering::Acquire),
            "resumed a finished coroutine context"
        );
        self.shared.coro.signal();
        self.shared.host.wait();
        if self.shared.finished.load(Ordering::Acquire) {
            ResumeOutcome::Finished
        } else {
            ResumeOutcome::Suspended
        }
    }

    #[inline]
    pub(super) fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    #[inline]
    pub(super) fn stack_size(&self) -> usize {
        self.stack_size
    }
}

impl Drop for Coro {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if !self.is_finished() {
            // Wake the parked thread one last time; it observes `die` and
            // unwinds out of the closure.
            self.shared.die.store(true, Ordering::Release);
            self.shared.coro.signal();
        }
        let _ = thread.join();
    }
}

impl YielderImpl {
    pub(super) fn suspend(&self) {
        self.shared.host.signal();
        self.shared.coro.wait();
        if self.shared.die.load(Ordering::Acquire) {
            panic::panic_any(CoroKilled);
        }
    }

    /// Thread stacks are managed by the OS; mirror the original
    /// thread-backed implementation and never report exhaustion.
    pub(super) fn stack_space_almost_gone(&self) -> bool {
        false
    }
}

fn coro_main(shared: Arc<Shared>, handoff: Handoff) {
    shared.coro.wait();
    if !shared.die.load(Ordering::Acquire) {
        let yielder = Yielder::new(YielderImpl {
            shared: Arc::clone(&shared),
        });
        let f = handoff.0;
        let _ = panic::catch_unwind(AssertUnwindSafe(move || f(&yielder)));
    }
    shared.finished.store(true, Ordering::Release);
    shared.host.signal();
}
