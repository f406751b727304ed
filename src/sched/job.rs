//! Jobs: schedulable units of work.
//!
//! A job wraps one coroutine context around an embedder-supplied
//! [`JobBody`]. The body runs on the job's own stack and talks to the
//! scheduler exclusively through the [`JobCtl`] it receives: yielding,
//! sleeping, waiting on other jobs, spawning, and tagging all go through
//! it. Failures injected from outside (tag stops, kills, explicit throws)
//! surface as the `Err` value of the next yield call.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use smallvec::SmallVec;

use super::coroutine::{Coroutine, Yielder};
use super::scheduler::SchedShared;
use super::tag::{SchedulerSignals, StopPayload, Tag};
use super::Time;

/// Stable job handle. Identifiers are never reused within one scheduler,
/// so a stale handle is harmless: it simply no longer names a live job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Asynchronous failure delivered to a job at its next resumption.
#[derive(Clone, thiserror::Error)]
pub enum JobError {
    /// A tag above this job was stopped or blocked.
    #[error("stopped by tag `{}`", tag.name())]
    Stopped {
        /// The tag on which the stop was issued.
        tag: Tag,
        /// Embedder payload attached to the stop.
        payload: StopPayload,
    },
    /// The job was killed, by [`terminate_now`] or [`killall_jobs`].
    ///
    /// [`terminate_now`]: super::Scheduler::terminate_now
    /// [`killall_jobs`]: super::Scheduler::killall_jobs
    #[error("job terminated")]
    Terminated,
    /// An arbitrary failure injected with [`async_throw`].
    ///
    /// [`async_throw`]: super::Scheduler::async_throw
    #[error("asynchronous failure raised in job")]
    Raised(
        /// Embedder payload describing the failure.
        StopPayload,
    ),
}

impl std::fmt::Debug for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped { tag, .. } => f.debug_struct("Stopped").field("tag", tag).finish(),
            Self::Terminated => f.write_str("Terminated"),
            Self::Raised(_) => f.write_str("Raised"),
        }
    }
}

/// What a job does.
///
/// `work` runs on the job's coroutine and must yield regularly through the
/// [`JobCtl`] — there is no preemption. Whatever it returns is logged and
/// swallowed; failures never propagate into the scheduler. Embedders catch
/// their own domain errors inside `work`.
pub trait JobBody: 'static {
    /// The job's body. An `Err` ends the job like a normal return does.
    fn work(&mut self, job: &mut JobCtl<'_>) -> Result<(), JobError>;

    /// Best-effort cleanup, run when the job ends — normally or killed.
    /// Side effects here are lost by design; yielding from it is not
    /// advised.
    fn terminate(&mut self) {}
}

impl<F> JobBody for F
where
    F: FnMut(&mut JobCtl<'_>) -> Result<(), JobError> + 'static,
{
    fn work(&mut self, job: &mut JobCtl<'_>) -> Result<(), JobError> {
        self(job)
    }
}

/// Wrap a closure as a [`JobBody`].
///
/// Purely a type-inference aid: closures implement [`JobBody`] directly,
/// but going through `from_fn` lets the compiler work out the closure's
/// signature without annotations.
pub fn from_fn<F>(f: F) -> F
where
    F: FnMut(&mut JobCtl<'_>) -> Result<(), JobError> + 'static,
{
    f
}

/// How a suspended job asked to be resumed. Read by the scheduler right
/// after the job's coroutine switches back.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Request {
    /// Run again next round, back of the queue.
    Yield,
    /// Run again next round, front of the queue.
    YieldFront,
    /// Do not resume before `deadline`.
    YieldUntil(Time),
    /// Resume once the given job has terminated.
    WaitFor(JobId),
}

/// Per-job cells shared between the scheduler and the job's own stack.
/// Only one of the two sides runs at any instant, so plain `Cell`s are
/// enough.
pub(crate) struct JobShared {
    pub(crate) name: String,
    pub(crate) request: Cell<Option<Request>>,
    pub(crate) pending: Cell<Option<JobError>>,
    pub(crate) side_effect_free: Cell<bool>,
    pub(crate) tags: RefCell<SmallVec<[Tag; 4]>>,
}

impl JobShared {
    pub(crate) fn new(name: String, tags: SmallVec<[Tag; 4]>) -> Self {
        Self {
            name,
            request: Cell::new(None),
            pending: Cell::new(None),
            side_effect_free: Cell::new(false),
            tags: RefCell::new(tags),
        }
    }

    /// Is any tag applied to this job frozen?
    pub(crate) fn frozen(&self) -> bool {
        self.tags.borrow().iter().any(Tag::frozen)
    }

    /// Does any tag applied to this job derive from `tag`?
    pub(crate) fn under(&self, tag: &Tag) -> bool {
        self.tags.borrow().iter().any(|t| t.derives_from(tag))
    }

    /// The blocked tag this job sits under, if any, with the payload the
    /// block was issued with.
    pub(crate) fn blocked_by(&self) -> Option<(Tag, StopPayload)> {
        self.tags.borrow().iter().find_map(|t| {
            t.blocker().map(|blocker| {
                let payload = blocker
                    .payload_get()
                    .unwrap_or_else(|| Rc::new(()) as StopPayload);
                (blocker, payload)
            })
        })
    }

    /// Store a pending failure. A pending kill is never downgraded.
    pub(crate) fn inject(&self, error: JobError) {
        match self.pending.take() {
            Some(JobError::Terminated) => self.pending.set(Some(JobError::Terminated)),
            _ => self.pending.set(Some(error)),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        let pending = self.pending.take();
        let has = pending.is_some();
        self.pending.set(pending);
        has
    }
}

/// Where a live job currently stands, from the scheduler's point of view.
#[derive(Debug, Clone, Copy)]
pub(crate) enum JobRunState {
    /// Queued for the next round. `front` jobs run before the others.
    Ready {
        front: bool,
    },
    /// Suspended until a deadline.
    Sleeping(Time),
    /// Suspended until another job terminates.
    Waiting(JobId),
}

/// Scheduler-side record of one live job. Owns the coroutine; everything
/// across the switch boundary goes through `shared`.
pub(crate) struct JobSlot {
    pub(crate) coroutine: Coroutine,
    pub(crate) shared: Rc<JobShared>,
    pub(crate) state: JobRunState,
    /// Jobs to wake when this one terminates. Handles, not owning links.
    pub(crate) waiters: SmallVec<[JobId; 2]>,
}

/// Control handle a job body uses to talk to its scheduler.
///
/// Every `yield_*` call suspends the job; when it returns, any failure
/// injected while the job was away comes back as the `Err` value, which
/// bodies normally propagate with `?`.
pub struct JobCtl<'a> {
    id: JobId,
    sched: Rc<SchedShared>,
    shared: Rc<JobShared>,
    yielder: &'a Yielder,
}

impl<'a> JobCtl<'a> {
    pub(crate) fn new(
        id: JobId,
        sched: Rc<SchedShared>,
        shared: Rc<JobShared>,
        yielder: &'a Yielder,
    ) -> Self {
        Self {
            id,
            sched,
            shared,
            yielder,
        }
    }

    /// This job's handle.
    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// This job's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current time, from the scheduler's time source.
    pub fn time(&self) -> Time {
        (self.sched.get_time)()
    }

    /// Give up the rest of this round; run again next round, back of the
    /// queue.
    pub fn yield_now(&mut self) -> Result<(), JobError> {
        self.suspend(Request::Yield)
    }

    /// Like [`yield_now`](JobCtl::yield_now), but rejoin at the front of
    /// the next round's queue.
    pub fn yield_front(&mut self) -> Result<(), JobError> {
        self.suspend(Request::YieldFront)
    }

    /// Suspend until the scheduler's clock reaches `deadline`. The job is
    /// never resumed earlier, but may be resumed arbitrarily later.
    pub fn yield_until(&mut self, deadline: Time) -> Result<(), JobError> {
        self.suspend(Request::YieldUntil(deadline))
    }

    /// Suspend until `other` terminates. Returns at once, without
    /// suspending, if it already has (or never existed).
    pub fn yield_until_terminated(&mut self, other: JobId) -> Result<(), JobError> {
        if !self.sched.is_live(other) {
            return Ok(());
        }
        self.suspend(Request::WaitFor(other))
    }

    /// Hand a new job to the scheduler. It starts next cycle and inherits
    /// this job's current tag stack.
    pub fn spawn(&mut self, name: impl Into<String>, body: impl JobBody) -> JobId {
        let tags = self.shared.tags.borrow().clone();
        self.sched
            .enqueue_spawn(name.into(), Box::new(body), tags)
    }

    /// Apply `tag` to this job: stops and freezes on the tag (or its
    /// ancestors) now affect this job.
    pub fn tag_push(&mut self, tag: &Tag) {
        self.shared.tags.borrow_mut().push(tag.clone());
    }

    /// Remove the most recently applied tag.
    pub fn tag_pop(&mut self) {
        self.shared.tags.borrow_mut().pop();
    }

    /// Hint that this job's current round touched no shared state. Sticky
    /// until changed; lets the scheduler stop spinning when nothing else
    /// is going on.
    pub fn side_effect_free_set(&mut self, yes: bool) {
        self.shared.side_effect_free.set(yes);
    }

    /// Current value of the side-effect-free hint.
    pub fn side_effect_free_get(&self) -> bool {
        self.shared.side_effect_free.get()
    }

    /// Is this job's stack close to exhaustion? See
    /// [`Yielder::stack_space_almost_gone`].
    pub fn stack_space_almost_gone(&self) -> bool {
        self.yielder.stack_space_almost_gone()
    }

    fn suspend(&mut self, request: Request) -> Result<(), JobError> {
        self.shared.request.set(Some(request));
        self.yielder.suspend();
        match self.shared.pending.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl SchedulerSignals for JobCtl<'_> {
    fn signal_stop(&self, tag: &Tag, payload: StopPayload) {
        self.sched.push_stop(tag.clone(), payload);
    }

    fn real_time_behaviour_set(&self) {
        self.sched.real_time.set(true);
    }

    fn signal_world_change(&self) {
        self.sched.world_changed.set(true);
    }
}
