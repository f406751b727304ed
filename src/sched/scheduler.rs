//! The cooperative scheduler.
//!
//! One scheduler drives any number of jobs on a single OS thread, in
//! rounds. A round resumes every job that is ready, once, in queue order;
//! each resumed job runs until it yields back. Between rounds the embedder
//! regains control and learns, through [`NextRun`], when the next round is
//! worth running.
//!
//! The scheduler never sleeps by itself. Pacing is the embedder's loop:
//! call [`Scheduler::work`], honor the returned deadline, repeat.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::coroutine::{Coroutine, ResumeOutcome, DEFAULT_STACK_SIZE};
use super::job::{JobBody, JobCtl, JobError, JobId, JobRunState, JobShared, JobSlot, Request};
use super::stats::RoundStats;
use super::tag::{SchedulerSignals, StopPayload, Tag};
use super::Time;

/// Time value of [`NextRun::Immediate`]: another round is useful right
/// away.
pub const SCHED_IMMEDIATE: Time = 0;

/// Time value of [`NextRun::Exit`]: every job is gone after a
/// [`killall_jobs`](Scheduler::killall_jobs); the embedder's loop can
/// stop.
pub const SCHED_EXIT: Time = -1;

/// What [`Scheduler::work`] tells the embedder about the next round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// Run another round as soon as convenient.
    Immediate,
    /// No job can make progress before this instant. [`Time::MAX`] means
    /// no job is runnable at all until an external event (a new job, a
    /// stop, a world change) arrives.
    At(Time),
    /// Shutdown is complete.
    Exit,
}

impl NextRun {
    /// Flatten to the conventional time encoding: [`SCHED_IMMEDIATE`],
    /// [`SCHED_EXIT`], or a deadline.
    pub fn as_time(self) -> Time {
        match self {
            Self::Immediate => SCHED_IMMEDIATE,
            Self::At(deadline) => deadline,
            Self::Exit => SCHED_EXIT,
        }
    }
}

/// Scheduler tunables, loadable from any serde source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Stack size for job coroutines, in bytes.
    #[serde(default = "default_stack_size")]
    pub default_stack_size: usize,
    /// Feed round durations into [`RoundStats`].
    #[serde(default = "default_collect_stats")]
    pub collect_stats: bool,
}

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

fn default_collect_stats() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_stack_size: default_stack_size(),
            collect_stats: default_collect_stats(),
        }
    }
}

/// A job waiting to be adopted at the next round boundary. Its shared
/// cells already exist, so signals can reach it before it first runs.
pub(crate) struct SpawnReq {
    pub(crate) id: JobId,
    pub(crate) body: Box<dyn JobBody>,
    pub(crate) shared: Rc<JobShared>,
}

/// State reachable from both sides of a coroutine switch.
///
/// The scheduler and the running job live on different stacks, so neither
/// can hold a `&mut Scheduler` across a switch. Everything they both need
/// sits here behind `Rc`, with interior mutability; single-threadedness
/// makes the cells race-free.
pub(crate) struct SchedShared {
    /// The embedder's time source. All deadlines are in its unit.
    pub(crate) get_time: Box<dyn Fn() -> Time>,
    next_id: Cell<u64>,
    /// Job currently on the CPU, if a round is in progress.
    pub(crate) current: Cell<Option<JobId>>,
    /// Every job that has been handed to the scheduler and has not
    /// terminated, adopted or not.
    live: RefCell<HashSet<JobId>>,
    /// Jobs handed over since the last round boundary.
    spawns: RefCell<Vec<SpawnReq>>,
    /// Tag stops issued since the last round boundary.
    stops: RefCell<Vec<(Tag, StopPayload)>>,
    pub(crate) world_changed: Cell<bool>,
    pub(crate) real_time: Cell<bool>,
}

impl SchedShared {
    fn new(get_time: Box<dyn Fn() -> Time>) -> Self {
        Self {
            get_time,
            next_id: Cell::new(0),
            current: Cell::new(None),
            live: RefCell::new(HashSet::new()),
            spawns: RefCell::new(Vec::new()),
            stops: RefCell::new(Vec::new()),
            world_changed: Cell::new(false),
            real_time: Cell::new(false),
        }
    }

    pub(crate) fn is_live(&self, id: JobId) -> bool {
        self.live.borrow().contains(&id)
    }

    /// Register a job for adoption at the next round boundary. The job is
    /// live from this instant, so its handle can already be waited on.
    pub(crate) fn enqueue_spawn(
        &self,
        name: String,
        body: Box<dyn JobBody>,
        tags: SmallVec<[Tag; 4]>,
    ) -> JobId {
        let id = JobId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.live.borrow_mut().insert(id);
        self.spawns.borrow_mut().push(SpawnReq {
            id,
            body,
            shared: Rc::new(JobShared::new(name, tags)),
        });
        id
    }

    pub(crate) fn push_stop(&self, tag: Tag, payload: StopPayload) {
        self.stops.borrow_mut().push((tag, payload));
    }
}

/// A cooperative, single-threaded job scheduler.
///
/// Not `Send`: a scheduler and all of its jobs belong to the thread that
/// created them.
pub struct Scheduler {
    shared: Rc<SchedShared>,
    /// Live, adopted jobs, in adoption order.
    jobs: IndexMap<JobId, JobSlot>,
    config: SchedulerConfig,
    /// Rounds run so far.
    cycle: u64,
    /// A [`killall_jobs`](Scheduler::killall_jobs) happened. Latched for
    /// the scheduler's remaining lifetime.
    killing: bool,
    stats: RoundStats,
}

impl Scheduler {
    /// Create a scheduler around the embedder's time source.
    ///
    /// The unit of `get_time` is the embedder's business; deadlines given
    /// to [`JobCtl::yield_until`] and returned by [`NextRun::At`] are in
    /// that same unit.
    pub fn new(get_time: impl Fn() -> Time + 'static) -> Self {
        Self::with_config(get_time, SchedulerConfig::default())
    }

    /// Create a scheduler with explicit tunables.
    pub fn with_config(get_time: impl Fn() -> Time + 'static, config: SchedulerConfig) -> Self {
        Self {
            shared: Rc::new(SchedShared::new(Box::new(get_time))),
            jobs: IndexMap::new(),
            config,
            cycle: 0,
            killing: false,
            stats: RoundStats::new(),
        }
    }

    /// Hand a job to the scheduler. It is adopted, and first runs, at the
    /// start of the next [`work`](Scheduler::work) call.
    pub fn add_job(&mut self, name: impl Into<String>, body: impl JobBody) -> JobId {
        self.add_job_with_tags(name, body, &[])
    }

    /// Like [`add_job`](Scheduler::add_job), with an initial tag stack.
    pub fn add_job_with_tags(
        &mut self,
        name: impl Into<String>,
        body: impl JobBody,
        tags: &[Tag],
    ) -> JobId {
        let id = self.shared.enqueue_spawn(
            name.into(),
            Box::new(body),
            tags.iter().cloned().collect(),
        );
        debug!(job = %id, "job added");
        id
    }

    /// Run one round and report when the next one is worth running.
    ///
    /// A round adopts pending jobs, delivers deferred stop signals, wakes
    /// whoever is due, then resumes every ready job exactly once. Jobs
    /// becoming ready during the round (spawns, front yields) wait for the
    /// next one.
    pub fn work(&mut self) -> NextRun {
        let start = (self.shared.get_time)();
        self.cycle += 1;
        trace!(cycle = self.cycle, "round start");

        self.adopt_spawns();
        self.deliver_stops();
        if self.killing {
            self.mark_all_terminated();
        }
        self.wake_due(start);

        let snapshot = self.ready_snapshot();
        let mut terminated = 0u32;
        for id in snapshot {
            if self.run_one(id) {
                terminated += 1;
            }
        }

        if self.config.collect_stats {
            let end = (self.shared.get_time)();
            self.stats.add(end - start);
        }
        trace!(
            cycle = self.cycle,
            jobs = self.jobs.len(),
            terminated,
            "round end"
        );
        self.decide_next(terminated)
    }

    /// Move every pending spawn into the arena.
    fn adopt_spawns(&mut self) {
        let spawns = std::mem::take(&mut *self.shared.spawns.borrow_mut());
        for req in spawns {
            let slot = self.build_slot(req);
            self.jobs.insert(slot.0, slot.1);
        }
    }

    fn build_slot(&self, req: SpawnReq) -> (JobId, JobSlot) {
        let SpawnReq {
            id,
            mut body,
            shared,
        } = req;
        let sched = Rc::clone(&self.shared);
        let job_shared = Rc::clone(&shared);
        let coroutine = Coroutine::new(self.config.default_stack_size, move |yielder| {
            // A failure injected before the body ever ran cancels the job
            // outright; the body must not start just to be torn down.
            if let Some(error) = job_shared.pending.take() {
                debug!(job = %id, name = %job_shared.name, ?error, "job cancelled before start");
            } else {
                let mut ctl = JobCtl::new(id, sched, Rc::clone(&job_shared), yielder);
                // Caught here rather than at the coroutine boundary so the
                // terminate hook still runs after a panicking body.
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| body.work(&mut ctl)));
                match outcome {
                    Ok(Ok(())) => debug!(job = %id, name = %job_shared.name, "job finished"),
                    Ok(Err(error)) => {
                        debug!(job = %id, name = %job_shared.name, ?error, "job ended")
                    }
                    Err(_) => warn!(job = %id, name = %job_shared.name, "job panicked"),
                }
            }
            body.terminate();
        });
        (
            id,
            JobSlot {
                coroutine,
                shared,
                state: JobRunState::Ready { front: false },
                waiters: SmallVec::new(),
            },
        )
    }

    /// Deliver the stops issued since the last boundary: inject a failure
    /// into, and wake, every job under each stopped tag.
    fn deliver_stops(&mut self) {
        let stops = std::mem::take(&mut *self.shared.stops.borrow_mut());
        for (tag, payload) in stops {
            debug!(tag = tag.name(), "delivering stop");
            let affected: Vec<JobId> = self
                .jobs
                .iter()
                .filter(|(_, slot)| slot.shared.under(&tag))
                .map(|(id, _)| *id)
                .collect();
            for id in affected {
                if let Some(slot) = self.jobs.get(&id) {
                    slot.shared.inject(JobError::Stopped {
                        tag: tag.clone(),
                        payload: payload.clone(),
                    });
                }
                self.make_ready(id, false);
            }
        }
    }

    /// Inject a kill into every live job and wake it so it can unwind.
    fn mark_all_terminated(&mut self) {
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.jobs.get(&id) {
                slot.shared.inject(JobError::Terminated);
            }
            self.make_ready(id, false);
        }
    }

    /// Wake sleepers whose deadline has passed, waiters whose target is
    /// gone, and anyone holding a pending failure.
    fn wake_due(&mut self, now: Time) {
        let due: Vec<JobId> = {
            let live = self.shared.live.borrow();
            self.jobs
                .iter()
                .filter(|(_, slot)| {
                    let due = match slot.state {
                        JobRunState::Ready { .. } => return false,
                        JobRunState::Sleeping(deadline) => now >= deadline,
                        JobRunState::Waiting(on) => !live.contains(&on),
                    };
                    due || slot.shared.has_pending()
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in due {
            self.make_ready(id, false);
        }
    }

    /// Move a job onto the ready queue. Leaving `Waiting` by any path
    /// other than the target's termination abandons the wait, so the
    /// registration on the old target is removed here; otherwise the
    /// target would wake this job later, whatever it is doing by then.
    fn make_ready(&mut self, id: JobId, front: bool) {
        let Some(slot) = self.jobs.get_mut(&id) else {
            return;
        };
        let prev = std::mem::replace(&mut slot.state, JobRunState::Ready { front });
        if let JobRunState::Waiting(on) = prev {
            if let Some(target) = self.jobs.get_mut(&on) {
                target.waiters.retain(|waiter| *waiter != id);
            }
        }
    }

    /// Freeze the round's run queue: front yields first, then everyone
    /// else, each class in adoption order.
    fn ready_snapshot(&self) -> Vec<JobId> {
        let mut order = Vec::with_capacity(self.jobs.len());
        for (id, slot) in &self.jobs {
            if matches!(slot.state, JobRunState::Ready { front: true }) {
                order.push(*id);
            }
        }
        for (id, slot) in &self.jobs {
            if matches!(slot.state, JobRunState::Ready { front: false }) {
                order.push(*id);
            }
        }
        order
    }

    /// Resume one ready job and file it according to its request. Returns
    /// whether the job terminated.
    fn run_one(&mut self, id: JobId) -> bool {
        let outcome = {
            let Some(slot) = self.jobs.get_mut(&id) else {
                return false;
            };
            if !matches!(slot.state, JobRunState::Ready { .. }) {
                return false;
            }
            // A job under a blocked tag is stopped on sight, so jobs
            // arriving under the tag after the block are caught too.
            if !slot.shared.has_pending() {
                if let Some((tag, payload)) = slot.shared.blocked_by() {
                    slot.shared.inject(JobError::Stopped { tag, payload });
                }
            }
            // Frozen jobs stay filed as ready but do not run; a pending
            // failure overrides the freeze so the job can unwind.
            if slot.shared.frozen() && !slot.shared.has_pending() {
                return false;
            }
            self.shared.current.set(Some(id));
            let outcome = slot.coroutine.resume();
            self.shared.current.set(None);
            outcome
        };
        match outcome {
            ResumeOutcome::Finished => {
                self.reap(id);
                true
            }
            ResumeOutcome::Suspended => {
                self.file_request(id);
                false
            }
        }
    }

    /// Remove a terminated job and wake anyone waiting on it.
    fn reap(&mut self, id: JobId) {
        self.shared.live.borrow_mut().remove(&id);
        if let Some(slot) = self.jobs.shift_remove(&id) {
            debug!(job = %id, name = %slot.shared.name, "job terminated");
            // Waiters rejoin at the front: they already paid their queue
            // dues before suspending.
            for waiter in slot.waiters {
                self.make_ready(waiter, true);
            }
        }
    }

    /// File a suspended job according to the request it left behind.
    fn file_request(&mut self, id: JobId) {
        let request = self
            .jobs
            .get(&id)
            .and_then(|slot| slot.shared.request.take());
        let state = match request {
            Some(Request::Yield) | None => JobRunState::Ready { front: false },
            Some(Request::YieldFront) => JobRunState::Ready { front: true },
            Some(Request::YieldUntil(deadline)) => JobRunState::Sleeping(deadline),
            Some(Request::WaitFor(on)) => {
                if self.shared.is_live(on) {
                    if let Some(target) = self.jobs.get_mut(&on) {
                        target.waiters.push(id);
                    }
                    JobRunState::Waiting(on)
                } else {
                    JobRunState::Ready { front: false }
                }
            }
        };
        if let Some(slot) = self.jobs.get_mut(&id) {
            slot.state = state;
        }
    }

    /// Decide what to tell the embedder after a round.
    fn decide_next(&mut self, terminated: u32) -> NextRun {
        if self.killing && self.jobs.is_empty() && self.shared.spawns.borrow().is_empty() {
            debug!("all jobs gone, scheduler exiting");
            return NextRun::Exit;
        }

        // Terminations are a world change: whoever observes other jobs may
        // now see something different.
        let world = self.shared.world_changed.take() || terminated > 0;
        let real_time = self.shared.real_time.get();

        let mut immediate = !self.shared.spawns.borrow().is_empty();
        let mut deadline: Option<Time> = None;
        for slot in self.jobs.values() {
            match slot.state {
                JobRunState::Ready { .. } => {
                    if slot.shared.frozen() && !slot.shared.has_pending() {
                        continue;
                    }
                    // A side-effect-free job rearming in an unchanged
                    // world would only observe what it already saw; do
                    // not spin for it.
                    if !slot.shared.side_effect_free.get() || world || real_time {
                        immediate = true;
                    }
                }
                JobRunState::Sleeping(d) => {
                    deadline = Some(deadline.map_or(d, |m| m.min(d)));
                }
                JobRunState::Waiting(_) => {}
            }
        }

        if immediate {
            NextRun::Immediate
        } else if let Some(deadline) = deadline {
            NextRun::At(deadline)
        } else {
            NextRun::At(Time::MAX)
        }
    }

    /// Kill every job, present and pending. Subsequent
    /// [`work`](Scheduler::work) calls give each job one resumption to
    /// unwind; once the arena is empty, `work` returns [`NextRun::Exit`].
    ///
    /// Shutdown is permanent: jobs added afterwards are killed before
    /// their body ever runs, and `work` keeps returning `Exit` once they
    /// are gone.
    pub fn killall_jobs(&mut self) {
        debug!(jobs = self.jobs.len(), "killing all jobs");
        self.killing = true;
        self.mark_all_terminated();
    }

    /// Kill one job. It unwinds during the next round; the handle is dead
    /// afterwards. A job added but not yet run is cancelled before its
    /// body ever starts.
    pub fn terminate_now(&mut self, id: JobId) {
        self.inject(id, JobError::Terminated);
    }

    /// Inject an arbitrary failure into a job, delivered as the `Err` of
    /// its next yield. A job that never yields again never sees it.
    pub fn async_throw(&mut self, id: JobId, payload: StopPayload) {
        self.inject(id, JobError::Raised(payload));
    }

    /// Inject a failure into an adopted or still-pending job and wake it.
    fn inject(&mut self, id: JobId, error: JobError) {
        if let Some(slot) = self.jobs.get(&id) {
            slot.shared.inject(error);
            self.make_ready(id, false);
            return;
        }
        let spawns = self.shared.spawns.borrow();
        if let Some(req) = spawns.iter().find(|req| req.id == id) {
            req.shared.inject(error);
        }
    }

    /// The job being resumed right now, if a round is in progress.
    #[inline]
    pub fn current_job(&self) -> Option<JobId> {
        self.shared.current.get()
    }

    /// Is `id` the job being resumed right now?
    #[inline]
    pub fn is_current_job(&self, id: JobId) -> bool {
        self.current_job() == Some(id)
    }

    /// Number of rounds run so far.
    #[inline]
    pub fn cycle_get(&self) -> u64 {
        self.cycle
    }

    /// Current time, from the embedder's time source.
    pub fn get_time(&self) -> Time {
        (self.shared.get_time)()
    }

    /// Handles of every adopted, live job, in adoption order.
    pub fn jobs_get(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    /// Name of a live job, if adopted and alive.
    pub fn job_name(&self, id: JobId) -> Option<&str> {
        self.jobs.get(&id).map(|slot| slot.shared.name.as_str())
    }

    /// Has this job terminated? True for handles the scheduler never saw.
    pub fn job_terminated(&self, id: JobId) -> bool {
        !self.shared.is_live(id)
    }

    /// Round duration statistics.
    #[inline]
    pub fn stats_get(&self) -> &RoundStats {
        &self.stats
    }

    /// Forget accumulated round statistics.
    pub fn stats_reset(&mut self) {
        self.stats.reset();
    }

    /// Is the scheduler committed to real-time behaviour?
    #[inline]
    pub fn real_time_behaviour_get(&self) -> bool {
        self.shared.real_time.get()
    }

    /// Leave real-time mode.
    pub fn real_time_behaviour_reset(&mut self) {
        self.shared.real_time.set(false);
    }
}

impl SchedulerSignals for Scheduler {
    fn signal_stop(&self, tag: &Tag, payload: StopPayload) {
        self.shared.push_stop(tag.clone(), payload);
    }

    fn real_time_behaviour_set(&self) {
        self.shared.real_time.set(true);
    }

    fn signal_world_change(&self) {
        self.shared.world_changed.set(true);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.len())
            .field("cycle", &self.cycle)
            .field("killing", &self.killing)
            .field("real_time", &self.shared.real_time.get())
            .finish()
    }
}
