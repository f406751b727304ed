//! Tags: hierarchical cancellation and pause scopes.
//!
//! A tag is a node in a forest. Jobs apply tags to themselves; stopping,
//! blocking or freezing a tag then affects every job under that tag or any
//! of its descendants. Blocked/frozen state is derived at read time as the
//! OR of the tag's own flag and its ancestors' — writes touch one node
//! only, so mutation is O(1) and queries are O(depth).

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Payload attached to a stop or block, delivered to every affected job.
/// The scheduler never looks inside; it is embedder data, shared because
/// one signal can reach many jobs.
pub type StopPayload = Rc<dyn Any>;

/// Tag priority.
pub type Prio = i32;

/// Lowest admissible priority.
pub const PRIO_MIN: Prio = 0;
/// Priority given to tags that do not ask for anything else.
pub const PRIO_DEFAULT: Prio = 2;
/// First priority of the reserved real-time band. Requesting it or more
/// commits the scheduler to real-time behaviour.
pub const PRIO_RT_MIN: Prio = 5;
/// Highest admissible priority.
pub const PRIO_MAX: Prio = 7;

/// The scheduler operations a tag needs when it is stopped, blocked or
/// re-prioritized. Implemented by `Scheduler` for the embedder side and by
/// `JobCtl` for code running inside a job.
pub trait SchedulerSignals {
    /// Record that `tag` was stopped or blocked. Affected jobs are
    /// determined at the next round boundary, never mid-iteration.
    fn signal_stop(&self, tag: &Tag, payload: StopPayload);

    /// Commit the scheduler to real-time behaviour until explicitly reset.
    fn real_time_behaviour_set(&self);

    /// Hint that external state changed, so side-effect-free jobs are
    /// worth re-running.
    fn signal_world_change(&self);
}

struct TagNode {
    parent: Option<Tag>,
    name: String,
    blocked: Cell<bool>,
    frozen: Cell<bool>,
    prio: Cell<Prio>,
    flow_control: Cell<bool>,
    payload: RefCell<Option<StopPayload>>,
}

/// Shared handle to one node of the tag forest.
///
/// Clones refer to the same node. A tag outlives any single job: it stays
/// alive as long as the scheduler or any job still holds a handle to it.
#[derive(Clone)]
pub struct Tag {
    node: Rc<TagNode>,
}

impl Tag {
    /// Create a root tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Create a tag below `parent`. The parent link is fixed for the
    /// tag's lifetime.
    pub fn with_parent(name: impl Into<String>, parent: &Tag) -> Self {
        Self::build(name.into(), Some(parent.clone()))
    }

    fn build(name: String, parent: Option<Tag>) -> Self {
        Self {
            node: Rc::new(TagNode {
                parent,
                name,
                blocked: Cell::new(false),
                frozen: Cell::new(false),
                prio: Cell::new(PRIO_DEFAULT),
                flow_control: Cell::new(false),
                payload: RefCell::new(None),
            }),
        }
    }

    /// Tag name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Do `self` and `other` designate the same node?
    #[inline]
    pub fn same(&self, other: &Tag) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    /// Is this tag frozen, directly or through an ancestor?
    pub fn frozen(&self) -> bool {
        self.node.frozen.get() || self.parent().is_some_and(|p| p.frozen())
    }

    /// Is this tag blocked, directly or through an ancestor?
    pub fn blocked(&self) -> bool {
        self.node.blocked.get() || self.parent().is_some_and(|p| p.blocked())
    }

    /// Is `other` this tag or one of its ancestors?
    pub fn derives_from(&self, other: &Tag) -> bool {
        self.same(other) || self.parent().is_some_and(|p| p.derives_from(other))
    }

    /// Soft-pause every job under this tag. Read back by the scheduler at
    /// each round; no signal is delivered to the jobs themselves.
    pub fn freeze(&self, sched: &impl SchedulerSignals) {
        self.node.frozen.set(true);
        sched.signal_world_change();
    }

    /// Lift a [`freeze`](Tag::freeze). Counts as a world change so paused
    /// side-effect-free jobs get another round.
    pub fn unfreeze(&self, sched: &impl SchedulerSignals) {
        self.node.frozen.set(false);
        sched.signal_world_change();
    }

    /// Stop every job under this tag: affected jobs receive an
    /// asynchronous failure at the next round boundary. The tag itself
    /// keeps accepting new jobs.
    pub fn stop(&self, sched: &impl SchedulerSignals, payload: StopPayload) {
        sched.signal_stop(self, payload);
    }

    /// Block this tag: like [`stop`](Tag::stop), but the blocked flag
    /// stays up so jobs arriving under the tag are stopped as well, until
    /// [`unblock`](Tag::unblock).
    pub fn block(&self, sched: &impl SchedulerSignals, payload: StopPayload) {
        self.node.blocked.set(true);
        *self.node.payload.borrow_mut() = Some(payload.clone());
        self.stop(sched, payload);
    }

    /// Clear the blocked flag and drop the stored payload.
    pub fn unblock(&self, sched: &impl SchedulerSignals) {
        *self.node.payload.borrow_mut() = None;
        self.node.blocked.set(false);
        sched.signal_world_change();
    }

    /// Payload stored by the last [`block`](Tag::block), if any.
    pub fn payload_get(&self) -> Option<StopPayload> {
        self.node.payload.borrow().clone()
    }

    /// Current priority.
    #[inline]
    pub fn prio_get(&self) -> Prio {
        self.node.prio.get()
    }

    /// Request a new priority. The value is clamped into
    /// `[PRIO_MIN, PRIO_MAX]`; a request at or above [`PRIO_RT_MIN`] also
    /// flips the scheduler into real-time mode. Returns the priority
    /// actually set.
    pub fn prio_set(&self, sched: &impl SchedulerSignals, prio: Prio) -> Prio {
        if prio >= PRIO_RT_MIN {
            sched.real_time_behaviour_set();
        }
        let prio = prio.clamp(PRIO_MIN, PRIO_MAX);
        self.node.prio.set(prio);
        prio
    }

    /// Mark this tag as participating in flow control.
    pub fn flow_control_set(&self) {
        self.node.flow_control.set(true);
    }

    /// Does this tag participate in flow control?
    #[inline]
    pub fn flow_control_get(&self) -> bool {
        self.node.flow_control.get()
    }

    /// Nearest tag, starting from `self` and walking up, whose own blocked
    /// flag is set.
    pub(crate) fn blocker(&self) -> Option<Tag> {
        if self.node.blocked.get() {
            return Some(self.clone());
        }
        self.parent().and_then(Tag::blocker)
    }

    fn parent(&self) -> Option<&Tag> {
        self.node.parent.as_ref()
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tag")
            .field("name", &self.node.name)
            .field("blocked", &self.node.blocked.get())
            .field("frozen", &self.node.frozen.get())
            .field("prio", &self.node.prio.get())
            .finish()
    }
}
