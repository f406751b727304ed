//! Tag 单元测试

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use proptest::prelude::*;

use crate::sched::tag::{
    SchedulerSignals, StopPayload, Tag, PRIO_DEFAULT, PRIO_MAX, PRIO_MIN, PRIO_RT_MIN,
};

/// Records every signal a tag emits, standing in for a scheduler.
#[derive(Default)]
struct SignalLog {
    stops: RefCell<Vec<String>>,
    world_changes: Cell<u32>,
    real_time: Cell<bool>,
}

impl SchedulerSignals for SignalLog {
    fn signal_stop(&self, tag: &Tag, _payload: StopPayload) {
        self.stops.borrow_mut().push(tag.name().to_owned());
    }

    fn real_time_behaviour_set(&self) {
        self.real_time.set(true);
    }

    fn signal_world_change(&self) {
        self.world_changes.set(self.world_changes.get() + 1);
    }
}

#[test]
fn test_new_tag_defaults() {
    let tag = Tag::new("root");
    assert_eq!(tag.name(), "root");
    assert!(!tag.frozen());
    assert!(!tag.blocked());
    assert!(!tag.flow_control_get());
    assert_eq!(tag.prio_get(), PRIO_DEFAULT);
}

#[test]
fn test_clone_is_same_node() {
    let tag = Tag::new("t");
    let other = tag.clone();
    assert!(tag.same(&other));
    assert!(!tag.same(&Tag::new("t")));
}

#[test]
fn test_derives_from_chain() {
    let root = Tag::new("root");
    let mid = Tag::with_parent("mid", &root);
    let leaf = Tag::with_parent("leaf", &mid);
    assert!(leaf.derives_from(&leaf));
    assert!(leaf.derives_from(&mid));
    assert!(leaf.derives_from(&root));
    assert!(!root.derives_from(&leaf));
    let sibling = Tag::with_parent("sibling", &root);
    assert!(!leaf.derives_from(&sibling));
}

#[test]
fn test_freeze_inherited_by_descendants() {
    let log = SignalLog::default();
    let root = Tag::new("root");
    let child = Tag::with_parent("child", &root);
    root.freeze(&log);
    assert!(root.frozen());
    assert!(child.frozen());
    root.unfreeze(&log);
    assert!(!child.frozen());
    assert_eq!(log.world_changes.get(), 2);
}

#[test]
fn test_child_freeze_does_not_climb() {
    let log = SignalLog::default();
    let root = Tag::new("root");
    let child = Tag::with_parent("child", &root);
    child.freeze(&log);
    assert!(child.frozen());
    assert!(!root.frozen());
}

#[test]
fn test_stop_emits_signal() {
    let log = SignalLog::default();
    let tag = Tag::new("group");
    tag.stop(&log, Rc::new("halt"));
    assert_eq!(*log.stops.borrow(), vec!["group".to_owned()]);
    // Stopping does not latch any state on the tag itself.
    assert!(!tag.blocked());
}

#[test]
fn test_block_latches_and_stops() {
    let log = SignalLog::default();
    let tag = Tag::new("t");
    tag.block(&log, Rc::new(42i32));
    assert!(tag.blocked());
    assert_eq!(log.stops.borrow().len(), 1);
    let payload = tag.payload_get().unwrap();
    assert_eq!(payload.downcast_ref::<i32>(), Some(&42));

    tag.unblock(&log);
    assert!(!tag.blocked());
    assert!(tag.payload_get().is_none());
    assert!(log.world_changes.get() > 0);
}

#[test]
fn test_blocked_inherited_by_descendants() {
    let log = SignalLog::default();
    let root = Tag::new("root");
    let leaf = Tag::with_parent("leaf", &root);
    root.block(&log, Rc::new(()));
    assert!(leaf.blocked());
    assert!(leaf.blocker().unwrap().same(&root));
}

#[test]
fn test_prio_set_clamps() {
    let log = SignalLog::default();
    let tag = Tag::new("t");
    assert_eq!(tag.prio_set(&log, PRIO_MAX + 10), PRIO_MAX);
    assert_eq!(tag.prio_get(), PRIO_MAX);
    assert_eq!(tag.prio_set(&log, PRIO_MIN - 10), PRIO_MIN);
    assert_eq!(tag.prio_get(), PRIO_MIN);
}

#[test]
fn test_rt_prio_flips_real_time() {
    let log = SignalLog::default();
    let tag = Tag::new("t");
    tag.prio_set(&log, PRIO_RT_MIN - 1);
    assert!(!log.real_time.get());
    tag.prio_set(&log, PRIO_RT_MIN);
    assert!(log.real_time.get());
    // Lowering the priority afterwards does not leave real-time mode.
    tag.prio_set(&log, PRIO_MIN);
    assert!(log.real_time.get());
}

#[test]
fn test_flow_control_flag() {
    let tag = Tag::new("t");
    tag.flow_control_set();
    assert!(tag.flow_control_get());
}

proptest! {
    #[test]
    fn prio_always_within_bounds(prio in -1000i32..1000) {
        let log = SignalLog::default();
        let tag = Tag::new("t");
        let set = tag.prio_set(&log, prio);
        prop_assert!((PRIO_MIN..=PRIO_MAX).contains(&set));
        prop_assert_eq!(set, tag.prio_get());
    }

    #[test]
    fn freeze_reaches_any_depth(depth in 1usize..32) {
        let log = SignalLog::default();
        let root = Tag::new("root");
        let mut leaf = root.clone();
        for i in 0..depth {
            leaf = Tag::with_parent(format!("level{i}"), &leaf);
        }
        prop_assert!(leaf.derives_from(&root));
        root.freeze(&log);
        prop_assert!(leaf.frozen());
        root.unfreeze(&log);
        prop_assert!(!leaf.frozen());
    }
}
