//! Cooperative job scheduling core
//!
//! This module provides the [`Scheduler`], a round-based cooperative
//! scheduler that runs many [`JobBody`] implementations on stackful
//! coroutines, one at a time, on a single OS thread. Cancellation and
//! soft-pausing of dynamic job subsets goes through the [`Tag`] forest.

pub mod coroutine;
pub mod job;
pub mod scheduler;
pub mod stats;
pub mod tag;

#[cfg(test)]
mod tests;

pub use coroutine::{Coroutine, ResumeOutcome, Yielder, DEFAULT_STACK_SIZE};
pub use job::{JobBody, JobCtl, JobError, JobId};
pub use scheduler::{NextRun, Scheduler, SchedulerConfig, SCHED_EXIT, SCHED_IMMEDIATE};
pub use stats::RoundStats;
pub use tag::{
    Prio, SchedulerSignals, StopPayload, Tag, PRIO_DEFAULT, PRIO_MAX, PRIO_MIN, PRIO_RT_MIN,
};

/// Scheduler time, in whatever unit the embedder's time source uses
/// (conventionally microseconds). Only differences and comparisons matter
/// to the scheduler itself.
pub type Time = i64;
