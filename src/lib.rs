//! Weft cooperative job scheduler
//!
//! A single-threaded scheduler that multiplexes many logical jobs onto one
//! execution context using stackful coroutines. Jobs yield explicitly, sleep
//! on deadlines, wait for one another, and are cancelled cooperatively
//! through a forest of [`sched::Tag`]s.
//!
//! # Example
//!
//! ```no_run
//! use weft::sched::job::from_fn;
//! use weft::sched::{NextRun, Scheduler};
//!
//! let mut sched = Scheduler::new(|| 0);
//! sched.add_job("hello", from_fn(|job| {
//!     job.yield_now()?;
//!     Ok(())
//! }));
//! loop {
//!     match sched.work() {
//!         NextRun::Exit => break,
//!         NextRun::Immediate => continue,
//!         NextRun::At(_deadline) => sched.killall_jobs(),
//!     }
//! }
//! ```
//!
//! # Crate Features
//!
//! - `os-thread-coroutines`: back every coroutine with a dedicated OS thread
//!   instead of hand-rolled stack switching

#![doc(html_root_url = "https://docs.rs/weft")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod sched;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "weft";
