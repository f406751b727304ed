//! Stackful coroutine primitive.
//!
//! A [`Coroutine`] owns one suspended execution context: a stack and a
//! saved machine state. [`Coroutine::resume`] transfers control into it;
//! the [`Yielder`] handed to the start closure transfers control back.
//! Exactly one context runs at any instant, and control only ever moves
//! between a coroutine and the host that resumed it — never sideways
//! between two coroutines.
//!
//! Two interchangeable backends implement the switching:
//!
//! - `switch`: saves and restores machine state by hand (unix on x86_64
//!   and aarch64). The only unsafe-heavy code in the crate.
//! - `osthread`: one OS thread per context, gated by a semaphore pair so
//!   that only one side runs. Selected by the `os-thread-coroutines`
//!   feature, or automatically on targets the switch backend does not
//!   cover.

#[cfg(all(
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64"),
    not(feature = "os-thread-coroutines")
))]
mod stack;

#[cfg(all(
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64"),
    not(feature = "os-thread-coroutines")
))]
#[path = "switch.rs"]
mod imp;

#[cfg(not(all(
    unix,
    any(target_arch = "x86_64", target_arch = "aarch64"),
    not(feature = "os-thread-coroutines")
)))]
#[path = "osthread.rs"]
mod imp;

/// Default stack size for a coroutine context, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Remaining-stack threshold below which
/// [`Yielder::stack_space_almost_gone`] reports imminent exhaustion.
pub(crate) const MIN_STACK_SIZE: usize = 8 * 1024;

/// Start closure of a context. Owned by the context itself, so nothing is
/// passed through globals across the first switch.
pub(crate) type StartFn = Box<dyn FnOnce(&Yielder)>;

/// What a [`Coroutine::resume`] call observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The coroutine suspended through its [`Yielder`] and can be resumed
    /// again.
    Suspended,
    /// The start closure returned (or panicked); the context must not be
    /// resumed again.
    Finished,
}

/// A suspended stackful execution context.
///
/// Created suspended; the start closure runs on the first [`resume`].
/// Dropping a context that has not finished frees its stack without
/// unwinding it.
///
/// [`resume`]: Coroutine::resume
pub struct Coroutine {
    inner: imp::Coro,
}

impl Coroutine {
    /// Create a suspended context with its own stack.
    ///
    /// `stack_size == 0` selects [`DEFAULT_STACK_SIZE`]. Stack allocation
    /// failure is fatal — there is no recovery path below the scheduler.
    pub fn new<F>(stack_size: usize, f: F) -> Self
    where
        F: FnOnce(&Yielder) + 'static,
    {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        Self {
            inner: imp::Coro::new(stack_size, Box::new(f)),
        }
    }

    /// Switch from the caller into this context, returning when the
    /// context suspends or finishes. The call is synchronous: it returns
    /// only when control comes back to the caller.
    pub fn resume(&mut self) -> ResumeOutcome {
        self.inner.resume()
    }

    /// Has the start closure run to completion?
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Stack size this context was created with.
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.inner.stack_size()
    }
}

impl std::fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coroutine")
            .field("finished", &self.is_finished())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

/// Suspension handle passed to a context's start closure.
pub struct Yielder {
    imp: imp::YielderImpl,
}

impl Yielder {
    fn new(imp: imp::YielderImpl) -> Self {
        Self { imp }
    }

    /// Switch back to whatever resumed this context. Returns when the
    /// context is resumed again.
    pub fn suspend(&self) {
        self.imp.suspend();
    }

    /// Heuristic check for imminent stack overflow: distance between the
    /// current stack position and the stack's bound, against a safety
    /// threshold. A `true` result is a signal to avoid further deep
    /// recursion, not a hard guarantee.
    pub fn stack_space_almost_gone(&self) -> bool {
        self.imp.stack_space_almost_gone()
    }
}
