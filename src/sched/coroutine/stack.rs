//! Owned stack buffers for coroutine contexts.
//!
//! Allocation failure is fatal: this memory underlies all execution, so
//! there is no caller that could meaningfully recover from running out.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use super::MIN_STACK_SIZE;

/// Stacks are aligned to 16 bytes, the strictest requirement of the
/// architectures the switch backend supports.
const STACK_ALIGN: usize = 16;

/// A heap-allocated coroutine stack.
///
/// The buffer is only ever written through the coroutine running on it;
/// while the coroutine is suspended nothing else touches it.
pub(super) struct Stack {
    ptr: NonNull<u8>,
    size: usize,
}

impl Stack {
    /// Allocate a stack of at least `size` bytes (rounded up so the
    /// near-exhaustion check always has headroom to work with).
    pub(super) fn new(size: usize) -> Self {
        let size = size.max(MIN_STACK_SIZE * 2);
        let layout = Self::layout(size);
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        Self { ptr, size }
    }

    /// Lowest valid address of the stack.
    #[inline]
    pub(super) fn base(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// One past the highest valid address. Stacks grow downwards from here.
    #[inline]
    pub(super) fn top(&self) -> *mut u8 {
        // SAFETY: one-past-the-end pointer of the allocation.
        unsafe { self.ptr.as_ptr().add(self.size) }
    }

    /// Allocated size in bytes.
    #[inline]
    pub(super) fn size(&self) -> usize {
        self.size
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, STACK_ALIGN).expect("stack size overflows Layout")
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: allocated with the identical layout in `new`.
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.size)) };
    }
}
