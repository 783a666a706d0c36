//! Coroutine stack memory
//!
//! Every non-main coroutine owns one `Stack`: a private anonymous mapping
//! whose lowest page is left inaccessible, so running off the end of the
//! stack faults instead of silently corrupting a neighbour.
//!
//! ```text
//! base                                                     base + total
//! | guard (PROT_NONE) |         usable (READ|WRITE)  <- grows down | top
//! ```

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
    }
}

use cosched_core::constants::{GUARD_SIZE, MIN_STACK_SIZE};
use cosched_core::error::{MemoryError, SchedResult};

/// An owned coroutine stack; unmapped on drop
pub struct Stack {
    base: *mut u8,
    total: usize,
}

// The mapping is exclusively owned; only the coroutine running on it
// touches its contents.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> SchedResult<Stack> {
        if size < MIN_STACK_SIZE {
            return Err(MemoryError::StackTooSmall(size).into());
        }
        let usable = round_to_page(size);
        let total = usable + GUARD_SIZE;
        let base = unix::map_stack(total)?;
        Ok(Stack { base, total })
    }

    /// High end of the stack (exclusive); the initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Lowest usable address, just above the guard page
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.add(GUARD_SIZE) }
    }

    /// Usable bytes, guard page excluded
    #[inline]
    pub fn size(&self) -> usize {
        self.total - GUARD_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unix::unmap_stack(self.base, self.total);
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("size", &self.size())
            .finish()
    }
}

#[inline]
fn round_to_page(size: usize) -> usize {
    (size + GUARD_SIZE - 1) & !(GUARD_SIZE - 1)
}
