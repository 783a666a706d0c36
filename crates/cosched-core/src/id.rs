//! Coroutine identifier type

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a coroutine
///
/// Ids are handed out from a process-wide monotonically increasing counter
/// starting at 1. The value 0 is reserved for thread-main coroutines, which
/// capture an OS thread's own context instead of owning a stack.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroutineId(u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

impl CoroutineId {
    /// Id shared by every thread-main coroutine
    pub const MAIN: CoroutineId = CoroutineId(0);

    /// Allocate the next id
    #[inline]
    pub fn next() -> Self {
        CoroutineId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a CoroutineId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        CoroutineId(id)
    }

    /// Get the raw value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True for the thread-main sentinel
    #[inline]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for CoroutineId {
    #[inline]
    fn from(id: u64) -> Self {
        CoroutineId(id)
    }
}

impl From<CoroutineId> for u64 {
    #[inline]
    fn from(id: CoroutineId) -> Self {
        id.0
    }
}

impl fmt::Debug for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            write!(f, "CoroutineId(MAIN)")
        } else {
            write!(f, "CoroutineId({})", self.0)
        }
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for CoroutineId {
    fn default() -> Self {
        CoroutineId::MAIN
    }
}
