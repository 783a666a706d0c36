//! # cosched-core
//!
//! Core types for the cosched coroutine scheduler.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, stacks, the scheduler and the epoll reactor live in
//! `cosched-runtime`.
//!
//! ## Modules
//!
//! - `id` - Coroutine identifier type
//! - `state` - Coroutine lifecycle states
//! - `event` - I/O readiness directions and interest masks
//! - `slot` - Generational slot arena (index + generation keys)
//! - `spinlock` - Internal spinlock primitive
//! - `error` - Error types
//! - `kprint` - Kernel-style leveled logging macros
//! - `diag` - Backtrace capture and the `fatal!` assertion
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod event;
pub mod slot;
pub mod spinlock;
pub mod error;
pub mod kprint;
pub mod diag;
pub mod env;

// Re-exports for convenience
pub use id::CoroutineId;
pub use state::CoroutineState;
pub use event::{Direction, Interest};
pub use slot::{SlotKey, SlotTable};
pub use spinlock::SpinLock;
pub use error::{
    ConfigError, MemoryError, SchedError, SchedResult, TaskError, TaskResult, WorkerError,
};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

/// Constants shared by core and runtime
pub mod constants {
    /// Smallest stack the runtime will hand out
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Guard page size (4 KB)
    pub const GUARD_SIZE: usize = 4096;
}
