//! # cosched - N:M coroutine scheduler
//!
//! Stackful cooperative coroutines multiplexed over a pool of OS threads,
//! with an epoll reactor that resumes coroutines when their descriptors
//! become ready.
//!
//! ## Quick Start
//!
//! ```ignore
//! use cosched::{Direction, IOManager, Coroutine};
//!
//! let iom = IOManager::new(2, false, "io")?;
//! iom.spawn(move || {
//!     let iom = IOManager::current().unwrap();
//!     iom.add_event(sock_fd, Direction::Write, None).unwrap();
//!     Coroutine::sleep_now(); // resumed once the socket is writable
//! });
//! iom.stop();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        schedule(), spawn(), add_event(), yield_now()        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Scheduler / IOManager                       │
//! │     FIFO queue, affinity scan, idle hook, epoll reactor     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │  (root)   │
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                     Coroutines                          │
//!    │     mmap'd stacks, guard pages, asm context switch      │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use cosched_core::{
    CoroutineId,
    CoroutineState,
    Direction,
    Interest,
    SchedError,
    SchedResult,
    TaskError,
    TaskResult,
};

// Re-export kprint macros for debug logging
pub use cosched_core::{kprint, kprintln, kerror, kwarn, kinfo, kdebug, ktrace};
pub use cosched_core::kprint::{LogLevel, init as init_logging, set_log_level, set_flush_enabled};

// Re-export env utilities
pub use cosched_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use cosched_runtime::{
    config,
    Coroutine,
    CoroutineRef,
    DefaultHooks,
    IOManager,
    RuntimeConfig,
    Scheduler,
    SchedulerHooks,
    Task,
    TaskItem,
    Tid,
    Work,
};
pub use cosched_runtime::worker::current_thread_id;

/// Suspend the running coroutine and ask to be rescheduled
#[inline]
pub fn yield_now() {
    Coroutine::yield_now()
}

/// Suspend the running coroutine until something resumes it
#[inline]
pub fn sleep_now() {
    Coroutine::sleep_now()
}

/// Id of the running coroutine; `CoroutineId::MAIN` on a thread's own stack
#[inline]
pub fn current_id() -> CoroutineId {
    Coroutine::current_id()
}
