//! # cosched-runtime
//!
//! Linux runtime for the cosched coroutine scheduler.
//!
//! This crate provides:
//! - Stack allocation with guard pages (mmap)
//! - Context switching (architecture-specific assembly)
//! - Stackful coroutines with a slot-arena entry trampoline
//! - The N:M scheduler and its worker threads
//! - The epoll-driven IOManager

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("cosched-runtime supports Linux only (epoll)");
    }
}

pub mod arch;
pub mod config;
pub mod coroutine;
pub mod iomanager;
pub mod memory;
pub mod parking;
pub mod scheduler;
pub mod worker;

mod tls;

// Re-exports
pub use config::RuntimeConfig;
pub use coroutine::{Coroutine, CoroutineRef, Task};
pub use iomanager::IOManager;
pub use scheduler::{DefaultHooks, Scheduler, SchedulerHooks, TaskItem, Work};
pub use worker::Tid;
