//! Basic cosched example
//!
//! Runs callbacks and yielding coroutines on a scheduler whose caller
//! thread is one of the workers.
//!
//! # Environment Variables
//!
//! - `COSCHED_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `COSCHED_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use cosched::{current_thread_id, kdebug, kinfo, yield_now, Coroutine, Scheduler, Task};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// COSCHED_LOG_LEVEL=debug COSCHED_FLUSH_EPRINT=1 cargo run -p cosched-basic
fn main() {
    println!("=== cosched Basic Example ===\n");

    // 3 threads: 2 spawned workers plus this one
    let sched = Scheduler::new(3, true, "basic");
    if let Err(e) = sched.start() {
        eprintln!("start failed: {}", e);
        return;
    }

    let completed = Arc::new(AtomicUsize::new(0));

    for i in 1..=3 {
        let c = completed.clone();
        sched.spawn(move || {
            kdebug!("[task {}] started", i);
            for j in 0..3 {
                kdebug!("[task {}] iteration {}", i, j);
                yield_now();
            }
            kdebug!("[task {}] finished", i);
            c.fetch_add(1, Ordering::SeqCst);
        });
        println!("Scheduled task {}", i);
    }

    // A coroutine built up front, scheduled like any other item
    let c = completed.clone();
    let co = Coroutine::new(
        Task::new(move || {
            kdebug!("[coroutine {}] running", Coroutine::current_id());
            c.fetch_add(1, Ordering::SeqCst);
        }),
        0,
    );
    println!("Scheduling coroutine {}", co.id());
    sched.schedule(co);

    // Pinned to the caller thread: runs once stop() drives it
    if let Some(&caller) = sched.thread_ids().first() {
        let c = completed.clone();
        sched.schedule_on(
            Task::new(move || {
                kinfo!("pinned task on tid {}", current_thread_id());
                c.fetch_add(1, Ordering::SeqCst);
            }),
            caller,
        );
    }

    println!("\nStopping (drains remaining work)...\n");
    sched.stop();

    kinfo!("{} item(s) completed", completed.load(Ordering::SeqCst));
    println!("\n=== Example Complete ===");
}

