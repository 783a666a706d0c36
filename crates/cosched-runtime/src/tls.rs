//! Thread-local runtime context
//!
//! Per OS thread the runtime tracks:
//!
//! - the coroutine executing right now
//! - the thread-main coroutine (the thread's own stack, created lazily)
//! - the scheduler-main coroutine that dispatched coroutines return to:
//!   the thread-main on worker threads, the root coroutine on a use_caller
//!   thread
//! - the scheduler driving this thread
//!
//! A coroutine may be resumed on a different thread than the one it was
//! suspended on. Accessors are `#[inline(never)]` so a thread-local
//! address is never computed before a switch and reused after it.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::Weak;

use cosched_core::kprint;

use crate::coroutine::{Coroutine, CoroutineRef};
use crate::scheduler::SchedulerInner;
use crate::worker::Tid;

thread_local! {
    static CURRENT: Cell<*const Coroutine> = const { Cell::new(ptr::null()) };

    static THREAD_MAIN: RefCell<Option<CoroutineRef>> = const { RefCell::new(None) };

    static SCHED_MAIN: RefCell<Option<CoroutineRef>> = const { RefCell::new(None) };

    static SCHEDULER: RefCell<Option<Weak<SchedulerInner>>> = const { RefCell::new(None) };

    static THREAD_ID: Cell<Tid> = const { Cell::new(0) };
}

/// Coroutine running on this thread; null before the thread-main exists
#[inline(never)]
pub(crate) fn current() -> *const Coroutine {
    CURRENT.try_with(|cell| cell.get()).unwrap_or(ptr::null())
}

#[inline(never)]
pub(crate) fn set_current(co: &Coroutine) {
    let _ = CURRENT.try_with(|cell| cell.set(co as *const Coroutine));
    kprint::set_coroutine_id(co.id().as_u64());
}

#[inline(never)]
pub(crate) fn thread_main() -> *const Coroutine {
    THREAD_MAIN
        .try_with(|cell| cell.borrow().as_ref().map_or(ptr::null(), |co| CoroutineRef::as_ptr(co)))
        .unwrap_or(ptr::null())
}

#[inline(never)]
pub(crate) fn set_thread_main(co: CoroutineRef) {
    let _ = THREAD_MAIN.try_with(|cell| *cell.borrow_mut() = Some(co));
}

/// Context that `swap_out` returns to; falls back to the thread-main
#[inline(never)]
pub(crate) fn sched_main() -> *const Coroutine {
    let root = SCHED_MAIN
        .try_with(|cell| cell.borrow().as_ref().map_or(ptr::null(), |co| CoroutineRef::as_ptr(co)))
        .unwrap_or(ptr::null());
    if root.is_null() {
        thread_main()
    } else {
        root
    }
}

#[inline(never)]
pub(crate) fn set_sched_main(co: Option<CoroutineRef>) {
    let old = SCHED_MAIN.try_with(|cell| std::mem::replace(&mut *cell.borrow_mut(), co));
    // Dropped outside the borrow; a coroutine's Drop may log
    drop(old);
}

#[inline(never)]
pub(crate) fn scheduler() -> Option<Weak<SchedulerInner>> {
    SCHEDULER.try_with(|cell| cell.borrow().clone()).ok().flatten()
}

#[inline(never)]
pub(crate) fn set_scheduler(sched: Option<Weak<SchedulerInner>>) {
    let _ = SCHEDULER.try_with(|cell| *cell.borrow_mut() = sched);
}

/// Kernel thread id of the calling thread, cached after the first call
#[inline(never)]
pub(crate) fn thread_id() -> Tid {
    THREAD_ID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as Tid;
        cell.set(tid);
        tid
    })
}
