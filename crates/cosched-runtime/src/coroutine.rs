//! Stackful coroutines
//!
//! A `Coroutine` owns an mmap'd stack, a saved register block and an
//! optional task. It is always handled through `CoroutineRef`
//! (`Arc<Coroutine>`), so the scheduler queue, an fd's event slot and a
//! running worker can each hold it.
//!
//! Two ways to transfer control:
//!
//! - `swap_in` / `swap_out`: between the coroutine and the scheduler-main
//!   context of the current thread (dispatch loop)
//! - `call` / `back`: between the coroutine and the thread's own main
//!   context (the root coroutine of a use_caller scheduler)
//!
//! `yield_now`, `sleep_now` and task completion switch back to whichever
//! context resumed the coroutine last, so one coroutine may be driven by
//! `call` first and by a dispatch loop later.
//!
//! Each OS thread gets a thread-main coroutine the first time it asks for
//! `Coroutine::current()`. It has id 0, no stack, and stands for the
//! thread's original context.
//!
//! The entry trampoline receives a `SlotKey`, not a pointer or handle:
//! it resolves its coroutine through the global slot arena, so a coroutine
//! never owns a reference to itself.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use cosched_core::diag::capture_backtrace;
use cosched_core::{
    fatal, kdebug, kerror, kwarn, CoroutineId, CoroutineState, SlotKey, SlotTable, SpinLock,
    TaskResult,
};

use crate::arch::{init_context, switch_context, SavedRegs};
use crate::config;
use crate::memory::Stack;
use crate::tls;

/// Shared handle to a coroutine
pub type CoroutineRef = Arc<Coroutine>;

/// A unit of work run on a coroutine stack
///
/// Infallible closures go through `Task::new`; closures returning
/// `TaskResult` through `Task::fallible`. An `Err` or a panic marks the
/// coroutine `EXCEPT`.
pub struct Task(Box<dyn FnOnce() -> TaskResult + Send + 'static>);

impl Task {
    pub fn new<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task(Box::new(move || {
            f();
            Ok(())
        }))
    }

    pub fn fallible<F>(f: F) -> Task
    where
        F: FnOnce() -> TaskResult + Send + 'static,
    {
        Task(Box::new(f))
    }

    fn run(self) -> TaskResult {
        (self.0)()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Task")
    }
}

/// Non-owning pointer stored in the slot arena
#[derive(Clone, Copy)]
struct CoroutinePtr(*const Coroutine);

// Only dereferenced by the trampoline while the coroutine is running,
// which requires a live handle held by whoever resumed it.
unsafe impl Send for CoroutinePtr {}
unsafe impl Sync for CoroutinePtr {}

static COROUTINE_SLOTS: SlotTable<CoroutinePtr> = SlotTable::new();

static TOTAL: AtomicUsize = AtomicUsize::new(0);

pub struct Coroutine {
    id: CoroutineId,

    /// Arena key handed to the trampoline; `None` for thread-main
    key: Option<SlotKey>,

    state: AtomicU8,

    /// Set from resume until the resumer has observed the switch back.
    /// The state alone is not enough: a coroutine marks itself HOLD before
    /// its registers are saved.
    on_cpu: AtomicBool,

    regs: UnsafeCell<SavedRegs>,

    stack: Option<Stack>,

    task: SpinLock<Option<Task>>,

    /// Context saved by the last `resume_from`; suspension returns there
    resumer: AtomicPtr<Coroutine>,
}

// regs is only touched by the thread that owns `on_cpu`.
unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

impl Coroutine {
    /// Create a coroutine in `INIT`
    ///
    /// `stack_size` 0 selects the configured default. Nothing runs until
    /// the first `swap_in` or `call`. Stack allocation failure aborts.
    pub fn new(task: Task, stack_size: usize) -> CoroutineRef {
        let size = if stack_size == 0 {
            config::global().stack_size
        } else {
            stack_size
        };
        let stack = match Stack::new(size) {
            Ok(stack) => stack,
            Err(e) => fatal!("coroutine stack of {} bytes: {}", size, e),
        };

        let key = COROUTINE_SLOTS.reserve();
        let co = Arc::new(Coroutine {
            id: CoroutineId::next(),
            key: Some(key),
            state: AtomicU8::new(CoroutineState::Init as u8),
            on_cpu: AtomicBool::new(false),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: Some(stack),
            task: SpinLock::new(Some(task)),
            resumer: AtomicPtr::new(std::ptr::null_mut()),
        });
        COROUTINE_SLOTS.fill(key, CoroutinePtr(Arc::as_ptr(&co)));
        co.prepare_context();
        TOTAL.fetch_add(1, Ordering::Relaxed);

        kdebug!("coroutine {} created, stack {} bytes", co.id, co.stack_size());
        co
    }

    fn new_thread_main() -> CoroutineRef {
        TOTAL.fetch_add(1, Ordering::Relaxed);
        Arc::new(Coroutine {
            id: CoroutineId::MAIN,
            key: None,
            state: AtomicU8::new(CoroutineState::Exec as u8),
            on_cpu: AtomicBool::new(true),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: None,
            task: SpinLock::new(None),
            resumer: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    fn prepare_context(&self) {
        let (Some(stack), Some(key)) = (&self.stack, self.key) else {
            fatal!("coroutine {} has no stack to enter", self.id);
        };
        unsafe {
            init_context(
                self.regs.get(),
                stack.top(),
                coroutine_entry,
                key.to_raw() as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> CoroutineId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> CoroutineState {
        CoroutineState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: CoroutineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Usable stack bytes; 0 for a thread-main coroutine
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    /// True for the coroutine standing for a thread's own context
    #[inline]
    pub fn is_thread_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Executing, or suspended but not yet fully switched out
    #[inline]
    pub fn is_running(&self) -> bool {
        self.state() == CoroutineState::Exec || self.on_cpu.load(Ordering::Acquire)
    }

    /// Rearm a finished (or never started) coroutine with a new task,
    /// reusing its stack. State returns to `INIT`.
    pub fn reset(&self, task: Task) {
        if self.is_thread_main() {
            fatal!("reset of thread-main coroutine");
        }
        let state = self.state();
        if !state.can_reset() || self.on_cpu.load(Ordering::Acquire) {
            fatal!("reset of coroutine {} in state {}", self.id, state);
        }
        *self.task.lock() = Some(task);
        self.prepare_context();
        self.set_state(CoroutineState::Init);
    }

    /// Drop the task without running it; used to park a finished scratch
    /// coroutine until its next `reset`
    pub(crate) fn clear_task(&self) {
        let task = self.task.lock().take();
        drop(task);
    }

    /// Switch from the scheduler-main context into this coroutine
    ///
    /// Returns the state the coroutine left in once it switches back.
    pub fn swap_in(&self) -> CoroutineState {
        let from = tls::sched_main();
        if from.is_null() {
            fatal!("swap_in of coroutine {} without a scheduler context", self.id);
        }
        self.resume_from(unsafe { &*from })
    }

    /// Switch from the thread's own main context into this coroutine
    pub fn call(&self) -> CoroutineState {
        Coroutine::current();
        let from = tls::thread_main();
        self.resume_from(unsafe { &*from })
    }

    #[inline(never)]
    fn resume_from(&self, from: &Coroutine) -> CoroutineState {
        if self.is_thread_main() {
            fatal!("resume of a thread-main coroutine");
        }
        // A coroutine that just suspended elsewhere may still be saving
        // its registers; wait for that switch to finish.
        while self
            .on_cpu
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        let state = self.state();
        if !state.is_resumable() {
            fatal!("resume of coroutine {} in state {}", self.id, state);
        }

        self.resumer
            .store(from as *const Coroutine as *mut Coroutine, Ordering::Release);
        self.set_state(CoroutineState::Exec);
        tls::set_current(self);
        unsafe { switch_context(from.regs.get(), self.regs.get()) };
        tls::set_current(from);

        // Returned without yield/sleep: treat as suspended
        let mut state = self.state();
        if state == CoroutineState::Exec {
            state = CoroutineState::Hold;
            self.set_state(state);
        }
        self.on_cpu.store(false, Ordering::Release);
        state
    }

    /// Switch from this coroutine back to the scheduler-main context
    #[inline(never)]
    pub fn swap_out(&self) {
        let to = tls::sched_main();
        self.switch_to(to);
    }

    /// Switch from this coroutine back to the thread's own main context
    #[inline(never)]
    pub fn back(&self) {
        let to = tls::thread_main();
        self.switch_to(to);
    }

    /// Switch back to the context that resumed this coroutine
    #[inline(never)]
    fn return_to_resumer(&self) {
        let to = self.resumer.load(Ordering::Acquire);
        self.switch_to(to);
    }

    fn switch_to(&self, to: *const Coroutine) {
        if to.is_null() || std::ptr::eq(to, self) {
            fatal!("coroutine {} has no context to return to", self.id);
        }
        unsafe { switch_context(self.regs.get(), (*to).regs.get()) };
    }

    /// Handle to the coroutine running on this thread
    ///
    /// Creates the thread-main coroutine on first use.
    pub fn current() -> CoroutineRef {
        let ptr = tls::current();
        if !ptr.is_null() {
            // Every Coroutine lives in an Arc and the running one is kept
            // alive by whoever resumed it.
            unsafe {
                Arc::increment_strong_count(ptr);
                return Arc::from_raw(ptr);
            }
        }
        let main = Coroutine::new_thread_main();
        tls::set_thread_main(Arc::clone(&main));
        tls::set_current(&main);
        main
    }

    /// Id of the running coroutine; 0 on a thread's own context
    pub fn current_id() -> CoroutineId {
        let ptr = tls::current();
        if ptr.is_null() {
            CoroutineId::MAIN
        } else {
            unsafe { (*ptr).id }
        }
    }

    /// Live coroutine objects, thread-mains included
    pub fn total() -> usize {
        TOTAL.load(Ordering::Relaxed)
    }

    /// Suspend the running coroutine and ask to be rescheduled
    pub fn yield_now() {
        Self::suspend_current(CoroutineState::Ready);
    }

    /// Suspend the running coroutine until something resumes it
    /// explicitly (an I/O event, a `schedule` call)
    pub fn sleep_now() {
        Self::suspend_current(CoroutineState::Hold);
    }

    #[inline(never)]
    fn suspend_current(state: CoroutineState) {
        let ptr = tls::current();
        if ptr.is_null() {
            fatal!("suspend outside of any coroutine");
        }
        // Kept alive by the resumer until it observes this switch
        let cur = unsafe { &*ptr };
        if cur.is_thread_main() {
            fatal!("thread-main coroutine cannot suspend");
        }
        cur.set_state(state);
        cur.return_to_resumer();
    }

    /// Body of the trampoline, once the coroutine is resolved
    fn run_task(&self) {
        let task = self.task.lock().take();
        let state = match task {
            None => CoroutineState::Term,
            Some(task) => match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                Ok(Ok(())) => CoroutineState::Term,
                Ok(Err(e)) => {
                    kerror!("coroutine {} failed: {}\n{}", self.id, e, capture_backtrace());
                    CoroutineState::Except
                }
                Err(payload) => {
                    kerror!(
                        "coroutine {} panicked: {}\n{}",
                        self.id,
                        panic_message(&*payload),
                        capture_backtrace()
                    );
                    CoroutineState::Except
                }
            },
        };
        self.set_state(state);
    }

    fn finish(&self) -> ! {
        self.return_to_resumer();
        fatal!("coroutine {} resumed after it finished", self.id);
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        TOTAL.fetch_sub(1, Ordering::Relaxed);
        if let Some(key) = self.key {
            COROUTINE_SLOTS.remove(key);
        }
        if self.stack.is_some() {
            let state = self.state();
            if !matches!(
                state,
                CoroutineState::Init | CoroutineState::Term | CoroutineState::Except
            ) {
                kwarn!("coroutine {} dropped while suspended in state {}", self.id, state);
            }
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// First Rust frame on every coroutine stack
extern "C" fn coroutine_entry(raw_key: usize) -> ! {
    let key = SlotKey::from_raw(raw_key as u64);
    let co = match COROUTINE_SLOTS.get(key) {
        Some(CoroutinePtr(ptr)) => ptr,
        None => fatal!("coroutine entry with stale slot key {:?}", key),
    };
    // The resumer holds a handle for as long as this coroutine runs
    let co = unsafe { &*co };
    co.run_task();
    co.finish()
}
