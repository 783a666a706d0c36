//! N:M coroutine scheduler
//!
//! A `Scheduler` owns a FIFO queue of task items and a pool of worker
//! threads, each running the dispatch loop (`run`). With `use_caller` the
//! constructing thread is one of the workers: its dispatch loop lives in a
//! root coroutine that `stop()` drives to completion.
//!
//! # Dispatch
//!
//! Each pass scans the queue from the front for the first item this
//! thread may run: items pinned to another thread and coroutines still
//! running elsewhere are skipped (and trigger a tickle). A coroutine item
//! is swapped in directly; a callback item runs on a scratch coroutine
//! that is recycled once the callback finishes. Work that yields (READY)
//! is queued again; work that sleeps (HOLD) is left to whoever resumes it.
//! With nothing to run the worker enters its idle coroutine.
//!
//! # Hooks
//!
//! `tickle`, `stopping` and `idle` are supplied by a `SchedulerHooks`
//! implementation. `DefaultHooks` parks idle workers on a futex; the
//! IOManager's reactor waits in epoll instead.
//!
//! # Lock order
//!
//! Queue lock is innermost: it is never held across a context switch or
//! while calling into hooks, and callers may hold an fd lock when they
//! schedule.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use cosched_core::error::{SchedError, SchedResult};
use cosched_core::kprint::LogLevel;
use cosched_core::{fatal, fatal_unless, kdebug, kerror, kinfo, kprint, ktrace, CoroutineState};

use crate::config::{self, RuntimeConfig};
use crate::coroutine::{Coroutine, CoroutineRef, Task};
use crate::parking::Parker;
use crate::tls;
use crate::worker::{self, Tid};

/// Lock a mutex, ignoring poisoning
///
/// Panics inside tasks are caught at the coroutine boundary, so a poisoned
/// runtime lock only means a logging or hook call panicked.
#[inline]
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something the dispatch loop can run
pub enum Work {
    /// Resume an existing coroutine
    Coroutine(CoroutineRef),
    /// Run a callback on a scratch coroutine
    Task(Task),
}

impl From<CoroutineRef> for Work {
    fn from(co: CoroutineRef) -> Self {
        Work::Coroutine(co)
    }
}

impl From<Task> for Work {
    fn from(task: Task) -> Self {
        Work::Task(task)
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Coroutine(co) => write!(f, "Work::Coroutine({})", co.id()),
            Work::Task(_) => f.write_str("Work::Task"),
        }
    }
}

/// Queue entry: work plus an optional thread to run it on
#[derive(Debug)]
pub struct TaskItem {
    pub work: Work,
    pub affinity: Option<Tid>,
}

impl TaskItem {
    fn runnable_on(&self, tid: Tid) -> bool {
        self.affinity.map_or(true, |t| t == tid)
    }
}

/// Strategy behind a scheduler's wakeup, stop condition and idle loop
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Wake an idle worker so it rechecks the queue
    fn tickle(&self, sched: &Scheduler);

    /// Whether idle workers may exit
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }

    /// Body of each worker's idle coroutine. Must return only once
    /// `sched.stopping()` holds, and suspend with `Coroutine::sleep_now`
    /// whenever there may be work to dispatch.
    fn idle(&self, sched: &Scheduler);

    /// Recover the concrete hooks type
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Futex-parking hooks for a plain scheduler
pub struct DefaultHooks {
    parker: Parker,
    park_timeout: Duration,
}

impl DefaultHooks {
    pub fn new(park_timeout: Duration) -> Self {
        Self {
            parker: Parker::new(),
            park_timeout,
        }
    }
}

impl SchedulerHooks for DefaultHooks {
    fn tickle(&self, sched: &Scheduler) {
        ktrace!("{} tickle", sched.name());
        self.parker.wake_one();
    }

    fn idle(&self, sched: &Scheduler) {
        kdebug!("{} idle", sched.name());
        while !sched.stopping() {
            self.parker.park(self.park_timeout);
            Coroutine::sleep_now();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) struct SchedulerInner {
    name: String,
    config: RuntimeConfig,
    hooks: Arc<dyn SchedulerHooks>,

    queue: Mutex<VecDeque<TaskItem>>,

    /// Spawned workers, the caller thread excluded
    thread_count: usize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    thread_ids: Mutex<Vec<Tid>>,

    active: AtomicUsize,
    idle: AtomicUsize,

    stopping: AtomicBool,
    auto_stop: AtomicBool,

    /// use_caller mode: dispatch loop of the constructing thread
    root: Option<CoroutineRef>,
    root_thread: Option<Tid>,
}

/// Handle to a scheduler; clones share the same pool
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Scheduler with `thread_count` workers using the global config
    ///
    /// With `use_caller` the calling thread counts as one of the workers
    /// and becomes the scheduler's root thread.
    pub fn new(thread_count: usize, use_caller: bool, name: &str) -> Scheduler {
        let config = config::global().clone();
        match Self::with_config(thread_count, use_caller, name, config) {
            Ok(sched) => sched,
            Err(e) => fatal!("scheduler {}: {}", name, e),
        }
    }

    pub fn with_config(
        thread_count: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> SchedResult<Scheduler> {
        let hooks = Arc::new(DefaultHooks::new(config.park_timeout));
        Self::with_hooks(thread_count, use_caller, name, config, hooks)
    }

    /// Scheduler whose tickle/stopping/idle behavior comes from `hooks`
    pub fn with_hooks(
        thread_count: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
        hooks: Arc<dyn SchedulerHooks>,
    ) -> SchedResult<Scheduler> {
        config.validate()?;
        if config.debug_logging || cfg!(feature = "debug-logging") {
            kprint::set_log_level(LogLevel::Debug);
            config.print();
        }
        fatal_unless!(thread_count > 0, "scheduler {} needs at least one thread", name);

        let mut thread_count = thread_count;
        let mut root_thread = None;
        if use_caller {
            Coroutine::current();
            if Scheduler::current().is_some() {
                fatal!("thread already drives a scheduler; cannot create {}", name);
            }
            thread_count -= 1;
            root_thread = Some(worker::current_thread_id());
        }

        let stack_size = config.stack_size;
        let inner = Arc::new_cyclic(|weak: &Weak<SchedulerInner>| {
            let root = use_caller.then(|| {
                let weak = weak.clone();
                Coroutine::new(
                    Task::new(move || {
                        if let Some(inner) = weak.upgrade() {
                            Scheduler { inner }.run();
                        }
                    }),
                    stack_size,
                )
            });

            SchedulerInner {
                name: name.to_string(),
                config,
                hooks,
                queue: Mutex::new(VecDeque::new()),
                thread_count,
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(root_thread.into_iter().collect()),
                active: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root,
                root_thread,
            }
        });

        if use_caller {
            tls::set_scheduler(Some(Arc::downgrade(&inner)));
            tls::set_sched_main(inner.root.clone());
            kprint::set_thread_label(name);
        }

        kdebug!(
            "scheduler {} created: {} worker(s), use_caller={}",
            name,
            thread_count,
            use_caller
        );
        Ok(Scheduler { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<SchedulerInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SchedulerInner>) -> Option<Scheduler> {
        weak.upgrade().map(|inner| Scheduler { inner })
    }

    /// Scheduler driving the calling thread, if any
    pub fn current() -> Option<Scheduler> {
        tls::scheduler().and_then(|weak| Scheduler::upgrade(&weak))
    }

    /// Context that dispatched coroutines return to on this thread: the
    /// root coroutine on a use_caller thread, the thread-main elsewhere
    pub fn current_main_coroutine() -> CoroutineRef {
        Coroutine::current();
        let ptr = tls::sched_main();
        // Held by this thread's TLS
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn SchedulerHooks> {
        &self.inner.hooks
    }

    pub(crate) fn is_same(&self, other: &Scheduler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Thread ids of all workers, the caller thread first in use_caller mode
    pub fn thread_ids(&self) -> Vec<Tid> {
        lock(&self.inner.thread_ids).clone()
    }

    pub fn has_idle_threads(&self) -> bool {
        self.inner.idle.load(Ordering::SeqCst) > 0
    }

    pub fn idle_thread_count(&self) -> usize {
        self.inner.idle.load(Ordering::SeqCst)
    }

    pub fn active_thread_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Spawn the worker threads. Calling it again while running is a no-op;
    /// restarting after `stop()` is refused.
    pub fn start(&self) -> SchedResult<()> {
        let inner = &self.inner;
        let mut threads = lock(&inner.threads);
        if inner.auto_stop.load(Ordering::SeqCst) {
            return Err(SchedError::Stopped);
        }
        if !inner.stopping.load(Ordering::SeqCst) {
            return Ok(());
        }
        inner.stopping.store(false, Ordering::SeqCst);

        for i in 0..inner.thread_count {
            let sched = self.clone();
            let (handle, tid) =
                worker::spawn_worker(format!("{}_{}", inner.name, i), move || sched.run())?;
            threads.push(handle);
            lock(&inner.thread_ids).push(tid);
        }
        kinfo!("scheduler {} started with {} worker(s)", inner.name, inner.thread_count);
        Ok(())
    }

    /// Stop accepting idleness: drain the queue, run the caller thread's
    /// share of work in use_caller mode, then join every worker
    ///
    /// In use_caller mode this must be called on the caller thread. Workers
    /// hold their own handles, so dropping every `Scheduler` without
    /// calling `stop()` leaves them running.
    pub fn stop(&self) {
        let inner = &self.inner;
        inner.auto_stop.store(true, Ordering::SeqCst);

        if let Some(root) = &inner.root {
            if inner.thread_count == 0
                && matches!(root.state(), CoroutineState::Term | CoroutineState::Init)
            {
                inner.stopping.store(true, Ordering::SeqCst);
                if self.stopping() {
                    kinfo!("scheduler {} stopped", inner.name);
                    self.release_caller_thread();
                    return;
                }
            }
        }

        let on_own_thread = Scheduler::current().is_some_and(|s| s.is_same(self));
        fatal_unless!(
            inner.root.is_none() || on_own_thread,
            "scheduler {}: stop() must run on its caller thread",
            inner.name
        );
        fatal_unless!(
            inner.root.is_some() || !on_own_thread,
            "scheduler {}: stop() called from one of its workers",
            inner.name
        );

        inner.stopping.store(true, Ordering::SeqCst);
        for _ in 0..inner.thread_count {
            self.tickle();
        }
        if inner.root.is_some() {
            self.tickle();
        }

        if let Some(root) = &inner.root {
            if !self.stopping() {
                let state = root.call();
                kdebug!("scheduler {} root coroutine left in {}", inner.name, state);
            }
        }

        let threads = std::mem::take(&mut *lock(&inner.threads));
        for handle in threads {
            if let Err(e) = worker::join_worker(handle) {
                kerror!("scheduler {}: {}", inner.name, e);
            }
        }

        self.release_caller_thread();
        kinfo!("scheduler {} stopped", inner.name);
    }

    fn release_caller_thread(&self) {
        if self.inner.root.is_some() && self.inner.root_thread == Some(worker::current_thread_id()) {
            tls::set_sched_main(None);
            tls::set_scheduler(None);
        }
    }

    /// Queue work for any thread
    pub fn schedule(&self, work: impl Into<Work>) {
        self.schedule_item(TaskItem {
            work: work.into(),
            affinity: None,
        });
    }

    /// Queue work pinned to thread `tid`
    pub fn schedule_on(&self, work: impl Into<Work>, tid: Tid) {
        self.schedule_item(TaskItem {
            work: work.into(),
            affinity: Some(tid),
        });
    }

    /// Queue a callback for any thread
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::new(f));
    }

    pub fn schedule_item(&self, item: TaskItem) {
        let need_tickle = {
            let mut queue = lock(&self.inner.queue);
            let was_empty = queue.is_empty();
            queue.push_back(item);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue several items under one lock acquisition, tickling at most once
    pub fn schedule_batch<I, W>(&self, items: I)
    where
        I: IntoIterator<Item = W>,
        W: Into<Work>,
    {
        let need_tickle = {
            let mut queue = lock(&self.inner.queue);
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(items.into_iter().map(|w| TaskItem {
                work: w.into(),
                affinity: None,
            }));
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.tickle();
        }
    }

    pub fn tickle(&self) {
        self.inner.hooks.tickle(self);
    }

    /// Whether idle workers may exit: the hooks' stop condition
    pub fn stopping(&self) -> bool {
        self.inner.hooks.stopping(self)
    }

    /// Stop requested, queue empty and no task in flight
    pub fn base_stopping(&self) -> bool {
        let inner = &self.inner;
        let queue = lock(&inner.queue);
        inner.auto_stop.load(Ordering::SeqCst)
            && inner.stopping.load(Ordering::SeqCst)
            && queue.is_empty()
            && inner.active.load(Ordering::SeqCst) == 0
    }

    /// Remove the first item this thread may run
    fn take_next(&self, me: Tid) -> Option<Work> {
        let mut tickle_me = false;
        let picked = {
            let mut queue = lock(&self.inner.queue);
            let pos = queue.iter().position(|item| {
                if !item.runnable_on(me) {
                    tickle_me = true;
                    return false;
                }
                if let Work::Coroutine(co) = &item.work {
                    if co.is_running() {
                        tickle_me = true;
                        return false;
                    }
                }
                true
            });
            let item = pos.and_then(|i| queue.remove(i));
            if item.is_some() {
                self.inner.active.fetch_add(1, Ordering::SeqCst);
            }
            item
        };
        if tickle_me {
            self.tickle();
        }
        picked.map(|item| item.work)
    }

    fn task_done(&self) {
        self.inner.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Dispatch loop of one worker
    fn run(&self) {
        let inner = &self.inner;
        tls::set_scheduler(Some(self.downgrade()));
        let me = worker::current_thread_id();
        if inner.root_thread != Some(me) {
            // Worker threads return to their own context between tasks
            Coroutine::current();
        }
        kdebug!("scheduler {} dispatch loop on tid {}", inner.name, me);

        let stack_size = inner.config.stack_size;
        let idle_co = {
            let sched = self.clone();
            Coroutine::new(Task::new(move || sched.hooks().idle(&sched)), stack_size)
        };
        let mut scratch: Option<CoroutineRef> = None;

        loop {
            match self.take_next(me) {
                Some(Work::Coroutine(co)) => {
                    if co.state().is_finished() {
                        self.task_done();
                        continue;
                    }
                    let state = co.swap_in();
                    if state == CoroutineState::Ready {
                        self.schedule(co);
                    }
                    self.task_done();
                }
                Some(Work::Task(task)) => {
                    let co = match scratch.take() {
                        Some(co) => {
                            co.reset(task);
                            co
                        }
                        None => Coroutine::new(task, stack_size),
                    };
                    let state = co.swap_in();
                    if state == CoroutineState::Ready {
                        self.schedule(co);
                    } else if state.is_finished() {
                        co.clear_task();
                        scratch = Some(co);
                    }
                    // HOLD: whoever resumes it owns it now
                    self.task_done();
                }
                None => {
                    if idle_co.state().is_finished() {
                        break;
                    }
                    inner.idle.fetch_add(1, Ordering::SeqCst);
                    let state = idle_co.swap_in();
                    inner.idle.fetch_sub(1, Ordering::SeqCst);
                    if state.is_finished() {
                        kdebug!("scheduler {} idle coroutine finished in {}", inner.name, state);
                        break;
                    }
                }
            }
        }

        if inner.root_thread != Some(me) {
            tls::set_scheduler(None);
        }
        kdebug!("scheduler {} dispatch loop on tid {} exits", inner.name, me);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("threads", &self.inner.thread_count)
            .field("active", &self.active_thread_count())
            .field("idle", &self.idle_thread_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Instant;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig::new()
            .stack_size(256 * 1024)
            .park_timeout(Duration::from_millis(10))
    }

    #[test]
    fn test_callbacks_run_exactly_once() {
        const N: usize = 500;
        let sched = Scheduler::with_config(4, false, "once", test_config()).unwrap();
        sched.start().unwrap();

        let hits: Arc<Vec<AtomicU32>> = Arc::new((0..N).map(|_| AtomicU32::new(0)).collect());
        for i in 0..N {
            let hits = Arc::clone(&hits);
            sched.spawn(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();

        assert!(hits.iter().all(|h| h.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_start_stop_without_work() {
        let sched = Scheduler::with_config(3, false, "empty", test_config()).unwrap();
        sched.start().unwrap();
        assert_eq!(sched.thread_ids().len(), 3);

        let started = Instant::now();
        sched.stop();
        assert!(sched.stopping());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Hooks that note, as each worker's idle loop ends, whether the
    /// scheduler reported itself stopping
    struct RecordingHooks {
        inner: DefaultHooks,
        exits: Mutex<Vec<bool>>,
    }

    impl SchedulerHooks for RecordingHooks {
        fn tickle(&self, sched: &Scheduler) {
            self.inner.tickle(sched);
        }

        fn idle(&self, sched: &Scheduler) {
            self.inner.idle(sched);
            lock(&self.exits).push(sched.stopping());
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn test_workers_exit_only_once_stopping() {
        let hooks = Arc::new(RecordingHooks {
            inner: DefaultHooks::new(Duration::from_millis(10)),
            exits: Mutex::new(Vec::new()),
        });
        let sched =
            Scheduler::with_hooks(3, false, "exits", test_config(), hooks.clone()).unwrap();
        sched.start().unwrap();
        for _ in 0..16 {
            sched.spawn(|| Coroutine::yield_now());
        }
        sched.stop();

        let exits = lock(&hooks.exits);
        assert_eq!(exits.len(), 3);
        assert!(exits.iter().all(|&stopping| stopping));
    }

    #[test]
    fn test_yielding_task_resumed_k_plus_one_times() {
        const K: u32 = 7;
        let sched = Scheduler::with_config(2, false, "yield", test_config()).unwrap();
        sched.start().unwrap();

        let resumes = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&resumes);
        sched.spawn(move || {
            r.fetch_add(1, Ordering::SeqCst);
            for _ in 0..K {
                Coroutine::yield_now();
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
        sched.stop();

        assert_eq!(resumes.load(Ordering::SeqCst), K + 1);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        thread::spawn(|| {
            let caller = worker::current_thread_id();
            let sched = Scheduler::with_config(1, true, "caller", test_config()).unwrap();
            assert!(Scheduler::current().is_some());
            assert_eq!(sched.thread_ids(), vec![caller]);
            sched.start().unwrap();

            let ran_on = Arc::new(Mutex::new(Vec::new()));
            for _ in 0..10 {
                let ran_on = Arc::clone(&ran_on);
                sched.spawn(move || lock(&ran_on).push(worker::current_thread_id()));
            }
            // Nothing runs until the caller thread dispatches
            assert!(lock(&ran_on).is_empty());

            sched.stop();
            let ran_on = lock(&ran_on);
            assert_eq!(ran_on.len(), 10);
            assert!(ran_on.iter().all(|&tid| tid == caller));
            assert!(Scheduler::current().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_affinity_pins_to_thread() {
        let sched = Scheduler::with_config(3, false, "pin", test_config()).unwrap();
        sched.start().unwrap();
        let target = sched.thread_ids()[1];

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..20 {
            let seen = Arc::clone(&seen);
            sched.schedule_on(
                Task::new(move || lock(&seen).push(worker::current_thread_id())),
                target,
            );
        }
        sched.stop();

        let seen = lock(&seen);
        assert_eq!(seen.len(), 20);
        assert!(seen.iter().all(|&tid| tid == target));
    }

    #[test]
    fn test_schedule_batch() {
        let sched = Scheduler::with_config(2, false, "batch", test_config()).unwrap();
        sched.start().unwrap();

        let count = Arc::new(AtomicU32::new(0));
        let tasks: Vec<Task> = (0..64)
            .map(|_| {
                let count = Arc::clone(&count);
                Task::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sched.schedule_batch(tasks);
        sched.stop();

        assert_eq!(count.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_sleeping_coroutine_resumed_by_schedule() {
        let sched = Scheduler::with_config(2, false, "wake", test_config()).unwrap();
        sched.start().unwrap();

        let parked: Arc<Mutex<Option<CoroutineRef>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(AtomicBool::new(false));
        {
            let parked = Arc::clone(&parked);
            let done = Arc::clone(&done);
            sched.spawn(move || {
                *lock(&parked) = Some(Coroutine::current());
                Coroutine::sleep_now();
                done.store(true, Ordering::SeqCst);
            });
        }

        let co = loop {
            if let Some(co) = lock(&parked).take() {
                break co;
            }
            thread::yield_now();
        };
        assert!(!done.load(Ordering::SeqCst));
        sched.schedule(co);
        sched.stop();

        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_called_coroutine_returns_to_root_dispatch() {
        thread::spawn(|| {
            let sched = Scheduler::with_config(1, true, "mixed", test_config()).unwrap();
            sched.start().unwrap();

            let hits = Arc::new(AtomicU32::new(0));
            let h = Arc::clone(&hits);
            let co = Coroutine::new(
                Task::new(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                    Coroutine::yield_now();
                    h.fetch_add(1, Ordering::SeqCst);
                    Coroutine::yield_now();
                    h.fetch_add(1, Ordering::SeqCst);
                }),
                256 * 1024,
            );
            // First leg driven straight from the thread's own context
            assert_eq!(co.call(), CoroutineState::Ready);
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            sched.schedule(Arc::clone(&co));
            let h = Arc::clone(&hits);
            sched.spawn(move || {
                h.fetch_add(100, Ordering::SeqCst);
            });
            sched.stop();

            assert_eq!(hits.load(Ordering::SeqCst), 103);
            assert_eq!(co.state(), CoroutineState::Term);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_coroutine_queued_while_running_resumed_once() {
        let sched = Scheduler::with_config(3, false, "requeue", test_config()).unwrap();
        sched.start().unwrap();

        let resumed = Arc::new(AtomicU32::new(0));
        let before_sleep = Arc::new(AtomicU32::new(u32::MAX));
        let co = {
            let sched = sched.clone();
            let resumed = Arc::clone(&resumed);
            let before_sleep = Arc::clone(&before_sleep);
            Coroutine::new(
                Task::new(move || {
                    // Queued while still executing on this thread
                    sched.schedule(Coroutine::current());
                    thread::sleep(Duration::from_millis(30));
                    before_sleep.store(resumed.load(Ordering::SeqCst), Ordering::SeqCst);
                    Coroutine::sleep_now();
                    resumed.fetch_add(1, Ordering::SeqCst);
                }),
                256 * 1024,
            )
        };

        let c = Arc::clone(&co);
        let first = thread::spawn(move || c.call()).join().unwrap();
        assert_eq!(first, CoroutineState::Hold);
        sched.stop();

        assert_eq!(before_sleep.load(Ordering::SeqCst), 0);
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
        assert_eq!(co.state(), CoroutineState::Term);
    }

    #[test]
    fn test_current_inside_task() {
        let sched = Scheduler::with_config(1, false, "whoami", test_config()).unwrap();
        sched.start().unwrap();

        let name = Arc::new(Mutex::new(String::new()));
        let n = Arc::clone(&name);
        sched.spawn(move || {
            if let Some(s) = Scheduler::current() {
                *lock(&n) = s.name().to_string();
            }
        });
        sched.stop();

        assert_eq!(*lock(&name), "whoami");
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_failing_task_does_not_kill_worker() {
        let sched = Scheduler::with_config(1, false, "faults", test_config()).unwrap();
        sched.start().unwrap();

        let after = Arc::new(AtomicBool::new(false));
        sched.schedule(Task::fallible(|| Err("refused".into())));
        sched.spawn(|| panic!("task panic"));
        let a = Arc::clone(&after);
        sched.spawn(move || a.store(true, Ordering::SeqCst));
        sched.stop();

        assert!(after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_restart_refused() {
        let sched = Scheduler::with_config(1, false, "once-only", test_config()).unwrap();
        sched.start().unwrap();
        assert!(sched.start().is_ok());
        sched.stop();
        assert_eq!(sched.start(), Err(SchedError::Stopped));
    }
}
