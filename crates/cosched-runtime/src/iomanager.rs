//! epoll-driven IOManager
//!
//! An `IOManager` is a `Scheduler` whose hooks come from a `Reactor`:
//!
//! - `idle` blocks in `epoll_wait` (bounded by the configured timeout),
//!   turns readiness into scheduled work and yields back to dispatch
//! - `tickle` writes one byte to a non-blocking wake pipe, but only when
//!   some worker is idle
//! - `stopping` additionally waits for every armed event to fire or be
//!   removed
//!
//! Each descriptor has an `FdContext` in a table indexed by fd number that
//! only ever grows. A direction (read/write) is armed at most once; when it
//! fires, or is cancelled, the stored callback or coroutine is handed to
//! the scheduler that armed it. Registrations are edge-triggered and
//! one-shot per direction: the mask is recomputed and re-applied each time
//! a direction fires.
//!
//! Lock order: fd table (read) -> fd state -> scheduler queue.

use std::fmt;
use std::ops::Deref;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use nix::errno::Errno;

use cosched_core::error::{SchedError, SchedResult};
use cosched_core::{debug_invariant, fatal, kdebug, kerror, ktrace, kwarn, Direction, Interest};

use crate::config::{self, RuntimeConfig};
use crate::coroutine::{Coroutine, CoroutineRef, Task};
use crate::scheduler::{lock, Scheduler, SchedulerHooks, SchedulerInner};

/// What to resume when a direction fires
#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<SchedulerInner>>,
    coroutine: Option<CoroutineRef>,
    task: Option<Task>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.coroutine.is_none() && self.task.is_none()
    }
}

#[derive(Default)]
struct FdState {
    events: Interest,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn context_mut(&mut self, dir: Direction) -> &mut EventContext {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    /// Disarm `dir` and hand its waiter to the scheduler that armed it
    fn trigger(&mut self, fd: RawFd, dir: Direction) {
        debug_invariant!(
            self.events.contains(dir),
            "fd {} triggered {} while armed {}",
            fd,
            dir,
            self.events
        );
        self.events = self.events.without(dir);
        let ctx = std::mem::take(self.context_mut(dir));

        let Some(sched) = ctx.scheduler.as_ref().and_then(Scheduler::upgrade) else {
            kwarn!("fd {} {} fired after its scheduler went away", fd, dir);
            return;
        };
        if let Some(task) = ctx.task {
            sched.schedule(task);
        } else if let Some(co) = ctx.coroutine {
            sched.schedule(co);
        }
    }
}

pub(crate) struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Mutex::new(FdState::default()),
        }
    }
}

fn epoll_bits(interest: Interest) -> u32 {
    let mut bits = libc::EPOLLET as u32;
    if interest.contains(Direction::Read) {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.contains(Direction::Write) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn ctl_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "epoll_ctl(ADD)",
        libc::EPOLL_CTL_MOD => "epoll_ctl(MOD)",
        _ => "epoll_ctl(DEL)",
    }
}

fn os_error(op: &'static str) -> SchedError {
    SchedError::Os {
        op,
        errno: Errno::last() as i32,
    }
}

/// epoll instance, wake pipe and fd table behind an IOManager
pub(crate) struct Reactor {
    epoll: OwnedFd,
    wake_read: OwnedFd,
    wake_write: OwnedFd,
    fds: RwLock<Vec<Arc<FdContext>>>,
    /// Directions armed across all descriptors
    pending: AtomicUsize,
    timeout_ms: i32,
    max_events: usize,
}

impl Reactor {
    fn new(config: &RuntimeConfig) -> SchedResult<Reactor> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(os_error("epoll_create1"));
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
            return Err(os_error("pipe2"));
        }
        let (wake_read, wake_write) =
            unsafe { (OwnedFd::from_raw_fd(pipe[0]), OwnedFd::from_raw_fd(pipe[1])) };

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe[0], &mut ev) } < 0 {
            return Err(os_error("epoll_ctl(ADD)"));
        }

        let table = (0..config.fd_table_capacity)
            .map(|fd| Arc::new(FdContext::new(fd as RawFd)))
            .collect();

        Ok(Reactor {
            epoll,
            wake_read,
            wake_write,
            fds: RwLock::new(table),
            pending: AtomicUsize::new(0),
            timeout_ms: config.epoll_timeout_ms(),
            max_events: config.epoll_max_events,
        })
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let table = self.fds.read().unwrap_or_else(PoisonError::into_inner);
        usize::try_from(fd).ok().and_then(|i| table.get(i)).cloned()
    }

    /// Context for `fd`, growing the table to about 1.5x `fd` if needed
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        if let Some(ctx) = self.lookup(fd) {
            return ctx;
        }
        let mut table = self.fds.write().unwrap_or_else(PoisonError::into_inner);
        let index = fd as usize;
        let new_len = (index * 3 / 2).max(index + 1);
        if table.len() < new_len {
            let old_len = table.len();
            table.extend((old_len..new_len).map(|i| Arc::new(FdContext::new(i as RawFd))));
            kdebug!("fd table grown {} -> {}", old_len, new_len);
        }
        Arc::clone(&table[index])
    }

    fn table_len(&self) -> usize {
        self.fds.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> Result<(), Errno> {
        let mut ev = libc::epoll_event {
            events: epoll_bits(interest),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    /// Apply `left` as the fd's whole interest: MOD, or DEL once empty
    fn rearm(&self, fd: RawFd, left: Interest) -> Result<(), (&'static str, Errno)> {
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.ctl(op, fd, left).map_err(|errno| (ctl_name(op), errno))
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Block in epoll_wait once and dispatch whatever fired
    fn poll(&self, events: &mut [libc::epoll_event]) {
        let n = loop {
            let rc = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    self.timeout_ms,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    kerror!("epoll_wait failed: {}", errno);
                    break 0;
                }
            }
        };

        let wake_fd = self.wake_read.as_raw_fd();
        for ev in &events[..n] {
            let (flags, data) = (ev.events, ev.u64);
            let fd = data as RawFd;
            if fd == wake_fd {
                self.drain_wake_pipe();
                continue;
            }
            let Some(ctx) = self.lookup(fd) else {
                continue;
            };
            let mut state = lock(&ctx.state);

            let mut fired = Interest::NONE;
            if flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                fired = Interest::BOTH;
            }
            if flags & libc::EPOLLIN as u32 != 0 {
                fired |= Interest::READ;
            }
            if flags & libc::EPOLLOUT as u32 != 0 {
                fired |= Interest::WRITE;
            }
            let fired = fired.intersect(state.events);
            if fired.is_empty() {
                continue;
            }

            let left = state.events.difference(fired);
            if let Err((op, errno)) = self.rearm(ctx.fd, left) {
                kerror!("{} on fd {} failed: {}", op, ctx.fd, errno);
                continue;
            }
            for dir in fired.directions() {
                ktrace!("fd {} {} ready", ctx.fd, dir);
                state.trigger(ctx.fd, dir);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl SchedulerHooks for Reactor {
    fn tickle(&self, sched: &Scheduler) {
        if !sched.has_idle_threads() {
            return;
        }
        let rc = unsafe {
            libc::write(
                self.wake_write.as_raw_fd(),
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        if rc < 0 {
            // A full pipe already holds a wakeup
            let errno = Errno::last();
            if errno != Errno::EAGAIN {
                kwarn!("{} tickle failed: {}", sched.name(), errno);
            }
        }
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && sched.base_stopping()
    }

    fn idle(&self, sched: &Scheduler) {
        kdebug!("{} idle", sched.name());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events.max(1)];
        loop {
            if self.stopping(sched) {
                kdebug!("{} idle exits", sched.name());
                break;
            }
            self.poll(&mut events);
            Coroutine::sleep_now();
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}

/// Scheduler that resumes work when file descriptors become ready
///
/// Dereferences to its `Scheduler` for `schedule`, `stop` and the rest.
///
/// `stop()` must be called before the last handle goes away: workers keep
/// the manager alive while they wait in `epoll_wait`, and the epoll fd and
/// wake pipe are closed only once the workers have been joined and every
/// handle dropped.
#[derive(Clone)]
pub struct IOManager {
    scheduler: Scheduler,
    reactor: Arc<Reactor>,
}

impl IOManager {
    /// Create and start an IOManager using the global config
    pub fn new(thread_count: usize, use_caller: bool, name: &str) -> SchedResult<IOManager> {
        Self::with_config(thread_count, use_caller, name, config::global().clone())
    }

    pub fn with_config(
        thread_count: usize,
        use_caller: bool,
        name: &str,
        config: RuntimeConfig,
    ) -> SchedResult<IOManager> {
        config.validate()?;
        let reactor = Arc::new(Reactor::new(&config)?);
        let hooks: Arc<dyn SchedulerHooks> = Arc::clone(&reactor) as Arc<dyn SchedulerHooks>;
        let scheduler = Scheduler::with_hooks(thread_count, use_caller, name, config, hooks)?;
        scheduler.start()?;
        Ok(IOManager { scheduler, reactor })
    }

    /// IOManager driving the calling thread, if any
    pub fn current() -> Option<IOManager> {
        let scheduler = Scheduler::current()?;
        let reactor = Arc::clone(scheduler.hooks())
            .into_any()
            .downcast::<Reactor>()
            .ok()?;
        Some(IOManager { scheduler, reactor })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Arm `dir` on `fd`
    ///
    /// When it fires, `task` is scheduled; with no task, the calling
    /// coroutine is rescheduled instead and should `sleep_now()` right
    /// after. Arming a direction that is already armed aborts.
    pub fn add_event(&self, fd: RawFd, dir: Direction, task: Option<Task>) -> SchedResult<()> {
        if fd < 0 {
            return Err(SchedError::InvalidFd(fd));
        }
        let reactor = &self.reactor;
        let ctx = reactor.context(fd);
        let mut state = lock(&ctx.state);

        if state.events.contains(dir) {
            fatal!("fd {} {} armed twice (armed: {})", fd, dir, state.events);
        }
        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let armed = state.events.with(dir);
        if let Err(errno) = reactor.ctl(op, fd, armed) {
            kerror!("{} on fd {} for {} failed: {}", ctl_name(op), fd, armed, errno);
            return Err(SchedError::Os {
                op: ctl_name(op),
                errno: errno as i32,
            });
        }

        reactor.pending.fetch_add(1, Ordering::SeqCst);
        state.events = armed;
        let waiter = match task {
            Some(task) => (None, Some(task)),
            None => {
                let co = Coroutine::current();
                if co.is_thread_main() {
                    fatal!("fd {} {} armed without a callback outside a coroutine", fd, dir);
                }
                (Some(co), None)
            }
        };
        let scheduler = Scheduler::current().unwrap_or_else(|| self.scheduler.clone());

        let ev = state.context_mut(dir);
        debug_invariant!(ev.is_empty(), "fd {} {} context not empty while disarmed", fd, dir);
        ev.scheduler = Some(scheduler.downgrade());
        (ev.coroutine, ev.task) = waiter;
        ktrace!("fd {} armed {}", fd, state.events);
        Ok(())
    }

    /// Disarm `dir` on `fd` without resuming its waiter
    pub fn del_event(&self, fd: RawFd, dir: Direction) -> bool {
        let Some(ctx) = self.reactor.lookup(fd) else {
            return false;
        };
        let mut state = lock(&ctx.state);
        if !state.events.contains(dir) {
            return false;
        }

        let left = state.events.without(dir);
        if let Err((op, errno)) = self.reactor.rearm(fd, left) {
            kerror!("{} on fd {} failed: {}", op, fd, errno);
            return false;
        }
        self.reactor.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = left;
        let waiter = std::mem::take(state.context_mut(dir));
        drop(state);
        drop(waiter);
        true
    }

    /// Disarm `dir` on `fd` and resume its waiter as if it had fired
    pub fn cancel_event(&self, fd: RawFd, dir: Direction) -> bool {
        let Some(ctx) = self.reactor.lookup(fd) else {
            return false;
        };
        let mut state = lock(&ctx.state);
        if !state.events.contains(dir) {
            return false;
        }

        let left = state.events.without(dir);
        if let Err((op, errno)) = self.reactor.rearm(fd, left) {
            kerror!("{} on fd {} failed: {}", op, fd, errno);
            return false;
        }
        state.trigger(fd, dir);
        self.reactor.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel every armed direction of `fd` and remove it from epoll
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.reactor.lookup(fd) else {
            return false;
        };
        let mut state = lock(&ctx.state);
        if state.events.is_empty() {
            return false;
        }

        if let Err((op, errno)) = self.reactor.rearm(fd, Interest::NONE) {
            kerror!("{} on fd {} failed: {}", op, fd, errno);
            return false;
        }
        for dir in state.events.directions() {
            state.trigger(fd, dir);
            self.reactor.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_invariant!(state.events.is_empty(), "fd {} still armed after cancel_all", fd);
        true
    }

    /// Directions currently armed on `fd`
    pub fn armed(&self, fd: RawFd) -> Interest {
        self.reactor
            .lookup(fd)
            .map_or(Interest::NONE, |ctx| lock(&ctx.state).events)
    }

    /// Armed directions across all descriptors
    pub fn pending_event_count(&self) -> usize {
        self.reactor.pending.load(Ordering::SeqCst)
    }
}

impl Deref for IOManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl fmt::Debug for IOManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IOManager")
            .field("scheduler", &self.scheduler)
            .field("pending", &self.pending_event_count())
            .field("fd_table", &self.reactor.table_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_config() -> RuntimeConfig {
        RuntimeConfig::new()
            .stack_size(256 * 1024)
            .epoll_timeout(Duration::from_millis(20))
            .park_timeout(Duration::from_millis(10))
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn write_byte(fd: &OwnedFd) {
        let rc = unsafe { libc::write(fd.as_raw_fd(), b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(rc, 1);
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn counter_task(counter: &Arc<AtomicU32>) -> Task {
        let counter = Arc::clone(counter);
        Task::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_fd_table_growth_preserves_contexts() {
        let config = test_config().fd_table_capacity(32);
        let iom = IOManager::with_config(1, false, "grow", config).unwrap();
        assert_eq!(iom.reactor.table_len(), 32);

        let (r, _w) = pipe();
        let low = r.as_raw_fd();
        let fired = Arc::new(AtomicU32::new(0));
        iom.add_event(low, Direction::Read, Some(counter_task(&fired))).unwrap();
        let before = iom.reactor.lookup(low).unwrap();

        let high = unsafe { libc::fcntl(low, libc::F_DUPFD_CLOEXEC, 100) };
        assert!(high >= 100);
        let high = unsafe { OwnedFd::from_raw_fd(high) };
        iom.add_event(high.as_raw_fd(), Direction::Read, Some(counter_task(&fired)))
            .unwrap();

        assert!(iom.reactor.table_len() > high.as_raw_fd() as usize);
        assert!(Arc::ptr_eq(&before, &iom.reactor.lookup(low).unwrap()));
        assert_eq!(iom.armed(low), Interest::READ);
        assert_eq!(iom.armed(high.as_raw_fd()), Interest::READ);
        assert_eq!(iom.pending_event_count(), 2);

        assert!(iom.cancel_all(low));
        assert!(iom.cancel_all(high.as_raw_fd()));
        iom.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_event_triggers_once_and_keeps_other_direction() {
        let iom = IOManager::with_config(2, false, "cancel", test_config()).unwrap();
        // A pipe's read end never reports write readiness
        let (r, _w) = pipe();
        let fd = r.as_raw_fd();
        let reads = Arc::new(AtomicU32::new(0));
        let writes = Arc::new(AtomicU32::new(0));

        iom.add_event(fd, Direction::Read, Some(counter_task(&reads))).unwrap();
        iom.add_event(fd, Direction::Write, Some(counter_task(&writes))).unwrap();
        assert_eq!(iom.armed(fd), Interest::BOTH);
        assert_eq!(iom.pending_event_count(), 2);

        assert!(iom.cancel_event(fd, Direction::Read));
        assert_eq!(iom.pending_event_count(), 1);
        assert_eq!(iom.armed(fd), Interest::WRITE);
        assert!(!iom.cancel_event(fd, Direction::Read));
        assert!(wait_until(|| reads.load(Ordering::SeqCst) == 1));
        assert_eq!(writes.load(Ordering::SeqCst), 0);

        assert!(iom.cancel_all(fd));
        assert!(!iom.cancel_all(fd));
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();

        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hangup_fires_both_directions_once() {
        let iom = IOManager::with_config(2, false, "hup", test_config()).unwrap();
        // The read end of a pipe only reports write readiness through HUP
        let (r, w) = pipe();
        let fd = r.as_raw_fd();
        let read = Arc::new(AtomicU32::new(0));
        let write = Arc::new(AtomicU32::new(0));
        iom.add_event(fd, Direction::Read, Some(counter_task(&read))).unwrap();
        iom.add_event(fd, Direction::Write, Some(counter_task(&write))).unwrap();
        assert_eq!(iom.armed(fd), Interest::BOTH);
        assert_eq!(write.load(Ordering::SeqCst), 0);

        drop(w);
        assert!(wait_until(|| {
            read.load(Ordering::SeqCst) == 1 && write.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(iom.armed(fd), Interest::NONE);
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        assert_eq!(read.load(Ordering::SeqCst), 1);
        assert_eq!(write.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_descriptors_released_after_stop_and_drop() {
        let iom = IOManager::with_config(2, false, "release", test_config()).unwrap();
        let reactor = Arc::downgrade(&iom.reactor);
        let second = iom.clone();

        iom.stop();
        drop(iom);
        assert!(reactor.upgrade().is_some());
        drop(second);
        assert!(reactor.upgrade().is_none());
    }

    #[test]
    fn test_del_event_does_not_resume() {
        let iom = IOManager::with_config(1, false, "del", test_config()).unwrap();
        let (r, w) = pipe();
        let fd = r.as_raw_fd();
        let fired = Arc::new(AtomicU32::new(0));

        iom.add_event(fd, Direction::Read, Some(counter_task(&fired))).unwrap();
        assert!(iom.del_event(fd, Direction::Read));
        assert!(!iom.del_event(fd, Direction::Read));
        assert_eq!(iom.pending_event_count(), 0);

        write_byte(&w);
        thread::sleep(Duration::from_millis(50));
        iom.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_fires_write_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {}", other),
        };

        let iom = IOManager::with_config(1, false, "connect", test_config()).unwrap();
        let sock = connect_nonblocking(addr);
        let fd = sock.as_raw_fd();
        let fired = Arc::new(AtomicU32::new(0));
        iom.add_event(fd, Direction::Write, Some(counter_task(&fired))).unwrap();

        let (_peer, _) = listener.accept().unwrap();
        assert!(wait_until(|| fired.load(Ordering::SeqCst) == 1));
        assert_eq!(iom.armed(fd), Interest::NONE);
        assert_eq!(iom.pending_event_count(), 0);

        iom.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    fn connect_nonblocking(addr: SocketAddrV4) -> OwnedFd {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        assert!(fd >= 0);
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr.port().to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(*addr.ip()).to_be(),
            },
            sin_zero: [0; 8],
        };
        let rc = unsafe {
            libc::connect(
                fd,
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert!(rc == 0 || Errno::last() == Errno::EINPROGRESS);
        assert_eq!(*addr.ip(), Ipv4Addr::LOCALHOST);
        sock
    }

    #[test]
    fn test_coroutine_sleeps_until_readable() {
        let iom = IOManager::with_config(2, false, "wait", test_config()).unwrap();
        let (r, w) = pipe();
        let received = Arc::new(Mutex::new(Vec::new()));
        let armed = Arc::new(AtomicBool::new(false));

        {
            let received = Arc::clone(&received);
            let armed = Arc::clone(&armed);
            iom.spawn(move || {
                let iom = IOManager::current().unwrap();
                let mut reader = std::fs::File::from(r);
                iom.add_event(reader.as_raw_fd(), Direction::Read, None).unwrap();
                armed.store(true, Ordering::SeqCst);
                Coroutine::sleep_now();

                let mut buf = [0u8; 8];
                let n = reader.read(&mut buf).unwrap();
                lock(&received).extend_from_slice(&buf[..n]);
            });
        }

        assert!(wait_until(|| armed.load(Ordering::SeqCst)));
        assert_eq!(iom.pending_event_count(), 1);
        let mut writer = std::fs::File::from(w);
        writer.write_all(b"ping").unwrap();

        assert!(wait_until(|| lock(&received).len() == 4));
        iom.stop();
        assert_eq!(&*lock(&received), b"ping");
    }

    #[test]
    fn test_use_caller_iomanager_drains_events_on_stop() {
        thread::spawn(|| {
            let iom = IOManager::with_config(1, true, "io_caller", test_config()).unwrap();
            let (r, w) = pipe();
            let fired = Arc::new(AtomicU32::new(0));
            iom.add_event(r.as_raw_fd(), Direction::Read, Some(counter_task(&fired)))
                .unwrap();
            write_byte(&w);

            // No other worker: the event is only seen once stop() drives
            // the caller thread's dispatch loop
            iom.stop();
            assert_eq!(fired.load(Ordering::SeqCst), 1);
            assert_eq!(iom.pending_event_count(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_invalid_fd_rejected() {
        let iom = IOManager::with_config(1, false, "badfd", test_config()).unwrap();
        let err = iom.add_event(-1, Direction::Read, Some(Task::new(|| {})));
        assert_eq!(err, Err(SchedError::InvalidFd(-1)));

        // epoll refuses regular files
        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        let err = iom
            .add_event(file.as_raw_fd(), Direction::Read, Some(Task::new(|| {})))
            .unwrap_err();
        assert_eq!(err.errno(), Some(libc::EPERM));
        assert_eq!(iom.armed(file.as_raw_fd()), Interest::NONE);
        assert_eq!(iom.pending_event_count(), 0);
        iom.stop();
    }

    const DOUBLE_ARM_CHILD: &str = "COSCHED_TEST_DOUBLE_ARM_CHILD";

    #[test]
    fn test_double_arm_aborts() {
        if std::env::var_os(DOUBLE_ARM_CHILD).is_some() {
            let iom = IOManager::with_config(1, false, "twice", test_config()).unwrap();
            let (r, _w) = pipe();
            let fd = r.as_raw_fd();
            iom.add_event(fd, Direction::Read, Some(Task::new(|| {}))).unwrap();
            let _ = iom.add_event(fd, Direction::Read, Some(Task::new(|| {})));
            // Only reached if the second arm was accepted
            std::process::exit(0);
        }

        let exe = std::env::current_exe().unwrap();
        let status = Command::new(exe)
            .args(["--exact", "iomanager::tests::test_double_arm_aborts", "--test-threads=1"])
            .env(DOUBLE_ARM_CHILD, "1")
            .env("COSCHED_LOG_LEVEL", "off")
            .status()
            .unwrap();
        assert!(!status.success());
        assert_eq!(status.signal(), Some(libc::SIGABRT));
    }
}
