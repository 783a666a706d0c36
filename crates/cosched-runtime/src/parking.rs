//! Futex-based parking for idle workers
//!
//! The default scheduler hooks park idle workers here and `tickle` wakes
//! one of them. The futex word counts pending wakeups:
//!
//! - `wake_one` bumps the word and issues FUTEX_WAKE if anyone is parked
//! - `park` consumes a pending wakeup without sleeping, otherwise
//!   FUTEX_WAITs while the word is still 0
//!
//! A wakeup posted while nobody is parked is kept, so the next worker to
//! go idle rechecks the queue immediately instead of sleeping through it.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use nix::errno::Errno;

/// Idle-worker parking lot
pub struct Parker {
    /// Pending wakeups
    futex: AtomicU32,

    /// Workers currently inside `park`
    parked: AtomicUsize,
}

impl Parker {
    pub const fn new() -> Self {
        Self {
            futex: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    /// Sleep until woken or `timeout` elapses
    ///
    /// Returns true if a wakeup was consumed. Callers recheck for work
    /// either way.
    pub fn park(&self, timeout: Duration) -> bool {
        if self.try_consume() {
            return true;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);

        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        // Sleeps only while the word is still 0
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                0u32,
                &ts as *const libc::timespec,
                std::ptr::null::<u32>(),
                0u32,
            )
        };
        let err = if ret == 0 { None } else { Some(Errno::last()) };

        self.parked.fetch_sub(1, Ordering::SeqCst);

        match err {
            // ETIMEDOUT and EINTR: nothing posted for us
            Some(Errno::ETIMEDOUT) | Some(Errno::EINTR) => self.try_consume(),
            // Woken, or EAGAIN because a wakeup landed before we slept
            _ => {
                self.try_consume();
                true
            }
        }
    }

    /// Wake one parked worker, or leave a wakeup for the next to park
    pub fn wake_one(&self) {
        self.futex.fetch_add(1, Ordering::Release);
        if self.parked.load(Ordering::SeqCst) == 0 {
            return;
        }
        self.futex_wake(1);
    }

    /// Workers currently parked (hint, may be stale)
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }

    fn futex_wake(&self, n: i32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.futex.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn try_consume(&self) -> bool {
        self.futex
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parker = Parker::new();
        let start = Instant::now();
        let woken = parker.park(Duration::from_millis(50));
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wake_before_park_is_kept() {
        let parker = Parker::new();
        parker.wake_one();
        let start = Instant::now();
        assert!(parker.park(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_one() {
        let parker = Arc::new(Parker::new());
        let parker2 = Arc::clone(&parker);

        let handle = thread::spawn(move || parker2.park(Duration::from_secs(10)));

        while parker.parked_count() == 0 {
            thread::yield_now();
        }
        let start = Instant::now();
        parker.wake_one();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
