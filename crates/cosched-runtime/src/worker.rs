//! Worker thread management
//!
//! Workers are named OS threads that run a scheduler's dispatch loop.
//! Each reports its kernel thread id back before running, so the
//! scheduler can match pinned tasks against it.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use cosched_core::error::{SchedResult, WorkerError};
use cosched_core::{kdebug, kprint};

use crate::tls;

/// Kernel thread id, as used for task affinity
pub type Tid = libc::pid_t;

/// Kernel thread id of the calling thread
#[inline]
pub fn current_thread_id() -> Tid {
    tls::thread_id()
}

/// Spawn a named worker and wait for it to report its thread id
pub fn spawn_worker<F>(name: String, body: F) -> SchedResult<(JoinHandle<()>, Tid)>
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let label = name.clone();

    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            kprint::set_thread_label(label);
            let _ = tx.send(current_thread_id());
            body();
        })
        .map_err(|_| WorkerError::SpawnFailed)?;

    let tid = rx.recv().map_err(|_| WorkerError::StartupLost)?;
    kdebug!("worker {:?} started as tid {}", handle.thread().name(), tid);
    Ok((handle, tid))
}

/// Join a worker, reporting a panic that escaped its body
pub fn join_worker(handle: JoinHandle<()>) -> SchedResult<()> {
    handle.join().map_err(|_| WorkerError::Panicked.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_reports_tid() {
        let (handle, tid) = spawn_worker("tid-test_0".into(), || {
            assert_eq!(thread::current().name(), Some("tid-test_0"));
        })
        .unwrap();

        assert_ne!(tid, current_thread_id());
        assert!(tid > 0);
        join_worker(handle).unwrap();
    }

    #[test]
    fn test_tid_is_cached() {
        assert_eq!(current_thread_id(), current_thread_id());
    }

    #[test]
    fn test_panicking_worker_reported() {
        let (handle, _) = spawn_worker("panic-test_0".into(), || panic!("boom")).unwrap();
        assert_eq!(join_worker(handle), Err(WorkerError::Panicked.into()));
    }
}
