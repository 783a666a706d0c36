//! Error types for the cosched runtime
//!
//! Only recoverable conditions are represented here. Invariant violations
//! (double-arming a descriptor direction, switching into a running
//! coroutine, stack exhaustion) abort through `fatal!` instead.

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Error a fallible coroutine callback may return
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Return type of a fallible coroutine callback
pub type TaskResult = Result<(), TaskError>;

/// Errors surfaced to callers of the scheduler and IOManager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// `start()` on a scheduler that has already been stopped
    Stopped,

    /// Descriptor number is negative
    InvalidFd(i32),

    /// An OS call failed; the runtime state was left unchanged
    Os { op: &'static str, errno: i32 },

    /// Stack allocation or protection failed
    Memory(MemoryError),

    /// Worker thread error
    Worker(WorkerError),

    /// Configuration rejected by `validate()`
    Config(ConfigError),
}

impl SchedError {
    /// errno of an `Os` error
    pub fn errno(&self) -> Option<i32> {
        match self {
            SchedError::Os { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Stopped => write!(f, "scheduler already stopped"),
            SchedError::InvalidFd(fd) => write!(f, "invalid file descriptor {}", fd),
            SchedError::Os { op, errno } => write!(
                f,
                "{} failed: {} (errno {})",
                op,
                std::io::Error::from_raw_os_error(*errno),
                errno
            ),
            SchedError::Memory(e) => write!(f, "memory error: {}", e),
            SchedError::Worker(e) => write!(f, "worker error: {}", e),
            SchedError::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SchedError {}

/// Stack memory errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect of the guard page failed
    ProtectionFailed,

    /// Requested stack is below the supported minimum
    StackTooSmall(usize),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::StackTooSmall(size) => write!(f, "stack size {} too small", size),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::Memory(e)
    }
}

/// Worker thread errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Failed to spawn worker thread
    SpawnFailed,

    /// Worker exited before reporting its thread id
    StartupLost,

    /// Worker thread panicked
    Panicked,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            WorkerError::StartupLost => write!(f, "worker exited during startup"),
            WorkerError::Panicked => write!(f, "worker thread panicked"),
        }
    }
}

impl From<WorkerError> for SchedError {
    fn from(e: WorkerError) -> Self {
        SchedError::Worker(e)
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for SchedError {
    fn from(e: ConfigError) -> Self {
        SchedError::Config(e)
    }
}
