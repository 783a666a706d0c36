//! Runtime configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on a `RuntimeConfig` passed to `with_config`
//! 2. Environment variables (runtime)
//! 3. User's cosched_config.rs (compile-time, via `COSCHED_CONFIG_RS`)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use cosched_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .stack_size(256 * 1024)
//!     .epoll_timeout(Duration::from_millis(50));
//! ```

pub mod defaults;

use std::sync::OnceLock;
use std::time::Duration;

use cosched_core::constants::MIN_STACK_SIZE;
use cosched_core::env::env_get;
use cosched_core::{kinfo, ConfigError};

/// Runtime configuration with builder pattern.
///
/// Use `from_env()` to start with compile-time defaults and apply
/// any environment variable overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size of every coroutine created by the scheduler
    pub stack_size: usize,
    /// Initial length of the IOManager's descriptor table
    pub fd_table_capacity: usize,
    /// Upper bound on one epoll_wait; bounds shutdown latency
    pub epoll_timeout: Duration,
    /// Events fetched per epoll_wait
    pub epoll_max_events: usize,
    /// Park timeout of the default idle routine
    pub park_timeout: Duration,
    /// Log scheduling decisions at debug level
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `COSCHED_STACK_SIZE` - Stack size per coroutine in bytes
    /// - `COSCHED_FD_TABLE_CAPACITY` - Initial fd table length
    /// - `COSCHED_EPOLL_TIMEOUT_MS` - epoll_wait timeout in milliseconds
    /// - `COSCHED_EPOLL_MAX_EVENTS` - Events per epoll_wait
    /// - `COSCHED_PARK_TIMEOUT_MS` - Idle park timeout in milliseconds
    /// - `COSCHED_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("COSCHED_STACK_SIZE", defaults::STACK_SIZE),
            fd_table_capacity: env_get("COSCHED_FD_TABLE_CAPACITY", defaults::FD_TABLE_CAPACITY),
            epoll_timeout: Duration::from_millis(env_get(
                "COSCHED_EPOLL_TIMEOUT_MS",
                defaults::EPOLL_TIMEOUT_MS.max(0) as u64,
            )),
            epoll_max_events: env_get("COSCHED_EPOLL_MAX_EVENTS", defaults::EPOLL_MAX_EVENTS),
            park_timeout: Duration::from_millis(env_get(
                "COSCHED_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
            debug_logging: env_get(
                "COSCHED_DEBUG",
                if defaults::DEBUG_LOGGING { 1usize } else { 0 },
            ) != 0,
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            fd_table_capacity: defaults::FD_TABLE_CAPACITY,
            epoll_timeout: Duration::from_millis(defaults::EPOLL_TIMEOUT_MS.max(0) as u64),
            epoll_max_events: defaults::EPOLL_MAX_EVENTS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn fd_table_capacity(mut self, cap: usize) -> Self {
        self.fd_table_capacity = cap;
        self
    }

    pub fn epoll_timeout(mut self, d: Duration) -> Self {
        self.epoll_timeout = d;
        self
    }

    pub fn epoll_max_events(mut self, n: usize) -> Self {
        self.epoll_max_events = n;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// epoll_wait timeout argument in milliseconds
    pub fn epoll_timeout_ms(&self) -> i32 {
        self.epoll_timeout.as_millis().min(i32::MAX as u128) as i32
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        if self.fd_table_capacity == 0 {
            return Err(ConfigError::InvalidValue("fd_table_capacity must be > 0"));
        }
        if self.epoll_max_events == 0 {
            return Err(ConfigError::InvalidValue("epoll_max_events must be > 0"));
        }
        if self.epoll_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("epoll_timeout must be > 0"));
        }
        if self.park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("park_timeout must be > 0"));
        }
        Ok(())
    }

    /// Log the configuration at info level
    pub fn print(&self) {
        kinfo!("cosched configuration:");
        kinfo!("  stack_size:         {}", self.stack_size);
        kinfo!("  fd_table_capacity:  {}", self.fd_table_capacity);
        kinfo!("  epoll_timeout:      {:?}", self.epoll_timeout);
        kinfo!("  epoll_max_events:   {}", self.epoll_max_events);
        kinfo!("  park_timeout:       {:?}", self.park_timeout);
        kinfo!("  debug_logging:      {}", self.debug_logging);
    }
}

static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration used by constructors that take none.
///
/// Initialized from the environment on first use unless `install` ran first.
pub fn global() -> &'static RuntimeConfig {
    GLOBAL.get_or_init(RuntimeConfig::from_env)
}

/// Set the process-wide configuration. Fails once `global()` has been read
/// or another config was installed.
pub fn install(config: RuntimeConfig) -> Result<(), ConfigError> {
    config.validate()?;
    GLOBAL
        .set(config)
        .map_err(|_| ConfigError::InvalidValue("global config already initialized"))
}
