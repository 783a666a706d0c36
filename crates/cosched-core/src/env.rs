//! Environment variable utilities
//!
//! Typed lookups with defaults. `RuntimeConfig::from_env` and the logger
//! read their `COSCHED_*` overrides through these.
//!
//! ```ignore
//! use cosched_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("COSCHED_STACK_SIZE", 1024 * 1024);
//! let timeout: i32 = env_get("COSCHED_EPOLL_TIMEOUT_MS", 5000);
//! let debug: bool = env_get_bool("COSCHED_DEBUG", false);
//! ```

use std::str::FromStr;

/// Environment variable parsed as `T`, or `default` if unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean
///
/// "1", "true", "yes", "on" (case-insensitive) are true; any other set
/// value is false. Unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// `Some` only if the variable is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Raw string value, or `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}
