//! Fault diagnostics
//!
//! Broken runtime invariants are not recoverable: a coroutine resumed
//! after it terminated, a descriptor direction armed twice, or an unknown
//! slot key handed to the entry trampoline all mean the scheduler's
//! bookkeeping can no longer be trusted. `fatal!` logs the message with a
//! backtrace and aborts the process.

use std::backtrace::Backtrace;

cfg_if::cfg_if! {
    if #[cfg(any(feature = "debug-assertions", debug_assertions))] {
        /// Whether `debug_invariant!` checks are compiled in
        pub const INVARIANT_CHECKS: bool = true;
    } else {
        /// Whether `debug_invariant!` checks are compiled in
        pub const INVARIANT_CHECKS: bool = false;
    }
}

/// Backtrace of the calling thread, rendered for the log
pub fn capture_backtrace() -> String {
    Backtrace::force_capture().to_string()
}

#[doc(hidden)]
#[cold]
pub fn _fatal_impl(args: std::fmt::Arguments<'_>) -> ! {
    crate::kerror!("FATAL: {}\n{}", args, capture_backtrace());
    std::process::abort()
}

/// Log a fatal invariant violation with a backtrace, then abort
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::diag::_fatal_impl(format_args!($($arg)*))
    };
}

/// `fatal!` unless `cond` holds
#[macro_export]
macro_rules! fatal_unless {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal!($($arg)*);
        }
    };
}

/// Like `fatal_unless!`, but only checked in debug builds or with the
/// `debug-assertions` feature
#[macro_export]
macro_rules! debug_invariant {
    ($cond:expr, $($arg:tt)*) => {
        if $crate::diag::INVARIANT_CHECKS && !$cond {
            $crate::fatal!($($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_backtrace_nonempty() {
        let bt = capture_backtrace();
        assert!(!bt.is_empty());
    }

    #[test]
    fn test_passing_checks_do_not_abort() {
        fatal_unless!(1 + 1 == 2, "arithmetic broke");
        debug_invariant!(true, "never fires");
    }
}
