//! Architecture-specific context switching
//!
//! Each backend provides the same three items:
//!
//! - `SavedRegs` - callee-saved register block of a suspended context
//! - `init_context` - prepare a fresh context that enters `entry(arg)` on
//!   its own stack
//! - `switch_context` - save the running context into one block and resume
//!   another
//!
//! Only registers the C ABI requires a callee to preserve are saved; the
//! switch is an ordinary function call from the compiler's point of view.

/// Entry point of a fresh context. Must never return.
pub type EntryFn = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, SavedRegs};
    } else {
        compile_error!("cosched supports x86_64 and aarch64 only");
    }
}
