//! Coroutine lifecycle state

use core::fmt;

/// State of a coroutine
///
/// ```text
/// INIT --swap_in--> EXEC --yield--> READY --swap_in--> EXEC
///                    |  --sleep--> HOLD  --swap_in--> EXEC
///                    +--return--> TERM    (reset) --> INIT
///                    +--error---> EXCEPT  (reset) --> INIT
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoroutineState {
    /// Context prepared, callback not started
    Init = 0,

    /// Yielded with work left, wants to be rescheduled
    Ready = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Suspended; only an explicit resume brings it back
    Hold = 3,

    /// Callback returned normally
    Term = 4,

    /// Callback returned an error or panicked
    Except = 5,
}

impl CoroutineState {
    /// Callback finished, successfully or not
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, CoroutineState::Term | CoroutineState::Except)
    }

    /// States from which `reset` may re-arm the coroutine
    #[inline]
    pub const fn can_reset(&self) -> bool {
        matches!(
            self,
            CoroutineState::Init | CoroutineState::Term | CoroutineState::Except
        )
    }

    /// States from which the coroutine may be switched into
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(
            self,
            CoroutineState::Init | CoroutineState::Ready | CoroutineState::Hold
        )
    }
}

impl From<u8> for CoroutineState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoroutineState::Init,
            1 => CoroutineState::Ready,
            2 => CoroutineState::Exec,
            3 => CoroutineState::Hold,
            4 => CoroutineState::Term,
            _ => CoroutineState::Except,
        }
    }
}

impl From<CoroutineState> for u8 {
    fn from(state: CoroutineState) -> u8 {
        state as u8
    }
}

impl fmt::Display for CoroutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoroutineState::Init => "INIT",
            CoroutineState::Ready => "READY",
            CoroutineState::Exec => "EXEC",
            CoroutineState::Hold => "HOLD",
            CoroutineState::Term => "TERM",
            CoroutineState::Except => "EXCEPT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(CoroutineState::Term.is_finished());
        assert!(CoroutineState::Except.is_finished());
        assert!(!CoroutineState::Hold.is_finished());

        assert!(CoroutineState::Init.can_reset());
        assert!(CoroutineState::Term.can_reset());
        assert!(!CoroutineState::Ready.can_reset());
        assert!(!CoroutineState::Exec.can_reset());

        assert!(CoroutineState::Hold.is_resumable());
        assert!(!CoroutineState::Exec.is_resumable());
        assert!(!CoroutineState::Term.is_resumable());
    }

    #[test]
    fn test_u8_roundtrip() {
        for s in [
            CoroutineState::Init,
            CoroutineState::Ready,
            CoroutineState::Exec,
            CoroutineState::Hold,
            CoroutineState::Term,
            CoroutineState::Except,
        ] {
            assert_eq!(CoroutineState::from(u8::from(s)), s);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(CoroutineState::Except.to_string(), "EXCEPT");
    }
}
