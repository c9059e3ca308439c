//! Coroutine lifecycle states

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// State of a coroutine
///
/// Legal transitions are `Init -> Exec -> {Ready | Hold} -> Exec -> ... ->
/// {Term | Except}`. `Ready` means "put me back in the run queue", `Hold`
/// means "someone else will reschedule me".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoState {
    /// Constructed (or reset), never resumed
    Init = 0,

    /// Yielded and already re-enqueued
    Ready = 1,

    /// Currently executing on some thread
    Exec = 2,

    /// Suspended, waiting for an external wake (event or timer)
    Hold = 3,

    /// Body ran to completion
    Term = 4,

    /// Body panicked
    Except = 5,
}

impl CoState {
    /// Terminal states: the coroutine will never run again unless reset
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, CoState::Term | CoState::Except)
    }

    /// States from which `reset` with a new body is legal
    #[inline]
    pub const fn is_resettable(&self) -> bool {
        matches!(self, CoState::Init | CoState::Term | CoState::Except)
    }
}

impl From<u8> for CoState {
    fn from(v: u8) -> Self {
        match v {
            0 => CoState::Init,
            1 => CoState::Ready,
            2 => CoState::Exec,
            3 => CoState::Hold,
            4 => CoState::Term,
            5 => CoState::Except,
            _ => CoState::Init,
        }
    }
}

impl From<CoState> for u8 {
    fn from(s: CoState) -> u8 {
        s as u8
    }
}

impl fmt::Display for CoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoState::Init => "INIT",
            CoState::Ready => "READY",
            CoState::Exec => "EXEC",
            CoState::Hold => "HOLD",
            CoState::Term => "TERM",
            CoState::Except => "EXCEPT",
        };
        write!(f, "{}", s)
    }
}

/// Atomic cell holding a `CoState`
///
/// Coroutine handles are shared across scheduler threads; the state is the
/// only field read concurrently (the dispatch loop's EXEC skip), so it gets
/// acquire/release semantics while everything else stays single-owner.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub const fn new(s: CoState) -> Self {
        Self(AtomicU8::new(s as u8))
    }

    #[inline]
    pub fn get(&self) -> CoState {
        CoState::from(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, s: CoState) {
        self.0.store(s as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(CoState::Term.is_terminal());
        assert!(CoState::Except.is_terminal());
        assert!(!CoState::Exec.is_terminal());
        assert!(!CoState::Hold.is_terminal());

        assert!(CoState::Init.is_resettable());
        assert!(CoState::Term.is_resettable());
        assert!(!CoState::Ready.is_resettable());
        assert!(!CoState::Exec.is_resettable());
    }

    #[test]
    fn test_round_trip() {
        for s in [
            CoState::Init,
            CoState::Ready,
            CoState::Exec,
            CoState::Hold,
            CoState::Term,
            CoState::Except,
        ] {
            assert_eq!(CoState::from(u8::from(s)), s);
        }
    }

    #[test]
    fn test_atomic_cell() {
        let cell = AtomicState::new(CoState::Init);
        assert_eq!(cell.get(), CoState::Init);
        cell.set(CoState::Exec);
        assert_eq!(cell.get(), CoState::Exec);
    }
}
