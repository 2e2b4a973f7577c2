//! Library lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-wide state of the dispatch subsystem.
///
/// The states form a strict cycle:
///
/// ```text
/// Uninitialized -> Initializing -> Initialized -> Finalizing -> Uninitialized
/// ```
///
/// A failed initialization falls back from `Initializing` straight to
/// `Uninitialized`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LibraryState {
    /// Nothing has been brought up yet, or teardown completed.
    Uninitialized = 0,
    /// Exactly one thread is running the initialization body.
    Initializing = 1,
    /// Dispatch is available.
    Initialized = 2,
    /// Exactly one thread is running the teardown body.
    Finalizing = 3,
}

impl LibraryState {
    /// Decode a raw state value as stored in an atomic.
    ///
    /// Returns `None` for values outside the four defined states.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Initializing),
            2 => Some(Self::Initialized),
            3 => Some(Self::Finalizing),
            _ => None,
        }
    }

    /// Raw value for atomic storage.
    pub fn as_raw(self) -> u8 {
        self as u8
    }

    /// Whether a transition is in progress.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Initializing | Self::Finalizing)
    }
}

impl fmt::Display for LibraryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::Finalizing => "finalizing",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip() {
        for state in [
            LibraryState::Uninitialized,
            LibraryState::Initializing,
            LibraryState::Initialized,
            LibraryState::Finalizing,
        ] {
            assert_eq!(LibraryState::from_raw(state.as_raw()), Some(state));
        }
        assert_eq!(LibraryState::from_raw(4), None);
    }

    #[test]
    fn test_transitional() {
        assert!(LibraryState::Initializing.is_transitional());
        assert!(LibraryState::Finalizing.is_transitional());
        assert!(!LibraryState::Initialized.is_transitional());
        assert!(!LibraryState::Uninitialized.is_transitional());
    }
}
