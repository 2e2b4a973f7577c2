//! Error types for dispatch operations.

use lib_types::{LibraryState, ProxyHandle, StreamId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while bringing up the runtime or invoking a sink
/// function.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Operation attempted outside its valid lifecycle state.
    #[error("Invalid library state: expected {expected}, got {actual}")]
    State {
        expected: LibraryState,
        actual: LibraryState,
    },

    /// More arguments than a sink function can receive.
    #[error("Too many arguments: {given} given, at most {max} supported")]
    Arity { given: usize, max: usize },

    /// Unknown function symbol, device or stream.
    #[error("Cannot resolve {what} '{name}'")]
    Resolution { what: &'static str, name: String },

    /// The sink produced more result data than the caller declared room for.
    #[error("Result does not fit declared capacity of {capacity} bytes (required: {required:?})")]
    Capacity {
        capacity: u16,
        /// Size the sink reported, if it reported one. `None` when the
        /// overrun was only detected through the guard area.
        required: Option<usize>,
    },

    /// Stale or unregistered address proxy.
    #[error("Invalid proxy reference {handle}: {reason}")]
    InvalidReference { handle: ProxyHandle, reason: String },

    /// Invalid parameter.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// Failed to load a sink library.
    #[error("Failed to load library '{path}': {source}")]
    LoadError {
        path: String,
        #[source]
        source: libloading::Error,
    },

    /// A lifecycle transition failed.
    ///
    /// The inner error is shared between the thread that ran the transition
    /// and every thread that waited on it.
    #[error("Lifecycle transition failed: {0}")]
    TransitionFailed(Arc<DispatchError>),

    /// A lifecycle transition body panicked; the state was reset.
    #[error("Lifecycle transition panicked, state reset to {state}")]
    TransitionPanicked { state: LibraryState },

    /// The stream worker is gone (shut down or crashed), or the call was
    /// abandoned at shutdown.
    #[error("Worker for {stream} is unavailable")]
    WorkerUnavailable { stream: StreamId },

    /// Waiting for completion timed out.
    #[error("Invocation did not complete within {0:?}")]
    Timeout(Duration),

    /// The sink function panicked.
    #[error("Sink function '{function}' panicked: {message}")]
    SinkPanicked { function: String, message: String },

    /// A stream worker thread could not be started.
    #[error("Failed to start worker for {stream}: {source}")]
    WorkerSpawn {
        stream: StreamId,
        #[source]
        source: std::io::Error,
    },
}

impl DispatchError {
    /// Create a state error.
    pub fn state(expected: LibraryState, actual: LibraryState) -> Self {
        Self::State { expected, actual }
    }

    /// Create a resolution error.
    pub fn resolution(what: &'static str, name: impl Into<String>) -> Self {
        Self::Resolution {
            what,
            name: name.into(),
        }
    }

    /// Create an invalid reference error.
    pub fn invalid_reference(handle: ProxyHandle, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            handle,
            reason: reason.into(),
        }
    }

    /// Create an invalid parameter error.
    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a load error.
    pub fn load_error(path: impl Into<String>, source: libloading::Error) -> Self {
        Self::LoadError {
            path: path.into(),
            source,
        }
    }

    /// Check if this is a lifecycle state error, directly or via a failed
    /// transition.
    pub fn is_state_error(&self) -> bool {
        match self {
            Self::State { .. } => true,
            Self::TransitionFailed(inner) => inner.is_state_error(),
            _ => false,
        }
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_message() {
        let known = DispatchError::Capacity {
            capacity: 4,
            required: Some(8),
        };
        assert_eq!(
            known.to_string(),
            "Result does not fit declared capacity of 4 bytes (required: Some(8))"
        );

        let unknown = DispatchError::Capacity {
            capacity: 4,
            required: None,
        };
        assert!(unknown.to_string().ends_with("(required: None)"));
    }

    #[test]
    fn test_state_error_through_peer() {
        let inner = DispatchError::state(LibraryState::Initialized, LibraryState::Finalizing);
        let peer = DispatchError::TransitionFailed(Arc::new(inner));
        assert!(peer.is_state_error());
        assert!(!DispatchError::Timeout(Duration::from_millis(1)).is_state_error());
    }

    #[test]
    fn test_transition_panicked_message() {
        let err = DispatchError::TransitionPanicked {
            state: LibraryState::Uninitialized,
        };
        assert!(err.to_string().contains("panicked"));
        assert!(!err.is_state_error());
    }
}
