//! Library-wide lifecycle state machine.
//!
//! The dispatch subsystem moves through
//! `Uninitialized -> Initializing -> Initialized -> Finalizing -> Uninitialized`.
//! Each edge out of a settled state is claimed with a compare-and-swap, so
//! exactly one thread runs an initialization or teardown body at a time.
//!
//! Threads that arrive while a transition is running park on a condition
//! variable until the transition settles and then report the same outcome
//! as the thread that performed it. The mutex behind that condition variable
//! only guards the settle record; it is never held while a body runs, so
//! readers of [`Lifecycle::state`] never block.
//!
//! Invocation paths enter through [`Lifecycle::enter`], which counts the
//! call as in flight. Finalization flips the state to `Finalizing` first and
//! then drains the in-flight counter, so a late caller either sees the new
//! state and backs out or is waited for.

use crate::error::{DispatchError, DispatchResult};
use crate::sync::RecoverMutex;
use lib_types::LibraryState;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// How the calling thread took part in a lifecycle transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionRole {
    /// This thread won the race and ran the body.
    Performed,
    /// Another thread ran the body; this thread waited for it.
    Joined,
    /// The target state was already reached, nothing to do.
    Redundant,
}

/// Outcome of the most recent settled transition.
type SettleOutcome = Result<(), Arc<DispatchError>>;

#[derive(Debug)]
struct SettleRecord {
    /// Incremented every time a transition settles.
    generation: u64,
    last_outcome: SettleOutcome,
}

/// Atomic lifecycle state with one-at-a-time transitions.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
    in_flight: AtomicUsize,
    record: Mutex<SettleRecord>,
    settled: Condvar,
}

impl Lifecycle {
    /// Create a lifecycle in the `Uninitialized` state.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LibraryState::Uninitialized.as_raw()),
            in_flight: AtomicUsize::new(0),
            record: Mutex::new(SettleRecord {
                generation: 0,
                last_outcome: Ok(()),
            }),
            settled: Condvar::new(),
        }
    }

    /// Current state.
    ///
    /// # Panics
    ///
    /// Panics if the atomic holds a value outside the four defined states.
    /// Only this module writes the atomic, so that is a programming error.
    pub fn state(&self) -> LibraryState {
        let raw = self.state.load(Ordering::SeqCst);
        match LibraryState::from_raw(raw) {
            Some(state) => state,
            None => {
                tracing::error!(raw, "Unknown library state encountered");
                panic!("Invalid library state value: {}", raw);
            }
        }
    }

    /// Number of operations currently inside a call guard.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `body` as the `Uninitialized -> Initialized` transition.
    ///
    /// Exactly one concurrent caller runs `body`. If `body` fails the state
    /// returns to `Uninitialized` and every caller that waited on this
    /// transition receives the same [`DispatchError::TransitionFailed`].
    /// Calling this on an initialized lifecycle is a successful no-op.
    pub fn initialize<F>(&self, body: F) -> DispatchResult<TransitionRole>
    where
        F: FnOnce() -> DispatchResult<()>,
    {
        loop {
            match self.claim(LibraryState::Uninitialized, LibraryState::Initializing) {
                Ok(()) => {
                    let guard = TransitionGuard::new(self, LibraryState::Uninitialized);
                    return match body() {
                        Ok(()) => {
                            guard.settle(LibraryState::Initialized, Ok(()));
                            tracing::info!("Dispatch runtime initialized");
                            Ok(TransitionRole::Performed)
                        }
                        Err(e) => {
                            let shared = Arc::new(e);
                            tracing::warn!(error = %shared, "Initialization failed");
                            guard.settle(LibraryState::Uninitialized, Err(shared.clone()));
                            Err(DispatchError::TransitionFailed(shared))
                        }
                    };
                }
                Err(LibraryState::Initialized) => {
                    tracing::debug!("Redundant call to initialize");
                    return Ok(TransitionRole::Redundant);
                }
                Err(LibraryState::Initializing) => {
                    if let Some(outcome) = self.wait_settled(LibraryState::Initializing) {
                        return outcome
                            .map(|()| TransitionRole::Joined)
                            .map_err(DispatchError::TransitionFailed);
                    }
                }
                Err(LibraryState::Finalizing) => {
                    // Let the teardown finish, then bring the runtime back up.
                    let _ = self.wait_settled(LibraryState::Finalizing);
                }
                Err(LibraryState::Uninitialized) => {
                    // Spurious CAS failure; retry.
                }
            }
        }
    }

    /// Run `body` as the `Initialized -> Uninitialized` transition.
    ///
    /// The winning caller first moves the state to `Finalizing`, then waits
    /// up to `drain_timeout` for in-flight calls to leave, then runs `body`.
    /// The state ends `Uninitialized` whether or not `body` succeeds.
    /// Finalizing an uninitialized lifecycle is a state error.
    pub fn finalize<F>(&self, drain_timeout: Duration, body: F) -> DispatchResult<TransitionRole>
    where
        F: FnOnce() -> DispatchResult<()>,
    {
        loop {
            match self.claim(LibraryState::Initialized, LibraryState::Finalizing) {
                Ok(()) => {
                    let guard = TransitionGuard::new(self, LibraryState::Uninitialized);
                    self.drain(drain_timeout);
                    return match body() {
                        Ok(()) => {
                            guard.settle(LibraryState::Uninitialized, Ok(()));
                            tracing::info!("Dispatch runtime finalized");
                            Ok(TransitionRole::Performed)
                        }
                        Err(e) => {
                            let shared = Arc::new(e);
                            tracing::warn!(error = %shared, "Teardown reported an error");
                            guard.settle(LibraryState::Uninitialized, Err(shared.clone()));
                            Err(DispatchError::TransitionFailed(shared))
                        }
                    };
                }
                Err(LibraryState::Uninitialized) => {
                    return Err(DispatchError::state(
                        LibraryState::Initialized,
                        LibraryState::Uninitialized,
                    ));
                }
                Err(LibraryState::Finalizing) => {
                    if let Some(outcome) = self.wait_settled(LibraryState::Finalizing) {
                        return outcome
                            .map(|()| TransitionRole::Joined)
                            .map_err(DispatchError::TransitionFailed);
                    }
                }
                Err(LibraryState::Initializing) => {
                    let _ = self.wait_settled(LibraryState::Initializing);
                }
                Err(LibraryState::Initialized) => {}
            }
        }
    }

    /// Enter an invocation-path operation.
    ///
    /// Fails with a state error unless the lifecycle is `Initialized`. The
    /// returned guard keeps the call counted as in flight until dropped.
    pub fn enter(&self) -> DispatchResult<CallGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if state != LibraryState::Initialized {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(DispatchError::state(LibraryState::Initialized, state));
        }
        Ok(CallGuard { lifecycle: self })
    }

    /// Attempt the `from -> to` edge. On failure returns the observed state.
    fn claim(&self, from: LibraryState, to: LibraryState) -> Result<(), LibraryState> {
        self.state
            .compare_exchange(from.as_raw(), to.as_raw(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|raw| LibraryState::from_raw(raw).unwrap_or(LibraryState::Uninitialized))
    }

    /// Block until the transition currently in `transitional` settles.
    ///
    /// Returns `None` if the state had already moved on by the time the
    /// settle record was locked; the caller re-examines the state then.
    fn wait_settled(&self, transitional: LibraryState) -> Option<SettleOutcome> {
        let record = self.record.lock_recover();
        if self.state() != transitional {
            return None;
        }
        let observed = record.generation;
        let record = self
            .settled
            .wait_while(record, |r| r.generation == observed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(record.last_outcome.clone())
    }

    /// Publish the end state of a transition and wake all waiters.
    fn settle(&self, state: LibraryState, outcome: SettleOutcome) {
        let mut record = self.record.lock_recover();
        self.state.store(state.as_raw(), Ordering::SeqCst);
        record.generation = record.generation.wrapping_add(1);
        record.last_outcome = outcome;
        drop(record);
        self.settled.notify_all();
    }

    /// Wait for in-flight calls to leave, bounded by `timeout`.
    fn drain(&self, timeout: Duration) {
        let start = Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > timeout {
                tracing::warn!(
                    in_flight = self.in_flight.load(Ordering::SeqCst),
                    "Finalizing with calls still in flight"
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks an invocation-path operation as in flight.
#[derive(Debug)]
pub struct CallGuard<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.lifecycle.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Settles a claimed transition even if its body unwinds.
struct TransitionGuard<'a> {
    lifecycle: &'a Lifecycle,
    on_unwind: LibraryState,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(lifecycle: &'a Lifecycle, on_unwind: LibraryState) -> Self {
        Self {
            lifecycle,
            on_unwind,
            armed: true,
        }
    }

    fn settle(mut self, state: LibraryState, outcome: SettleOutcome) {
        self.armed = false;
        self.lifecycle.settle(state, outcome);
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::error!(state = %self.on_unwind, "Lifecycle body panicked");
            let failure = DispatchError::TransitionPanicked {
                state: self.on_unwind,
            };
            self.lifecycle.settle(self.on_unwind, Err(Arc::new(failure)));
        }
    }
}
