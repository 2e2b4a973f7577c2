//! # lib-dispatch
//!
//! Cross-domain remote invocation for host programs.
//!
//! A host thread names a function, supplies up to nineteen word-sized
//! arguments and optionally a result buffer; the call is queued on a stream
//! and runs in the sink execution domain. This crate handles:
//!
//! - A process-wide lifecycle (`Uninitialized -> Initializing -> Initialized
//!   -> Finalizing`) that is safe to drive from many threads at once
//! - Marshaling logical arguments into the fixed-arity word calling
//!   convention
//! - Resolving function names through in-process registrations and shared
//!   libraries loaded with `libloading`
//! - Returning result blobs with capacity checking
//! - Proxying host buffers into the sink's address space
//!
//! # Safety
//!
//! Sink functions are native code. Arguments are raw words and proxied
//! buffers are raw memory; the runtime validates everything it can before a
//! call is queued, but it cannot check what a sink function does with them.
//! Write in-process sinks with [`sink_fn!`], which keeps panics from crossing
//! the calling convention.

pub mod error;
pub mod lifecycle;
pub mod marshal;
pub mod proxy;
pub mod sink;
pub mod blob;
pub mod loader;
pub mod symbols;
pub mod transport;
pub mod dispatcher;
pub mod runtime;

mod sync;

pub use error::{DispatchError, DispatchResult};
pub use lifecycle::{Lifecycle, TransitionRole};
pub use marshal::{ArgList, MarshaledCall, Marshaler};
pub use proxy::{AddressSpace, ProxiedBuffer, ProxyTable, SharedAddressSpace};
pub use sink::{ResultSlot, SinkArgs, SinkThunk};
pub use blob::ResultBlob;
pub use loader::{LibraryFormat, SinkLibrary};
pub use symbols::SymbolTable;
pub use transport::{Completion, Event, HostTransport, InvocationOutput, Transport};
pub use dispatcher::{Dispatcher, InvocationRequest};
pub use runtime::{finalize, global, initialize, state, Runtime};

pub use lib_types;
