//! The dispatch runtime: lifecycle plus everything that lives while it is
//! initialized.
//!
//! A [`Runtime`] can be created explicitly; [`global`] returns the
//! process-wide instance used by the free functions in this module.

use crate::dispatcher::{Dispatcher, InvocationRequest};
use crate::error::{DispatchError, DispatchResult};
use crate::lifecycle::{Lifecycle, TransitionRole};
use crate::proxy::{AddressSpace, ProxiedBuffer, ProxyTable, SharedAddressSpace};
use crate::sink::SinkThunk;
use crate::symbols::validate_function_name;
use crate::sync::RecoverMutex;
use crate::transport::Completion;
use lib_types::{LibraryState, ProxyHandle, RuntimeConfig, StreamId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Check a configuration before bringing the runtime up.
pub fn validate_config(config: &RuntimeConfig) -> DispatchResult<()> {
    if config.devices.is_empty() {
        return Err(DispatchError::invalid_parameter(
            "devices",
            "at least one device is required",
        ));
    }
    for (index, device) in config.devices.iter().enumerate() {
        if device.name.trim().is_empty() {
            return Err(DispatchError::invalid_parameter(
                format!("devices[{}].name", index),
                "device name is empty",
            ));
        }
        if device.streams == 0 {
            return Err(DispatchError::invalid_parameter(
                format!("devices[{}].streams", index),
                "a device needs at least one stream",
            ));
        }
    }
    Ok(())
}

/// Host-side entry point for cross-domain invocation.
pub struct Runtime {
    lifecycle: Lifecycle,
    dispatcher: Mutex<Option<Arc<Dispatcher>>>,
    proxies: Arc<ProxyTable>,
    /// In-process sink functions, installed on every device at init.
    functions: Mutex<BTreeMap<String, SinkThunk>>,
    drain_timeout_ms: AtomicU64,
}

impl Runtime {
    /// Runtime whose sinks share the host address space.
    pub fn new() -> Self {
        Self::with_address_space(Arc::new(SharedAddressSpace))
    }

    /// Runtime translating proxies through `space`.
    pub fn with_address_space(space: Arc<dyn AddressSpace>) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            dispatcher: Mutex::new(None),
            // Outlives init cycles so handles from an earlier cycle stay stale.
            proxies: Arc::new(ProxyTable::new(space)),
            functions: Mutex::new(BTreeMap::new()),
            drain_timeout_ms: AtomicU64::new(RuntimeConfig::default().drain_timeout_ms),
        }
    }

    pub fn state(&self) -> LibraryState {
        self.lifecycle.state()
    }

    /// Bring the runtime up.
    ///
    /// Safe to call from any number of threads at once: exactly one performs
    /// the work and the rest observe its outcome. Calling it again once
    /// initialized is a no-op.
    pub fn initialize(&self, config: &RuntimeConfig) -> DispatchResult<TransitionRole> {
        self.lifecycle.initialize(|| {
            validate_config(config)?;
            let dispatcher = Dispatcher::start(config, self.proxies.clone())?;

            // Same lock order as `register_function`: a registration made
            // while the dispatcher was starting is either in the map here or
            // sees the installed dispatcher.
            let functions = self.functions.lock_recover();
            for (name, thunk) in functions.iter() {
                dispatcher.register_function(name, *thunk)?;
            }
            self.drain_timeout_ms
                .store(config.drain_timeout_ms, Ordering::SeqCst);
            *self.dispatcher.lock_recover() = Some(Arc::new(dispatcher));
            tracing::info!(
                devices = config.devices.len(),
                streams = config.total_streams(),
                functions = functions.len(),
                "Dispatcher started"
            );
            Ok(())
        })
    }

    /// Tear the runtime down.
    ///
    /// Waits for in-flight calls (up to the configured drain timeout), lets
    /// queued invocations finish, then drops every proxy registration.
    /// Queued calls still held on an unsignaled dependency after another
    /// drain timeout are abandoned.
    pub fn finalize(&self) -> DispatchResult<TransitionRole> {
        let drain_timeout = Duration::from_millis(self.drain_timeout_ms.load(Ordering::SeqCst));
        self.lifecycle.finalize(drain_timeout, || {
            let dispatcher = self.dispatcher.lock_recover().take();
            let stopped = match dispatcher {
                Some(dispatcher) => dispatcher.shutdown(drain_timeout),
                None => Ok(()),
            };
            self.proxies.clear();
            stopped
        })
    }

    /// Make an in-process function callable by name on every device.
    ///
    /// Allowed in any state; registrations persist across init cycles.
    pub fn register_function(&self, name: &str, thunk: SinkThunk) -> DispatchResult<()> {
        validate_function_name(name)?;
        let mut functions = self.functions.lock_recover();
        functions.insert(name.to_string(), thunk);
        if let Some(dispatcher) = self.dispatcher.lock_recover().as_ref() {
            dispatcher.register_function(name, thunk)?;
        }
        Ok(())
    }

    /// Queue an invocation.
    pub fn invoke(&self, request: InvocationRequest) -> DispatchResult<Completion> {
        let _guard = self.lifecycle.enter()?;
        self.dispatcher()?.invoke(request)
    }

    /// Register host memory for use by sink functions.
    ///
    /// The memory must stay valid until the handle is unregistered and no
    /// queued invocation refers to it any more.
    pub fn register(&self, host_address: usize, length: usize) -> DispatchResult<ProxyHandle> {
        let _guard = self.lifecycle.enter()?;
        self.proxies.register(host_address, length)
    }

    pub fn unregister(&self, handle: ProxyHandle) -> DispatchResult<()> {
        let _guard = self.lifecycle.enter()?;
        self.proxies.unregister(handle).map(|_| ())
    }

    /// Sink-visible address of a registration.
    pub fn resolve(&self, handle: ProxyHandle) -> DispatchResult<u64> {
        let _guard = self.lifecycle.enter()?;
        self.proxies.resolve(handle)
    }

    /// Allocate a zeroed buffer already registered with this runtime.
    pub fn alloc_buffer(&self, length: usize) -> DispatchResult<ProxiedBuffer> {
        let _guard = self.lifecycle.enter()?;
        ProxiedBuffer::new(self.proxies.clone(), length)
    }

    pub fn synchronize_stream(&self, stream: StreamId) -> DispatchResult<()> {
        let _guard = self.lifecycle.enter()?;
        self.dispatcher()?.synchronize_stream(stream)
    }

    pub fn synchronize_all(&self) -> DispatchResult<()> {
        let _guard = self.lifecycle.enter()?;
        self.dispatcher()?.synchronize_all()
    }

    /// Every configured stream.
    pub fn streams(&self) -> DispatchResult<Vec<StreamId>> {
        let _guard = self.lifecycle.enter()?;
        Ok(self.dispatcher()?.streams())
    }

    fn dispatcher(&self) -> DispatchResult<Arc<Dispatcher>> {
        self.dispatcher
            .lock_recover()
            .clone()
            .ok_or_else(|| DispatchError::state(LibraryState::Initialized, self.state()))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: OnceLock<Runtime> = OnceLock::new();

/// The process-wide runtime.
pub fn global() -> &'static Runtime {
    GLOBAL.get_or_init(Runtime::new)
}

/// Initialize the process-wide runtime.
pub fn initialize(config: &RuntimeConfig) -> DispatchResult<TransitionRole> {
    global().initialize(config)
}

/// Finalize the process-wide runtime.
pub fn finalize() -> DispatchResult<TransitionRole> {
    global().finalize()
}

/// State of the process-wide runtime.
pub fn state() -> LibraryState {
    global().state()
}
