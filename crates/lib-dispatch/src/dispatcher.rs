//! Dispatch of named invocations onto device streams.
//!
//! A [`Dispatcher`] exists only while the runtime is initialized. It owns one
//! symbol table per device and the transport that executes calls. Every
//! check that can reject a call (arity, result capacity limit, proxy
//! references, device, stream, symbol) runs before the call is queued.

use crate::blob::ResultBlob;
use crate::error::{DispatchError, DispatchResult};
use crate::loader::SinkLibrary;
use crate::marshal::{ArgList, Marshaler};
use crate::proxy::ProxyTable;
use crate::sink::SinkThunk;
use crate::symbols::SymbolTable;
use crate::transport::{Completion, Event, HostTransport, Invocation, Transport};
use lib_types::{ArgValue, DeviceId, RuntimeConfig, StreamId};
use std::sync::Arc;
use std::time::Duration;

/// A request to run a sink function.
#[derive(Debug)]
pub struct InvocationRequest {
    pub stream: StreamId,
    pub function: String,
    pub args: ArgList,
    pub result: Option<ResultBlob>,
    pub depends_on: Vec<Event>,
}

impl InvocationRequest {
    /// Request to run `function` on `stream` with no arguments.
    pub fn new(stream: StreamId, function: impl Into<String>) -> Self {
        Self {
            stream,
            function: function.into(),
            args: ArgList::new(),
            result: None,
            depends_on: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.args.push(value);
        self
    }

    /// Replace the argument list.
    pub fn args(mut self, args: ArgList) -> Self {
        self.args = args;
        self
    }

    /// Expect a result of at most `capacity` bytes.
    pub fn result_capacity(mut self, capacity: u16) -> Self {
        self.result = Some(ResultBlob::with_capacity(capacity));
        self
    }

    /// Hold the call until `event` fires.
    pub fn after(mut self, event: Event) -> Self {
        self.depends_on.push(event);
        self
    }
}

/// Configured device.
#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub symbols: SymbolTable,
}

/// Routes invocations to devices and streams.
pub struct Dispatcher {
    devices: Vec<Device>,
    transport: Box<dyn Transport>,
    proxies: Arc<ProxyTable>,
    max_result_size: u16,
}

impl Dispatcher {
    /// Load every device's libraries and start the host transport.
    pub fn start(config: &RuntimeConfig, proxies: Arc<ProxyTable>) -> DispatchResult<Self> {
        let devices = load_devices(config)?;
        let transport = HostTransport::start(&config.devices)?;
        Ok(Self::with_transport(
            devices,
            Box::new(transport),
            proxies,
            config.max_result_size,
        ))
    }

    /// Assemble a dispatcher over an already running transport.
    pub fn with_transport(
        devices: Vec<Device>,
        transport: Box<dyn Transport>,
        proxies: Arc<ProxyTable>,
        max_result_size: u16,
    ) -> Self {
        Self {
            devices,
            transport,
            proxies,
            max_result_size,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> DispatchResult<&Device> {
        self.devices
            .get(id.0 as usize)
            .ok_or_else(|| DispatchError::resolution("device", id.to_string()))
    }

    /// Every stream on every device, in order.
    pub fn streams(&self) -> Vec<StreamId> {
        self.devices
            .iter()
            .flat_map(|device| {
                let count = self.transport.stream_count(device.id).unwrap_or(0);
                (0..count).map(move |index| StreamId::new(device.id.0, index))
            })
            .collect()
    }

    /// Register an in-process sink function on every device.
    pub fn register_function(&self, name: &str, thunk: SinkThunk) -> DispatchResult<()> {
        for device in &self.devices {
            device.symbols.register(name, thunk)?;
        }
        Ok(())
    }

    /// Validate, marshal and queue an invocation.
    pub fn invoke(&self, request: InvocationRequest) -> DispatchResult<Completion> {
        let InvocationRequest {
            stream,
            function,
            args,
            result,
            depends_on,
        } = request;

        let capacity = result.as_ref().map_or(0, ResultBlob::capacity);
        let call = Marshaler::new(&self.proxies, self.max_result_size).marshal(&args, capacity)?;

        let device = self.device(stream.device)?;
        match self.transport.stream_count(stream.device) {
            Some(count) if stream.index < count => {}
            _ => return Err(DispatchError::resolution("stream", stream.to_string())),
        }
        let thunk = device.symbols.resolve(&function)?;

        tracing::debug!(
            %stream,
            function = %function,
            args = call.count(),
            result_capacity = capacity,
            dependencies = depends_on.len(),
            "Enqueueing invocation"
        );

        self.transport.enqueue(
            stream,
            Invocation {
                function,
                thunk,
                call,
                blob: result,
                depends_on,
            },
        )
    }

    /// Wait for everything queued on `stream`.
    pub fn synchronize_stream(&self, stream: StreamId) -> DispatchResult<()> {
        self.device(stream.device)?;
        self.transport.synchronize(stream)
    }

    /// Wait for everything queued on every stream.
    pub fn synchronize_all(&self) -> DispatchResult<()> {
        for stream in self.streams() {
            self.transport.synchronize(stream)?;
        }
        Ok(())
    }

    /// Stop the transport. Calls already queued run to completion first;
    /// calls still held on a dependency after `grace` are abandoned.
    pub fn shutdown(&self, grace: Duration) -> DispatchResult<()> {
        self.transport.shutdown(grace)
    }
}

fn load_devices(config: &RuntimeConfig) -> DispatchResult<Vec<Device>> {
    config
        .devices
        .iter()
        .enumerate()
        .map(|(index, device)| {
            let libraries = device
                .libraries
                .iter()
                .map(SinkLibrary::load)
                .collect::<DispatchResult<Vec<_>>>()?;
            Ok(Device {
                id: DeviceId(index as u32),
                name: device.name.clone(),
                symbols: SymbolTable::with_libraries(libraries),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::SharedAddressSpace;
    use lib_types::DeviceConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    crate::sink_fn! {
        fn sum(args, ret) {
            let total: u64 = args.as_array().iter().sum();
            let _ = ret.put_u64(total);
        }
    }

    /// Transport that records what reaches it without running anything.
    #[derive(Default)]
    struct RecordingTransport {
        enqueued: Mutex<Vec<String>>,
        synced: AtomicUsize,
    }

    impl Transport for Arc<RecordingTransport> {
        fn stream_count(&self, device: DeviceId) -> Option<u32> {
            (device.0 == 0).then_some(2)
        }

        fn enqueue(&self, stream: StreamId, invocation: Invocation) -> DispatchResult<Completion> {
            self.enqueued.lock().unwrap().push(invocation.function);
            Err(DispatchError::WorkerUnavailable { stream })
        }

        fn synchronize(&self, _stream: StreamId) -> DispatchResult<()> {
            self.synced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self, _grace: Duration) -> DispatchResult<()> {
            Ok(())
        }
    }

    fn recording() -> (Dispatcher, Arc<RecordingTransport>) {
        let recorder = Arc::new(RecordingTransport::default());
        let device = Device {
            id: DeviceId(0),
            name: "host".to_string(),
            symbols: SymbolTable::new(),
        };
        let dispatcher = Dispatcher::with_transport(
            vec![device],
            Box::new(recorder.clone()),
            Arc::new(ProxyTable::new(Arc::new(SharedAddressSpace))),
            64,
        );
        dispatcher.register_function("sum", sum).unwrap();
        (dispatcher, recorder)
    }

    #[test]
    fn test_rejections_never_reach_transport() {
        let (dispatcher, recorder) = recording();
        let stream = StreamId::new(0, 0);

        let too_many = (0..20u64).fold(InvocationRequest::new(stream, "sum"), |r, i| r.arg(i));
        assert!(matches!(
            dispatcher.invoke(too_many),
            Err(DispatchError::Arity { given: 20, .. })
        ));
        assert!(matches!(
            dispatcher.invoke(InvocationRequest::new(stream, "missing")),
            Err(DispatchError::Resolution { what: "function", .. })
        ));
        assert!(matches!(
            dispatcher.invoke(InvocationRequest::new(StreamId::new(0, 2), "sum")),
            Err(DispatchError::Resolution { what: "stream", .. })
        ));
        assert!(matches!(
            dispatcher.invoke(InvocationRequest::new(StreamId::new(1, 0), "sum")),
            Err(DispatchError::Resolution { what: "device", .. })
        ));
        assert!(matches!(
            dispatcher.invoke(InvocationRequest::new(stream, "sum").result_capacity(65)),
            Err(DispatchError::InvalidParameter { .. })
        ));

        assert!(recorder.enqueued.lock().unwrap().is_empty());

        // A valid request does reach the transport.
        let _ = dispatcher.invoke(InvocationRequest::new(stream, "sum").arg(1u64));
        assert_eq!(*recorder.enqueued.lock().unwrap(), vec!["sum".to_string()]);
    }

    #[test]
    fn test_synchronize_all_visits_every_stream() {
        let (dispatcher, recorder) = recording();
        assert_eq!(dispatcher.streams().len(), 2);
        dispatcher.synchronize_all().unwrap();
        assert_eq!(recorder.synced.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_host_dispatch_end_to_end() {
        let proxies = Arc::new(ProxyTable::new(Arc::new(SharedAddressSpace)));
        let config = RuntimeConfig {
            devices: vec![DeviceConfig::new("host", 2), DeviceConfig::new("second", 1)],
            ..Default::default()
        };
        let dispatcher = Dispatcher::start(&config, proxies).unwrap();
        dispatcher.register_function("sum", sum).unwrap();
        assert_eq!(dispatcher.streams().len(), 3);
        assert_eq!(dispatcher.device(DeviceId(1)).unwrap().name, "second");

        let output = dispatcher
            .invoke(
                InvocationRequest::new(StreamId::new(1, 0), "sum")
                    .arg(10u64)
                    .arg(20u64)
                    .arg(12u64)
                    .result_capacity(8),
            )
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(output.blob.unwrap().read_u64(0), Some(42));

        dispatcher.synchronize_all().unwrap();
        dispatcher.shutdown(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_missing_library_fails_start() {
        let config = RuntimeConfig {
            devices: vec![DeviceConfig::new("host", 1).with_library("/nonexistent/libnope.so")],
            ..Default::default()
        };
        let proxies = Arc::new(ProxyTable::new(Arc::new(SharedAddressSpace)));
        assert!(matches!(
            Dispatcher::start(&config, proxies),
            Err(DispatchError::LoadError { .. })
        ));
    }
}
