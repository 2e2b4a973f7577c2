//! Transport: delivering marshaled calls to a sink execution context.
//!
//! The [`Transport`] trait is the seam between dispatch and whatever actually
//! runs sink code. [`HostTransport`] runs sink functions in the host process,
//! one worker thread per stream. Calls on a stream execute in enqueue order;
//! streams run independently of each other.

use crate::blob::{self, ResultBlob, StagingArea};
use crate::error::{DispatchError, DispatchResult};
use crate::marshal::MarshaledCall;
use crate::sink::{self, SinkThunk};
use crate::sync::RecoverMutex;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use lib_types::{DeviceConfig, DeviceId, StreamId};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often a worker held on a dependency checks for cancellation.
const DEPENDENCY_POLL: Duration = Duration::from_millis(10);

/// A one-shot completion signal.
///
/// Events are cheap to clone; every clone observes the same signal. Calls can
/// name events they depend on, in which case the worker holds the call until
/// all of them have fired.
#[derive(Clone, Debug, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event, waking every waiter.
    pub fn signal(&self) {
        *self.inner.fired.lock_recover() = true;
        self.inner.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.fired.lock_recover()
    }

    /// Block until the event fires.
    pub fn wait(&self) {
        let fired = self.inner.fired.lock_recover();
        let _fired = self
            .inner
            .cond
            .wait_while(fired, |fired| !*fired)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Block until the event fires or `timeout` elapses. Returns whether it
    /// fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let fired = self.inner.fired.lock_recover();
        let (fired, _) = self
            .inner
            .cond
            .wait_timeout_while(fired, timeout, |fired| !*fired)
            .unwrap_or_else(|e| e.into_inner());
        *fired
    }
}

/// What a finished invocation hands back.
#[derive(Debug)]
pub struct InvocationOutput {
    /// Stream the call ran on.
    pub stream: StreamId,
    /// Function that ran.
    pub function: String,
    /// The result blob, filled in, if the caller passed one.
    pub blob: Option<ResultBlob>,
}

/// Handle to a queued invocation.
#[derive(Debug)]
pub struct Completion {
    stream: StreamId,
    event: Event,
    outcome: Receiver<DispatchResult<InvocationOutput>>,
}

impl Completion {
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Event fired once the invocation has finished, successfully or not.
    ///
    /// Pass it as a dependency of later calls to order work across streams.
    pub fn event(&self) -> Event {
        self.event.clone()
    }

    /// Whether the invocation has finished.
    pub fn is_complete(&self) -> bool {
        self.event.is_signaled()
    }

    /// Block until the invocation finishes and return its outcome.
    pub fn wait(self) -> DispatchResult<InvocationOutput> {
        match self.outcome.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::WorkerUnavailable {
                stream: self.stream,
            }),
        }
    }

    /// Like [`Completion::wait`] but gives up after `timeout`.
    ///
    /// On timeout the invocation keeps running; the completion can be waited
    /// on again. Once an outcome has been returned, further waits report the
    /// worker as unavailable.
    pub fn wait_timeout(&self, timeout: Duration) -> DispatchResult<InvocationOutput> {
        match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::WorkerUnavailable {
                stream: self.stream,
            }),
        }
    }

    /// Take the outcome if the invocation has already finished.
    pub fn try_wait(&self) -> Option<DispatchResult<InvocationOutput>> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(DispatchError::WorkerUnavailable {
                stream: self.stream,
            })),
        }
    }
}

/// A call ready to execute.
pub struct Invocation {
    /// Function name, for diagnostics.
    pub function: String,
    /// Resolved entry point.
    pub thunk: SinkThunk,
    /// Marshaled arguments and result capacity.
    pub call: MarshaledCall,
    /// Caller's result blob, if a result is expected.
    pub blob: Option<ResultBlob>,
    /// Events that must fire before the call runs.
    pub depends_on: Vec<Event>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("function", &self.function)
            .field("args", &self.call.count())
            .field("result_capacity", &self.call.result_capacity())
            .field("depends_on", &self.depends_on.len())
            .finish()
    }
}

/// Delivers invocations to sink execution contexts.
pub trait Transport: Send + Sync {
    /// Number of streams on `device`, or `None` if the device is unknown.
    fn stream_count(&self, device: DeviceId) -> Option<u32>;

    /// Queue `invocation` on `stream`.
    fn enqueue(&self, stream: StreamId, invocation: Invocation) -> DispatchResult<Completion>;

    /// Block until everything queued on `stream` so far has finished.
    fn synchronize(&self, stream: StreamId) -> DispatchResult<()>;

    /// Stop all execution contexts.
    ///
    /// Queued calls finish first. Calls still held on an unsignaled
    /// dependency once `grace` has passed are abandoned and complete with
    /// [`DispatchError::WorkerUnavailable`].
    fn shutdown(&self, grace: Duration) -> DispatchResult<()>;
}

enum Job {
    Invoke {
        invocation: Invocation,
        reply: Sender<DispatchResult<InvocationOutput>>,
        done: Event,
    },
    Marker(Event),
    Stop,
}

struct StreamWorker {
    id: StreamId,
    jobs: Sender<Job>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Runs sink functions on host threads, one FIFO worker per stream.
pub struct HostTransport {
    devices: Vec<Vec<StreamWorker>>,
    /// Fired when shutdown gives up on calls held by dependencies.
    cancel: Event,
}

impl HostTransport {
    /// Start workers for every stream of every device.
    pub fn start(devices: &[DeviceConfig]) -> DispatchResult<Self> {
        let mut transport = Self {
            devices: Vec::with_capacity(devices.len()),
            cancel: Event::new(),
        };
        for (device_index, device) in devices.iter().enumerate() {
            let mut workers = Vec::with_capacity(device.streams as usize);
            for index in 0..device.streams {
                let id = StreamId::new(device_index as u32, index);
                match spawn_worker(id, transport.cancel.clone()) {
                    Ok(worker) => workers.push(worker),
                    Err(e) => {
                        transport.devices.push(workers);
                        // Tear down what already started before bailing.
                        let _ = transport.shutdown(Duration::ZERO);
                        return Err(e);
                    }
                }
            }
            transport.devices.push(workers);
        }

        tracing::info!(
            devices = transport.devices.len(),
            streams = transport.devices.iter().map(Vec::len).sum::<usize>(),
            "Host transport started"
        );
        Ok(transport)
    }

    fn all_finished(&self) -> bool {
        self.devices.iter().flatten().all(|worker| {
            worker
                .handle
                .lock_recover()
                .as_ref()
                .map_or(true, JoinHandle::is_finished)
        })
    }

    fn worker(&self, stream: StreamId) -> DispatchResult<&StreamWorker> {
        self.devices
            .get(stream.device.0 as usize)
            .and_then(|workers| workers.get(stream.index as usize))
            .ok_or_else(|| DispatchError::resolution("stream", stream.to_string()))
    }
}

impl Transport for HostTransport {
    fn stream_count(&self, device: DeviceId) -> Option<u32> {
        self.devices
            .get(device.0 as usize)
            .map(|workers| workers.len() as u32)
    }

    fn enqueue(&self, stream: StreamId, invocation: Invocation) -> DispatchResult<Completion> {
        let worker = self.worker(stream)?;
        let (reply, outcome) = channel::bounded(1);
        let done = Event::new();
        worker
            .jobs
            .send(Job::Invoke {
                invocation,
                reply,
                done: done.clone(),
            })
            .map_err(|_| DispatchError::WorkerUnavailable { stream })?;
        Ok(Completion {
            stream,
            event: done,
            outcome,
        })
    }

    fn synchronize(&self, stream: StreamId) -> DispatchResult<()> {
        let worker = self.worker(stream)?;
        let marker = Event::new();
        worker
            .jobs
            .send(Job::Marker(marker.clone()))
            .map_err(|_| DispatchError::WorkerUnavailable { stream })?;
        marker.wait();
        Ok(())
    }

    fn shutdown(&self, grace: Duration) -> DispatchResult<()> {
        for worker in self.devices.iter().flatten() {
            // Already stopped workers have dropped their receiver.
            let _ = worker.jobs.send(Job::Stop);
        }

        let deadline = Instant::now() + grace;
        while !self.all_finished() {
            if Instant::now() >= deadline {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Stream workers still busy, abandoning calls held on dependencies"
                );
                self.cancel.signal();
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let mut first_error = None;
        for worker in self.devices.iter().flatten() {
            let handle = worker.handle.lock_recover().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!(stream = %worker.id, "Stream worker panicked");
                    first_error.get_or_insert(DispatchError::WorkerUnavailable {
                        stream: worker.id,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::debug!("Host transport stopped");
                Ok(())
            }
        }
    }
}

impl Drop for HostTransport {
    fn drop(&mut self) {
        let running = self
            .devices
            .iter()
            .flatten()
            .any(|w| w.handle.lock_recover().is_some());
        if running {
            tracing::warn!("Host transport dropped without shutdown, stopping workers");
            if let Err(e) = self.shutdown(Duration::ZERO) {
                tracing::warn!(error = %e, "Error stopping workers during drop");
            }
        }
    }
}

fn spawn_worker(id: StreamId, cancel: Event) -> DispatchResult<StreamWorker> {
    let (jobs, queue) = channel::unbounded();
    let handle = std::thread::Builder::new()
        .name(format!("sink-{}-{}", id.device.0, id.index))
        .spawn(move || run_worker(id, queue, cancel))
        .map_err(|source| DispatchError::WorkerSpawn { stream: id, source })?;
    Ok(StreamWorker {
        id,
        jobs,
        handle: Mutex::new(Some(handle)),
    })
}

fn run_worker(id: StreamId, queue: Receiver<Job>, cancel: Event) {
    tracing::debug!(stream = %id, "Stream worker started");
    for job in queue.iter() {
        match job {
            Job::Invoke {
                invocation,
                reply,
                done,
            } => {
                let outcome = if await_dependencies(&invocation.depends_on, &cancel) {
                    execute(id, invocation)
                } else {
                    tracing::warn!(
                        stream = %id,
                        function = %invocation.function,
                        "Abandoning call held on a dependency"
                    );
                    Err(DispatchError::WorkerUnavailable { stream: id })
                };
                // The caller may have dropped its completion.
                let _ = reply.send(outcome);
                done.signal();
            }
            Job::Marker(marker) => marker.signal(),
            Job::Stop => break,
        }
    }
    tracing::debug!(stream = %id, "Stream worker exiting");
}

/// Wait for every dependency to fire. Returns `false` if `cancel` fired
/// first.
fn await_dependencies(dependencies: &[Event], cancel: &Event) -> bool {
    for dependency in dependencies {
        while !dependency.wait_timeout(DEPENDENCY_POLL) {
            if cancel.is_signaled() {
                return false;
            }
        }
    }
    true
}

fn execute(stream: StreamId, invocation: Invocation) -> DispatchResult<InvocationOutput> {
    let Invocation {
        function,
        thunk,
        call,
        blob,
        ..
    } = invocation;

    // Calls without a blob still get a zero-capacity area so the sink has
    // somewhere to record what it needed.
    let mut staging = StagingArea::new(blob.as_ref().map_or(0, ResultBlob::capacity));
    let (ret, ret_size) = (staging.as_mut_ptr(), staging.capacity());

    tracing::trace!(%stream, function = %function, args = call.count(), "Running sink function");

    let words = call.raw();
    let ran = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
        sink::call_thunk(thunk, &words, ret, ret_size)
    }));

    let panicked = match ran {
        Err(payload) => Some(sink::panic_message(payload.as_ref())),
        Ok(()) => staging.report().panicked,
    };
    if let Some(message) = panicked {
        tracing::error!(%stream, function = %function, %message, "Sink function panicked");
        return Err(DispatchError::SinkPanicked { function, message });
    }

    let blob = blob::settle(staging, blob)?;
    Ok(InvocationOutput {
        stream,
        function,
        blob,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{ArgList, Marshaler};
    use crate::proxy::{ProxyTable, SharedAddressSpace};
    use lib_types::RETURN_SIZE_LIMIT;
    use std::sync::atomic::{AtomicU64, Ordering};

    const GRACE: Duration = Duration::from_secs(5);

    static LOG: Mutex<Vec<u64>> = Mutex::new(Vec::new());
    static GATE_OPENED: AtomicU64 = AtomicU64::new(0);

    crate::sink_fn! {
        fn record(args, ret) {
            LOG.lock().unwrap().push(args.get(0).as_u64());
        }
    }

    crate::sink_fn! {
        fn add(args, ret) {
            let _ = ret.put_u64(args.get(0).as_u64() + args.get(1).as_u64());
        }
    }

    crate::sink_fn! {
        fn explode(args, ret) {
            panic!("worker sink exploded");
        }
    }

    crate::sink_fn! {
        fn open_gate(args, ret) {
            std::thread::sleep(Duration::from_millis(20));
            GATE_OPENED.store(args.get(0).as_u64(), Ordering::SeqCst);
        }
    }

    crate::sink_fn! {
        fn read_gate(args, ret) {
            let _ = ret.put_u64(GATE_OPENED.load(Ordering::SeqCst));
        }
    }

    fn invocation(function: &str, thunk: SinkThunk, args: ArgList, capacity: Option<u16>) -> Invocation {
        let proxies = ProxyTable::new(Arc::new(SharedAddressSpace));
        let call = Marshaler::new(&proxies, RETURN_SIZE_LIMIT)
            .marshal(&args, capacity.unwrap_or(0))
            .unwrap();
        Invocation {
            function: function.to_string(),
            thunk,
            call,
            blob: capacity.map(ResultBlob::with_capacity),
            depends_on: Vec::new(),
        }
    }

    #[test]
    fn test_event_signal_and_wait() {
        let event = Event::new();
        assert!(!event.wait_timeout(Duration::from_millis(5)));
        let clone = event.clone();
        let waiter = std::thread::spawn(move || clone.wait());
        event.signal();
        waiter.join().unwrap();
        assert!(event.is_signaled());
    }

    #[test]
    fn test_result_round_trip() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let stream = StreamId::new(0, 0);
        let completion = transport
            .enqueue(stream, invocation("add", add, ArgList::new().arg(2u64).arg(3u64), Some(8)))
            .unwrap();
        let output = completion.wait().unwrap();
        assert_eq!(output.stream, stream);
        assert_eq!(output.blob.unwrap().read_u64(0), Some(5));
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_capacity_overflow_reported() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let completion = transport
            .enqueue(
                StreamId::new(0, 0),
                invocation("add", add, ArgList::new().arg(1u64), Some(4)),
            )
            .unwrap();
        assert!(matches!(
            completion.wait(),
            Err(DispatchError::Capacity {
                capacity: 4,
                required: Some(8)
            })
        ));
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_stream_fifo_order() {
        LOG.lock().unwrap().clear();
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let stream = StreamId::new(0, 0);
        let completions: Vec<_> = (0..32u64)
            .map(|i| {
                transport
                    .enqueue(stream, invocation("record", record, ArgList::new().arg(i), None))
                    .unwrap()
            })
            .collect();
        transport.synchronize(stream).unwrap();
        assert!(completions.iter().all(Completion::is_complete));
        assert_eq!(*LOG.lock().unwrap(), (0..32).collect::<Vec<_>>());
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_cross_stream_dependency() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 2)]).unwrap();
        let first = transport
            .enqueue(
                StreamId::new(0, 0),
                invocation("open_gate", open_gate, ArgList::new().arg(99u64), None),
            )
            .unwrap();

        let mut dependent = invocation("read_gate", read_gate, ArgList::new(), Some(8));
        dependent.depends_on.push(first.event());
        let second = transport.enqueue(StreamId::new(0, 1), dependent).unwrap();

        let output = second.wait().unwrap();
        assert_eq!(output.blob.unwrap().read_u64(0), Some(99));
        first.wait().unwrap();
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_unknown_stream() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        assert_eq!(transport.stream_count(DeviceId(0)), Some(1));
        assert_eq!(transport.stream_count(DeviceId(1)), None);
        let err = transport
            .enqueue(StreamId::new(0, 3), invocation("add", add, ArgList::new(), None))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Resolution { what: "stream", .. }));
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_enqueue_after_shutdown() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        transport.shutdown(GRACE).unwrap();
        let err = transport
            .enqueue(StreamId::new(0, 0), invocation("add", add, ArgList::new(), None))
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerUnavailable { .. }));
    }

    #[test]
    fn test_wait_timeout_then_wait_again() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let gate = Event::new();
        let mut held = invocation("add", add, ArgList::new().arg(1u64).arg(1u64), Some(8));
        held.depends_on.push(gate.clone());
        let completion = transport.enqueue(StreamId::new(0, 0), held).unwrap();

        assert!(matches!(
            completion.wait_timeout(Duration::from_millis(10)),
            Err(DispatchError::Timeout(_))
        ));
        assert!(completion.try_wait().is_none());

        gate.signal();
        let output = completion.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(output.blob.unwrap().read_u64(0), Some(2));
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_sink_panic_is_reported() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let stream = StreamId::new(0, 0);
        let completion = transport
            .enqueue(stream, invocation("explode", explode, ArgList::new(), None))
            .unwrap();
        match completion.wait() {
            Err(DispatchError::SinkPanicked { function, message }) => {
                assert_eq!(function, "explode");
                assert_eq!(message, "worker sink exploded");
            }
            other => panic!("expected a sink panic, got {:?}", other),
        }

        // The worker survives and keeps serving the stream.
        let output = transport
            .enqueue(stream, invocation("add", add, ArgList::new().arg(4u64).arg(4u64), Some(8)))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(output.blob.unwrap().read_u64(0), Some(8));
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_oversize_without_blob_is_reported() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let completion = transport
            .enqueue(StreamId::new(0, 0), invocation("add", add, ArgList::new(), None))
            .unwrap();
        assert!(matches!(
            completion.wait(),
            Err(DispatchError::Capacity {
                capacity: 0,
                required: Some(8)
            })
        ));
        transport.shutdown(GRACE).unwrap();
    }

    #[test]
    fn test_shutdown_abandons_unsignaled_dependency() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let stream = StreamId::new(0, 0);
        let mut held = invocation("add", add, ArgList::new().arg(1u64), Some(8));
        held.depends_on.push(Event::new());
        let completion = transport.enqueue(stream, held).unwrap();

        let started = Instant::now();
        transport.shutdown(Duration::from_millis(50)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            completion.wait(),
            Err(DispatchError::WorkerUnavailable { .. })
        ));
    }

    #[test]
    fn test_shutdown_lets_satisfied_dependencies_run() {
        let transport = HostTransport::start(&[DeviceConfig::new("host", 1)]).unwrap();
        let gate = Event::new();
        let mut held = invocation("add", add, ArgList::new().arg(2u64).arg(5u64), Some(8));
        held.depends_on.push(gate.clone());
        let completion = transport.enqueue(StreamId::new(0, 0), held).unwrap();

        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            gate.signal();
        });
        transport.shutdown(GRACE).unwrap();
        opener.join().unwrap();
        assert_eq!(completion.wait().unwrap().blob.unwrap().read_u64(0), Some(7));
    }
}
