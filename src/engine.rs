//! Event Engine
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               |           |
//!               +-----------+--> Failed
//! ```
//!
//! One session per run: resolve the device, create the sink, open the
//! stream in monitor mode, then a single thread reads and dispatches events
//! in arrival order until stopped or the device goes away. Chords are
//! emitted synchronously from that loop, so two chords never interleave.

use crate::error::EngineError;
use crate::event::InputEvent;
use crate::input_backend::{DeviceProvider, EventStream, KeySink, SinkProvider, StopSignal};
use crate::keys;
use crate::locator::{self, DeviceCriteria, PhysicalDevice};
use crate::remap::RemapTable;
use crate::sink::{OutputSink, SinkSettings};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Failed = 4,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Stopped => "Stopped",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
            EngineState::Stopping => "Stopping",
            EngineState::Failed => "Failed",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Stopping,
            4 => EngineState::Failed,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared, lock-free view of the engine state for status queries.
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<AtomicU8>);

impl StatusHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(EngineState::Stopped as u8)))
    }

    pub fn get(&self) -> EngineState {
        EngineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: EngineState) -> EngineState {
        EngineState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub criteria: DeviceCriteria,
    pub table: Arc<RemapTable>,
    pub sink: SinkSettings,
    pub log_dispatch: bool,
}

impl From<crate::config::Config> for EngineConfig {
    fn from(config: crate::config::Config) -> Self {
        Self {
            criteria: config.criteria,
            table: Arc::new(config.table),
            sink: config.sink,
            log_dispatch: config.logging.log_dispatch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Signal, control-socket STOP, or a caller's `StopSignal::request`.
    Requested,
    /// The input stream ended (unplug or read error).
    Disconnected,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::Disconnected => f.write_str("device disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub events_seen: u64,
    pub chords_emitted: u64,
    pub emit_failures: u64,
    pub reason: StopReason,
}

/// Outcome of dispatching one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Not a key press: motion, sync, release, repeat.
    Ignored,
    /// A press of a code the table does not map.
    Unmapped,
    Emitted,
    /// The chord failed; the session keeps running.
    EmitFailed,
}

/// Runtime aggregate for one run: the resolved device, its stream, the
/// sink and the table.
pub struct EngineSession<S: EventStream, K: KeySink> {
    device: PhysicalDevice,
    stream: Option<S>,
    sink: Option<OutputSink<K>>,
    table: Arc<RemapTable>,
    log_dispatch: bool,
    events_seen: u64,
    chords_emitted: u64,
    emit_failures: u64,
}

impl<S: EventStream, K: KeySink> EngineSession<S, K> {
    pub fn new(device: PhysicalDevice, table: Arc<RemapTable>, log_dispatch: bool) -> Self {
        Self {
            device,
            stream: None,
            sink: None,
            table,
            log_dispatch,
            events_seen: 0,
            chords_emitted: 0,
            emit_failures: 0,
        }
    }

    pub fn device(&self) -> &PhysicalDevice {
        &self.device
    }

    /// Create the session's single sink. A second call while one is live is
    /// rejected.
    pub fn create_sink<O>(&mut self, outputs: &mut O, settings: &SinkSettings) -> Result<(), EngineError>
    where
        O: SinkProvider<Sink = K>,
    {
        if self.sink.as_ref().is_some_and(|s| s.is_live()) {
            return Err(EngineError::SinkAlreadyCreated);
        }
        self.sink = Some(OutputSink::create(outputs, settings, self.table.declared_keys())?);
        Ok(())
    }

    pub fn attach_stream(&mut self, stream: S) {
        self.stream = Some(stream);
    }

    /// Classify one event and emit its chord if it is a mapped press.
    ///
    /// Only a lost sink is fatal; any other emit failure is logged and the
    /// session continues.
    pub fn dispatch(&mut self, event: &InputEvent) -> Result<Dispatch, EngineError> {
        self.events_seen += 1;

        let Some(chord) = self.table.classify(event) else {
            if event.is_press() {
                debug!("{} pressed, not mapped", keys::display(event.code));
                return Ok(Dispatch::Unmapped);
            }
            return Ok(Dispatch::Ignored);
        };

        let result = match self.sink.as_mut() {
            Some(sink) => sink.emit(event.code, chord),
            None => Err(EngineError::EmitFailed {
                trigger: keys::display(event.code),
                failed_key: chord.to_string(),
                left_pressed: Vec::new(),
                source: None,
            }),
        };

        match result {
            Ok(()) => {
                self.chords_emitted += 1;
                if self.log_dispatch {
                    info!("{} -> {}", keys::display(event.code), chord);
                } else {
                    debug!("{} -> {}", keys::display(event.code), chord);
                }
                Ok(Dispatch::Emitted)
            }
            Err(e) => {
                self.emit_failures += 1;
                error!("[{}] {e}", e.category());
                if let EngineError::EmitFailed { left_pressed, .. } = &e {
                    if !left_pressed.is_empty() {
                        error!("Keys may be stuck down: {}", left_pressed.join(", "));
                    }
                }
                if emit_error_is_fatal(&e) {
                    if let Some(sink) = self.sink.as_mut() {
                        sink.destroy();
                    }
                    return Err(e);
                }
                Ok(Dispatch::EmitFailed)
            }
        }
    }

    /// Read and dispatch until stopped or the stream ends.
    pub fn run_loop(&mut self, stop: &StopSignal) -> Result<StopReason, EngineError> {
        let Some(mut stream) = self.stream.take() else {
            return Err(EngineError::StreamReadError {
                reason: "no input stream attached".to_string(),
                source: None,
            });
        };

        let outcome = loop {
            match stream.next_event(stop) {
                Ok(Some(event)) => {
                    if let Err(e) = self.dispatch(&event) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(StopReason::Requested),
                Err(e @ EngineError::StreamReadError { .. }) => {
                    info!("{e}");
                    break Ok(StopReason::Disconnected);
                }
                Err(e) => break Err(e),
            }
        };

        self.stream = Some(stream);
        outcome
    }

    /// Release the stream and destroy the sink. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed input stream for {}", self.device.path.display());
        }
        if let Some(sink) = self.sink.as_mut() {
            sink.destroy();
        }
    }

    pub fn summary(&self, reason: StopReason) -> SessionSummary {
        SessionSummary {
            events_seen: self.events_seen,
            chords_emitted: self.chords_emitted,
            emit_failures: self.emit_failures,
            reason,
        }
    }
}

/// The virtual device itself is gone: nothing further can be emitted.
fn emit_error_is_fatal(e: &EngineError) -> bool {
    let EngineError::EmitFailed {
        source: Some(source),
        ..
    } = e
    else {
        return false;
    };
    matches!(
        source.raw_os_error(),
        Some(libc::ENODEV) | Some(libc::EBADF) | Some(libc::EPIPE)
    ) || source.kind() == io::ErrorKind::BrokenPipe
}

pub struct Engine<P: DeviceProvider, O: SinkProvider> {
    devices: P,
    outputs: O,
    config: EngineConfig,
    stop: Arc<StopSignal>,
    status: StatusHandle,
}

impl<P: DeviceProvider, O: SinkProvider> Engine<P, O> {
    pub fn new(devices: P, outputs: O, config: EngineConfig, stop: Arc<StopSignal>) -> Self {
        Self {
            devices,
            outputs,
            config,
            stop,
            status: StatusHandle::new(),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn devices(&self) -> &P {
        &self.devices
    }

    pub fn outputs(&self) -> &O {
        &self.outputs
    }

    fn transition(&self, to: EngineState) {
        let from = self.status.set(to);
        info!("Engine {} -> {}", from, to);
    }

    /// Run one session to completion on the calling thread.
    pub fn run(&mut self) -> Result<SessionSummary, EngineError> {
        self.transition(EngineState::Starting);
        let mut session = match self.start() {
            Ok(session) => session,
            Err(e) => {
                error!("[{}] {e}", e.category());
                self.transition(EngineState::Failed);
                return Err(e);
            }
        };

        self.transition(EngineState::Running);
        let outcome = session.run_loop(&self.stop);

        match outcome {
            Ok(reason) => {
                self.transition(EngineState::Stopping);
                session.shutdown();
                let summary = session.summary(reason);
                info!(
                    "Session ended ({}): {} events seen, {} chords emitted, {} emit failures",
                    reason, summary.events_seen, summary.chords_emitted, summary.emit_failures
                );
                self.transition(EngineState::Stopped);
                Ok(summary)
            }
            Err(e) => {
                error!("[{}] {e}", e.category());
                session.shutdown();
                self.transition(EngineState::Failed);
                Err(e)
            }
        }
    }

    fn start(&mut self) -> Result<EngineSession<P::Stream, O::Sink>, EngineError> {
        let device = locator::resolve(&self.devices, &self.config.criteria)?;

        for trigger in self.config.table.triggers() {
            if !device.supports(trigger) {
                warn!(
                    "{} does not report {}; that remap entry stays inactive",
                    device.name,
                    keys::display(trigger)
                );
            }
        }

        let mut session = EngineSession::new(
            device,
            Arc::clone(&self.config.table),
            self.config.log_dispatch,
        );
        session.create_sink(&mut self.outputs, &self.config.sink)?;

        let stream = self.devices.open_monitor(session.device())?;
        session.attach_stream(stream);
        Ok(session)
    }
}

impl<P, O> Engine<P, O>
where
    P: DeviceProvider + Send + 'static,
    O: SinkProvider + Send + 'static,
{
    /// Run the engine on a dedicated reader thread.
    pub fn spawn(mut self) -> EngineHandle<P, O> {
        let stop = self.stop.clone();
        let status = self.status.clone();
        let join = thread::spawn(move || {
            let result = self.run();
            (self, result)
        });
        EngineHandle {
            stop,
            status,
            join: Some(join),
        }
    }
}

type EngineThread<P, O> = thread::JoinHandle<(Engine<P, O>, Result<SessionSummary, EngineError>)>;

pub struct EngineHandle<P: DeviceProvider, O: SinkProvider> {
    stop: Arc<StopSignal>,
    status: StatusHandle,
    join: Option<EngineThread<P, O>>,
}

impl<P: DeviceProvider, O: SinkProvider> EngineHandle<P, O> {
    pub fn status(&self) -> EngineState {
        self.status.get()
    }

    /// Request a stop without waiting for it.
    pub fn request_stop(&self) {
        self.stop.request();
    }

    /// Wait for the session to end and hand the engine back with its result.
    /// `None` only if the engine thread panicked.
    pub fn join(mut self) -> Option<(Engine<P, O>, Result<SessionSummary, EngineError>)> {
        self.join.take().and_then(|handle| handle.join().ok())
    }

    /// Request a stop and wait for it.
    pub fn stop(self) -> Option<(Engine<P, O>, Result<SessionSummary, EngineError>)> {
        self.stop.request();
        self.join()
    }
}

impl<P: DeviceProvider, O: SinkProvider> Drop for EngineHandle<P, O> {
    fn drop(&mut self) {
        if let Some(handle) = self.join.take() {
            self.stop.request();
            let _ = handle.join();
        }
    }
}
