//! Mock backend for tests.
//!
//! Synthetic devices with scripted event streams, and a sink provider that
//! records every transition instead of touching uinput.

use super::{DeviceProvider, EventStream, KeySink, SinkProvider, StopSignal};
use crate::error::EngineError;
use crate::event::{EventKind, InputEvent};
use crate::locator::PhysicalDevice;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a synthetic device description.
pub fn device(path: &str, name: &str, vendor: u16, product: u16, keys: &[u16]) -> PhysicalDevice {
    PhysicalDevice {
        path: PathBuf::from(path),
        name: name.to_string(),
        vendor,
        product,
        keys: keys.iter().copied().collect(),
    }
}

/// What a scripted stream does once its events run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptEnd {
    /// Report end-of-stream, as an unplugged device does.
    #[default]
    Disconnect,
    /// Stay blocked until a stop is requested.
    BlockUntilStop,
}

#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub events: Vec<InputEvent>,
    pub end: ScriptEnd,
}

impl MockScript {
    pub fn new(events: Vec<InputEvent>, end: ScriptEnd) -> Self {
        Self { events, end }
    }
}

#[derive(Default)]
pub struct MockDevices {
    devices: Vec<PhysicalDevice>,
    scripts: HashMap<PathBuf, MockScript>,
    open_failures: HashSet<PathBuf>,
    opens: AtomicUsize,
}

impl MockDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: PhysicalDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Events served to every stream opened on `path`.
    pub fn with_script(mut self, path: &str, script: MockScript) -> Self {
        self.scripts.insert(PathBuf::from(path), script);
        self
    }

    /// Make `open_monitor` fail for `path`, as a race with unplug would.
    pub fn failing_open(mut self, path: &str) -> Self {
        self.open_failures.insert(PathBuf::from(path));
        self
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DeviceProvider for MockDevices {
    type Stream = MockStream;

    fn enumerate(&self) -> Vec<PhysicalDevice> {
        self.devices.clone()
    }

    fn open_monitor(&self, device: &PhysicalDevice) -> Result<MockStream, EngineError> {
        if self.open_failures.contains(&device.path) {
            return Err(EngineError::StreamOpenFailed {
                path: device.path.clone(),
                reason: "no such device".to_string(),
                source: Some(io::Error::from_raw_os_error(libc::ENODEV)),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.get(&device.path).cloned().unwrap_or_default();
        Ok(MockStream {
            events: script.events.into(),
            end: script.end,
        })
    }
}

pub struct MockStream {
    events: VecDeque<InputEvent>,
    end: ScriptEnd,
}

impl EventStream for MockStream {
    fn next_event(&mut self, stop: &StopSignal) -> Result<Option<InputEvent>, EngineError> {
        if stop.is_requested() {
            return Ok(None);
        }
        if let Some(ev) = self.events.pop_front() {
            return Ok(Some(ev));
        }
        match self.end {
            ScriptEnd::Disconnect => Err(EngineError::StreamReadError {
                reason: "device disconnected".to_string(),
                source: Some(io::Error::from_raw_os_error(libc::ENODEV)),
            }),
            ScriptEnd::BlockUntilStop => {
                stop.wait(None);
                Ok(None)
            }
        }
    }
}

/// Everything the recording sinks observed.
#[derive(Debug, Clone, Default)]
pub struct SinkRecord {
    pub attempts: u32,
    pub created: u32,
    pub destroyed: u32,
    pub name: String,
    pub declared: BTreeSet<u16>,
    /// Key transitions, each followed by the sync marker the sink wrote.
    pub events: Vec<InputEvent>,
}

impl SinkRecord {
    /// Key transitions only, as `(code, value)`.
    pub fn transitions(&self) -> Vec<(u16, i32)> {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::Key)
            .map(|e| (e.code, e.value))
            .collect()
    }

    pub fn live(&self) -> u32 {
        self.created - self.destroyed
    }
}

#[derive(Default)]
pub struct MockSinkProvider {
    record: Arc<Mutex<SinkRecord>>,
    transient_failures: u32,
    deny: bool,
    fail_on: Option<(u16, i32)>,
    fail_errno: Option<i32>,
}

impl MockSinkProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` creations as if uinput were not ready yet.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.transient_failures = n;
        self
    }

    /// Fail every creation with a permission error.
    pub fn denied(mut self) -> Self {
        self.deny = true;
        self
    }

    /// Make every sink reject the transition `(code, value)`.
    pub fn failing_on(mut self, code: u16, value: i32) -> Self {
        self.fail_on = Some((code, value));
        self
    }

    /// Like `failing_on`, but the write fails with the OS error `errno`.
    pub fn failing_with_errno(mut self, code: u16, value: i32, errno: i32) -> Self {
        self.fail_on = Some((code, value));
        self.fail_errno = Some(errno);
        self
    }

    pub fn snapshot(&self) -> SinkRecord {
        lock(&self.record).clone()
    }
}

impl SinkProvider for MockSinkProvider {
    type Sink = RecordingSink;

    fn create(&mut self, name: &str, keys: &BTreeSet<u16>) -> io::Result<RecordingSink> {
        let mut record = lock(&self.record);
        record.attempts += 1;
        if self.deny {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(io::Error::new(io::ErrorKind::NotFound, "uinput not ready"));
        }
        record.created += 1;
        record.name = name.to_string();
        record.declared = keys.clone();
        Ok(RecordingSink {
            record: self.record.clone(),
            fail_on: self.fail_on,
            fail_errno: self.fail_errno,
        })
    }
}

pub struct RecordingSink {
    record: Arc<Mutex<SinkRecord>>,
    fail_on: Option<(u16, i32)>,
    fail_errno: Option<i32>,
}

impl KeySink for RecordingSink {
    fn send(&mut self, code: u16, value: i32) -> io::Result<()> {
        if self.fail_on == Some((code, value)) {
            return Err(match self.fail_errno {
                Some(errno) => io::Error::from_raw_os_error(errno),
                None => io::Error::other("injected write failure"),
            });
        }
        let mut record = lock(&self.record);
        record.events.push(InputEvent::new(EventKind::Key, code, value));
        record.events.push(InputEvent::sync());
        Ok(())
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        lock(&self.record).destroyed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::*;

    #[test]
    fn test_script_serves_events_then_disconnects() {
        let dev = device("/dev/input/event4", "TestMouse", 1, 1, &[BTN_SIDE]);
        let devices = MockDevices::new().with_device(dev.clone()).with_script(
            "/dev/input/event4",
            MockScript::new(vec![InputEvent::press(BTN_SIDE)], ScriptEnd::Disconnect),
        );
        let stop = StopSignal::new().unwrap();
        let mut stream = devices.open_monitor(&dev).unwrap();

        assert_eq!(
            stream.next_event(&stop).unwrap(),
            Some(InputEvent::press(BTN_SIDE))
        );
        assert!(matches!(
            stream.next_event(&stop),
            Err(EngineError::StreamReadError { .. })
        ));
        assert_eq!(devices.open_count(), 1);
    }

    #[test]
    fn test_stream_returns_none_once_stopped() {
        let dev = device("/dev/input/event4", "TestMouse", 1, 1, &[BTN_SIDE]);
        let devices = MockDevices::new().with_device(dev.clone()).with_script(
            "/dev/input/event4",
            MockScript::new(vec![InputEvent::press(BTN_SIDE)], ScriptEnd::BlockUntilStop),
        );
        let stop = StopSignal::new().unwrap();
        stop.request();
        let mut stream = devices.open_monitor(&dev).unwrap();
        assert_eq!(stream.next_event(&stop).unwrap(), None);
    }

    #[test]
    fn test_recording_sink_writes_sync_after_each_transition() {
        let mut provider = MockSinkProvider::new();
        let mut sink = provider.create("test", &BTreeSet::from([KEY_LEFTMETA])).unwrap();
        sink.send(KEY_LEFTMETA, 1).unwrap();

        let record = provider.snapshot();
        assert_eq!(
            record.events,
            vec![InputEvent::press(KEY_LEFTMETA), InputEvent::sync()]
        );
        assert_eq!(record.live(), 1);
        drop(sink);
        assert_eq!(provider.snapshot().live(), 0);
    }
}
