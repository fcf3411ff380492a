//! evdev/uinput backend.
//!
//! Devices are opened without `EVIOCGRAB`, so every event keeps flowing to
//! the compositor and any other reader. The fd is switched to non-blocking
//! and reads are gated on `poll(2)` over the device and the stop pipe.

use super::{DeviceProvider, EventStream, KeySink, SinkProvider, StopSignal};
use crate::error::EngineError;
use crate::event::InputEvent;
use crate::locator::PhysicalDevice;
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, Device, EventType, Key};
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// All `/dev/input/event*` nodes, through `evdev::enumerate`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvdevDevices;

impl DeviceProvider for EvdevDevices {
    type Stream = EvdevStream;

    fn enumerate(&self) -> Vec<PhysicalDevice> {
        let mut found: Vec<(PathBuf, Device)> = evdev::enumerate().collect();
        found.sort_by_key(|(path, _)| (event_number(path), path.clone()));

        // Each Device handle is dropped (closed) as soon as it is described.
        found
            .into_iter()
            .map(|(path, dev)| describe(path, &dev))
            .collect()
    }

    fn open_monitor(&self, device: &PhysicalDevice) -> Result<EvdevStream, EngineError> {
        let open_failed = |reason: String, source: Option<io::Error>| EngineError::StreamOpenFailed {
            path: device.path.clone(),
            reason,
            source,
        };

        let dev = Device::open(&device.path).map_err(|e| open_failed(e.to_string(), Some(e)))?;

        // The node may have been reassigned between enumeration and open.
        let name = dev.name().unwrap_or_default();
        if name != device.name {
            return Err(open_failed(
                format!("node now belongs to '{}' instead of '{}'", name, device.name),
                None,
            ));
        }

        set_nonblocking(&dev).map_err(|e| open_failed(format!("fcntl O_NONBLOCK: {e}"), Some(e)))?;

        info!("Monitoring {} (shared, not grabbed)", device);
        Ok(EvdevStream {
            device: dev,
            pending: VecDeque::new(),
        })
    }
}

/// Snapshot the identity and key capabilities of an open device.
pub fn describe(path: PathBuf, dev: &Device) -> PhysicalDevice {
    let id = dev.input_id();
    PhysicalDevice {
        path,
        name: dev.name().unwrap_or_default().to_string(),
        vendor: id.vendor(),
        product: id.product(),
        keys: dev
            .supported_keys()
            .map(|keys| keys.iter().map(|k| k.code()).collect())
            .unwrap_or_default(),
    }
}

fn event_number(path: &Path) -> u32 {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("event"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

pub fn set_nonblocking(dev: &Device) -> io::Result<()> {
    let raw_fd = dev.as_raw_fd();

    let current = unsafe { libc::fcntl(raw_fd, libc::F_GETFL) };
    if current < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(raw_fd, libc::F_SETFL, current | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub struct EvdevStream {
    device: Device,
    pending: VecDeque<InputEvent>,
}

impl EvdevStream {
    /// Block until the device is readable or the stop pipe fires.
    fn wait_readable(&self, stop: &StopSignal) -> Result<(), EngineError> {
        let mut fds = [
            libc::pollfd {
                fd: self.device.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: stop.wake_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(read_error(err));
        }

        let revents = fds[0].revents;
        let hangup = revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
        // Drain whatever is still buffered before reporting the hangup.
        if hangup && revents & libc::POLLIN == 0 {
            return Err(EngineError::StreamReadError {
                reason: "device disconnected".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

impl EventStream for EvdevStream {
    fn next_event(&mut self, stop: &StopSignal) -> Result<Option<InputEvent>, EngineError> {
        loop {
            if stop.is_requested() {
                return Ok(None);
            }
            if let Some(ev) = self.pending.pop_front() {
                return Ok(Some(ev));
            }

            match self.device.fetch_events() {
                Ok(events) => {
                    self.pending.extend(events.map(InputEvent::from));
                    if !self.pending.is_empty() {
                        continue;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(read_error(e)),
            }

            self.wait_readable(stop)?;
        }
    }
}

fn read_error(e: io::Error) -> EngineError {
    let reason = if e.raw_os_error() == Some(libc::ENODEV) {
        "device disconnected".to_string()
    } else {
        format!("read failed: {e}")
    };
    EngineError::StreamReadError {
        reason,
        source: Some(e),
    }
}

/// Creates virtual keyboards through `/dev/uinput`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UinputSinks;

impl SinkProvider for UinputSinks {
    type Sink = UinputSink;

    fn create(&mut self, name: &str, keys: &BTreeSet<u16>) -> io::Result<UinputSink> {
        let mut set = AttributeSet::<Key>::new();
        for code in keys {
            set.insert(Key::new(*code));
        }

        let device = VirtualDeviceBuilder::new()?
            .name(name)
            .with_keys(&set)?
            .build()?;
        debug!("uinput device '{}' registered", name);
        Ok(UinputSink { device })
    }
}

pub struct UinputSink {
    device: VirtualDevice,
}

impl KeySink for UinputSink {
    fn send(&mut self, code: u16, value: i32) -> io::Result<()> {
        // VirtualDevice::emit appends the SYN_REPORT itself.
        self.device
            .emit(&[evdev::InputEvent::new(EventType::KEY, code, value)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_number_orders_numerically() {
        let mut paths = vec![
            PathBuf::from("/dev/input/event10"),
            PathBuf::from("/dev/input/event2"),
            PathBuf::from("/dev/input/mouse0"),
            PathBuf::from("/dev/input/event0"),
        ];
        paths.sort_by_key(|p| (event_number(p), p.clone()));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/dev/input/event0"),
                PathBuf::from("/dev/input/event2"),
                PathBuf::from("/dev/input/event10"),
                PathBuf::from("/dev/input/mouse0"),
            ]
        );
    }

    #[test]
    fn test_read_error_names_disconnect() {
        let err = read_error(io::Error::from_raw_os_error(libc::ENODEV));
        assert!(matches!(err, EngineError::StreamReadError { ref reason, .. } if reason == "device disconnected"));
    }
}
