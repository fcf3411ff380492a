//! Input Backend Abstraction
//!
//! The engine depends on exactly two privileged OS capabilities:
//!
//! - `DeviceProvider`: enumerate input devices and open one in monitor
//!   (non-exclusive) mode
//! - `SinkProvider`: create a virtual keyboard and inject key transitions
//!
//! `linux` implements them over evdev/uinput. `mock` implements them with
//! synthetic devices and a recording sink for tests.

pub mod linux;
pub mod mock;

use crate::error::EngineError;
use crate::event::InputEvent;
use crate::locator::PhysicalDevice;
use std::collections::BTreeSet;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Source of physical input devices.
pub trait DeviceProvider {
    type Stream: EventStream;

    /// List the devices currently present, in a stable enumeration order.
    ///
    /// Any handle opened to query capabilities must be closed before this
    /// returns.
    fn enumerate(&self) -> Vec<PhysicalDevice>;

    /// Open `device` for monitoring. Implementations must never take an
    /// exclusive grab: every other consumer keeps receiving its events.
    fn open_monitor(&self, device: &PhysicalDevice) -> Result<Self::Stream, EngineError>;
}

/// Blocking reader over one device's event stream.
pub trait EventStream {
    /// Block until the next event arrives.
    ///
    /// Returns `Ok(None)` as soon as `stop` is requested, even while blocked.
    /// End of stream (unplug, read error) is `Err(StreamReadError)`.
    fn next_event(&mut self, stop: &StopSignal) -> Result<Option<InputEvent>, EngineError>;
}

/// Factory for virtual keyboards.
pub trait SinkProvider {
    type Sink: KeySink;

    /// Register a virtual device exposing exactly `keys`.
    fn create(&mut self, name: &str, keys: &BTreeSet<u16>) -> io::Result<Self::Sink>;
}

/// A live virtual keyboard. Dropping it revokes the device.
pub trait KeySink {
    /// Write one key transition followed by a SYN_REPORT.
    fn send(&mut self, code: u16, value: i32) -> io::Result<()>;
}

/// Cross-thread stop request that can wake a blocked reader.
///
/// Backed by a pipe: `request` writes one byte and never drains it, so the
/// read end stays readable and every `poll` over it returns immediately from
/// then on.
pub struct StopSignal {
    requested: AtomicBool,
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl StopSignal {
    pub fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self {
            requested: AtomicBool::new(false),
            read_end,
            write_end,
        })
    }

    /// Ask every reader to stop. Safe to call from any thread, any number of times.
    pub fn request(&self) {
        if self.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let byte = 1u8;
        let rc = unsafe {
            libc::write(
                self.write_end.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if rc < 0 {
            // The flag is already set; readers re-check it before every poll.
            tracing::warn!("stop signal wake write failed: {}", io::Error::last_os_error());
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Descriptor that becomes readable once a stop is requested.
    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.read_end.as_fd()
    }

    /// Block until a stop is requested or `timeout` elapses (`None` waits forever).
    /// Returns whether a stop was requested.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let timeout_ms = timeout
            .map(|t| t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);
        let mut fds = [libc::pollfd {
            fd: self.read_end.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        while !self.is_requested() {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
            if rc == 0 {
                break;
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::warn!("stop signal poll failed: {err}");
                break;
            }
        }
        self.is_requested()
    }
}
