//! Hardware-dependent tests that require real input devices
//!
//! These tests are ignored by default and can be run with:
//! `sudo cargo test -- --ignored`
//!
//! They require:
//! - Read access to /dev/input/event*
//! - uinput module loaded (for the sink tests)
//! - A Logitech M720 (or any mouse with side buttons) for the locator test

use mousechord::config::Config;
use mousechord::input_backend::linux::{self, EvdevDevices, UinputSinks};
use mousechord::input_backend::{DeviceProvider, EventStream, KeySink, SinkProvider, StopSignal};
use mousechord::keys::*;
use mousechord::locator;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Enumeration finds readable event devices
#[test]
#[ignore]
fn test_real_enumeration() {
    let devices = EvdevDevices.enumerate();
    assert!(!devices.is_empty(), "No readable input devices (run as root?)");
    for dev in &devices {
        println!("{dev}");
    }
}

/// The built-in criteria find the M720 pointer interface
#[test]
#[ignore]
fn test_real_m720_is_located() {
    let config = Config::builtin().unwrap();
    let dev = locator::resolve(&EvdevDevices, &config.criteria)
        .expect("M720 not found. Connect it to run this test.");
    assert!(dev.supports(BTN_SIDE) || dev.supports(BTN_LEFT));
}

/// Opening in monitor mode and stopping a blocked reader
#[test]
#[ignore]
fn test_real_monitor_stream_stops_promptly() {
    let dev = EvdevDevices
        .enumerate()
        .into_iter()
        .find(|d| d.supports(BTN_LEFT))
        .expect("No pointing device found");
    let mut stream = EvdevDevices.open_monitor(&dev).unwrap();

    let stop = Arc::new(StopSignal::new().unwrap());
    let stopper = stop.clone();
    let timer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        stopper.request();
    });

    // Move the mouse or not; either way the loop must end after the stop.
    while let Ok(Some(_)) = stream.next_event(&stop) {}
    timer.join().unwrap();
    assert!(stop.is_requested());
}

/// The monitored device stays shared: another reader can open and even grab it
#[test]
#[ignore]
fn test_real_monitor_does_not_grab() {
    let dev = EvdevDevices
        .enumerate()
        .into_iter()
        .find(|d| d.supports(BTN_LEFT))
        .expect("No pointing device found");
    let _stream = EvdevDevices.open_monitor(&dev).unwrap();

    let mut other = evdev::Device::open(&dev.path).unwrap();
    linux::set_nonblocking(&other).unwrap();
    match other.fetch_events() {
        Ok(_) => {}
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock, "second reader failed: {e}"),
    }

    // EVIOCGRAB fails with EBUSY if the stream above held a grab.
    other.grab().unwrap();
    other.ungrab().unwrap();
}

/// Creating a virtual keyboard and sending a harmless key
#[test]
#[ignore]
fn test_real_uinput_sink() {
    assert!(
        std::path::Path::new("/dev/uinput").exists(),
        "/dev/uinput not found. Load the uinput module with: sudo modprobe uinput"
    );

    let f24 = parse("KEY_F24").unwrap();
    let keys: BTreeSet<u16> = [f24].into_iter().collect();
    let mut sink = UinputSinks.create("mousechord test keyboard", &keys).unwrap();
    sink.send(f24, 1).unwrap();
    sink.send(f24, 0).unwrap();
}
