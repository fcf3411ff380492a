//! Virtual Output Sink
//!
//! Owns the synthesized keyboard that chords are injected through. One sink
//! per session, exposing exactly the keys the remap table can emit.

use crate::error::EngineError;
use crate::event::{PRESS, RELEASE};
use crate::input_backend::{KeySink, SinkProvider};
use crate::keys;
use crate::remap::Chord;
use std::collections::BTreeSet;
use std::io;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SINK_NAME: &str = "mousechord virtual keyboard";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    pub name: String,
    /// Total creation attempts, including the first.
    pub create_attempts: u32,
    /// Delay before the second attempt; doubled for each later one.
    pub retry_backoff: Duration,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_SINK_NAME.to_string(),
            create_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

pub struct OutputSink<S: KeySink> {
    device: Option<S>,
    declared: BTreeSet<u16>,
    name: String,
}

impl<S: KeySink> OutputSink<S> {
    /// Register the virtual device, retrying transient failures with
    /// exponential backoff. A permission error is not retried.
    pub fn create<O>(
        provider: &mut O,
        settings: &SinkSettings,
        declared: BTreeSet<u16>,
    ) -> Result<Self, EngineError>
    where
        O: SinkProvider<Sink = S>,
    {
        let attempts = settings.create_attempts.max(1);
        let mut backoff = settings.retry_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match provider.create(&settings.name, &declared) {
                Ok(device) => {
                    info!(
                        "Created virtual device '{}' with keys [{}]",
                        settings.name,
                        declared
                            .iter()
                            .map(|k| keys::display(*k))
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                    return Ok(Self {
                        device: Some(device),
                        declared,
                        name: settings.name.clone(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied || attempt >= attempts => {
                    return Err(EngineError::SinkCreationFailed {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        "Virtual device creation failed (attempt {attempt}/{attempts}): {e}; retrying in {:?}",
                        backoff
                    );
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Emit `chord` for `trigger`: press every key in order, then release in
    /// reverse, one synchronized transition at a time.
    ///
    /// If a press fails the keys already pressed are released again (reverse
    /// order) before the error is returned. If a release fails the remaining
    /// releases are still attempted. Either way the error lists whatever is
    /// still held down.
    pub fn emit(&mut self, trigger: u16, chord: &Chord) -> Result<(), EngineError> {
        let trigger_name = keys::display(trigger);

        if let Some(undeclared) = chord.press_order().find(|k| !self.declared.contains(k)) {
            return Err(EngineError::EmitFailed {
                trigger: trigger_name,
                failed_key: keys::display(undeclared),
                left_pressed: Vec::new(),
                source: None,
            });
        }

        let Some(device) = self.device.as_mut() else {
            return Err(EngineError::EmitFailed {
                trigger: trigger_name,
                failed_key: chord.press_order().next().map(keys::display).unwrap_or_default(),
                left_pressed: Vec::new(),
                source: None,
            });
        };

        let mut pressed = Vec::with_capacity(chord.len());
        for key in chord.press_order() {
            if let Err(e) = device.send(key, PRESS) {
                error!("Press of {} failed mid-chord: {e}", keys::display(key));
                let stuck = release_reverse(device, &pressed);
                return Err(EngineError::EmitFailed {
                    trigger: trigger_name,
                    failed_key: keys::display(key),
                    left_pressed: stuck.iter().map(|k| keys::display(*k)).collect(),
                    source: Some(e),
                });
            }
            pressed.push(key);
        }

        let mut first_failure: Option<(u16, io::Error)> = None;
        let mut stuck = Vec::new();
        for key in chord.release_order() {
            if let Err(e) = device.send(key, RELEASE) {
                error!("Release of {} failed: {e}", keys::display(key));
                stuck.push(key);
                if first_failure.is_none() {
                    first_failure = Some((key, e));
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some((key, e)) => Err(EngineError::EmitFailed {
                trigger: trigger_name,
                failed_key: keys::display(key),
                left_pressed: stuck.iter().map(|k| keys::display(*k)).collect(),
                source: Some(e),
            }),
        }
    }

    /// Revoke the virtual device. Returns whether anything was destroyed;
    /// repeated calls are no-ops.
    pub fn destroy(&mut self) -> bool {
        match self.device.take() {
            Some(device) => {
                drop(device);
                info!("Destroyed virtual device '{}'", self.name);
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.device.is_some()
    }

    pub fn declared_keys(&self) -> &BTreeSet<u16> {
        &self.declared
    }
}

impl<S: KeySink> Drop for OutputSink<S> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Release `pressed` in reverse order, returning the keys whose release failed.
fn release_reverse<S: KeySink>(device: &mut S, pressed: &[u16]) -> Vec<u16> {
    let mut stuck = Vec::new();
    for key in pressed.iter().rev().copied() {
        match device.send(key, RELEASE) {
            Ok(()) => debug!("Compensating release of {}", keys::display(key)),
            Err(e) => {
                error!("Compensating release of {} failed: {e}", keys::display(key));
                stuck.push(key);
            }
        }
    }
    stuck
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_backend::mock::MockSinkProvider;
    use crate::keys::*;

    fn settings() -> SinkSettings {
        SinkSettings {
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn declared() -> BTreeSet<u16> {
        [KEY_LEFTMETA, KEY_PAGEUP, KEY_PAGEDOWN].into_iter().collect()
    }

    #[test]
    fn test_chord_presses_in_order_and_releases_in_reverse() {
        let mut provider = MockSinkProvider::new();
        let mut sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();
        sink.emit(BTN_SIDE, &Chord::new(vec![KEY_LEFTMETA, KEY_PAGEDOWN]))
            .unwrap();

        assert_eq!(
            provider.snapshot().transitions(),
            vec![
                (KEY_LEFTMETA, 1),
                (KEY_PAGEDOWN, 1),
                (KEY_PAGEDOWN, 0),
                (KEY_LEFTMETA, 0),
            ]
        );
    }

    #[test]
    fn test_declares_exactly_the_table_keys() {
        let mut provider = MockSinkProvider::new();
        let sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();
        assert_eq!(sink.declared_keys(), &declared());
        assert_eq!(provider.snapshot().declared, declared());
    }

    #[test]
    fn test_transient_creation_failures_are_retried() {
        let mut provider = MockSinkProvider::new().failing_first(2);
        let sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();
        assert!(sink.is_live());
        assert_eq!(provider.snapshot().attempts, 3);
    }

    #[test]
    fn test_creation_gives_up_after_bounded_attempts() {
        let mut provider = MockSinkProvider::new().failing_first(10);
        match OutputSink::create(&mut provider, &settings(), declared()) {
            Err(EngineError::SinkCreationFailed { attempts, .. }) => assert_eq!(attempts, 3),
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_permission_denied_is_not_retried() {
        let mut provider = MockSinkProvider::new().denied();
        assert!(matches!(
            OutputSink::create(&mut provider, &settings(), declared()),
            Err(EngineError::SinkCreationFailed { attempts: 1, .. })
        ));
        assert_eq!(provider.snapshot().attempts, 1);
    }

    #[test]
    fn test_failed_press_releases_what_was_pressed() {
        let mut provider = MockSinkProvider::new().failing_on(KEY_PAGEDOWN, 1);
        let mut sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();

        let err = sink
            .emit(BTN_SIDE, &Chord::new(vec![KEY_LEFTMETA, KEY_PAGEDOWN]))
            .unwrap_err();
        match err {
            EngineError::EmitFailed {
                failed_key,
                left_pressed,
                ..
            } => {
                assert_eq!(failed_key, "KEY_PAGEDOWN");
                assert!(left_pressed.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            provider.snapshot().transitions(),
            vec![(KEY_LEFTMETA, 1), (KEY_LEFTMETA, 0)]
        );
    }

    #[test]
    fn test_failed_release_still_releases_the_rest() {
        let mut provider = MockSinkProvider::new().failing_on(KEY_PAGEUP, 0);
        let mut sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();

        let err = sink
            .emit(BTN_EXTRA, &Chord::new(vec![KEY_LEFTMETA, KEY_PAGEUP]))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::EmitFailed { ref left_pressed, .. } if left_pressed == &["KEY_PAGEUP".to_string()]
        ));
        assert_eq!(
            provider.snapshot().transitions(),
            vec![(KEY_LEFTMETA, 1), (KEY_PAGEUP, 1), (KEY_LEFTMETA, 0)]
        );
    }

    #[test]
    fn test_undeclared_key_rejected_before_any_output() {
        let mut provider = MockSinkProvider::new();
        let mut sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();
        assert!(sink.emit(BTN_SIDE, &Chord::new(vec![KEY_LEFTALT, KEY_TAB])).is_err());
        assert!(provider.snapshot().transitions().is_empty());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut provider = MockSinkProvider::new();
        let mut sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();

        assert!(sink.destroy());
        assert!(!sink.destroy());
        drop(sink);
        assert_eq!(provider.snapshot().destroyed, 1);
    }

    #[test]
    fn test_emit_after_destroy_fails_without_output() {
        let mut provider = MockSinkProvider::new();
        let mut sink = OutputSink::create(&mut provider, &settings(), declared()).unwrap();
        sink.destroy();
        assert!(sink.emit(BTN_SIDE, &Chord::new(vec![KEY_LEFTMETA, KEY_PAGEDOWN])).is_err());
        assert!(provider.snapshot().transitions().is_empty());
    }
}
