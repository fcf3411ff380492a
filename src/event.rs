//! Input events as seen by the classifier.
//!
//! A backend-neutral copy of the kernel's `input_event` (type, code, value).
//! Events are transient: produced by the stream, classified, then dropped.

/// Key/button press.
pub const PRESS: i32 = 1;
/// Key/button release.
pub const RELEASE: i32 = 0;
/// Autorepeat while held.
pub const REPEAT: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `EV_KEY`: keys and mouse buttons
    Key,
    /// `EV_REL`: motion and wheel deltas
    Relative,
    /// `EV_SYN`
    Sync,
    /// Anything else, with the raw event type.
    Other(u16),
}

impl EventKind {
    pub fn from_type(event_type: u16) -> Self {
        match event_type {
            0x00 => EventKind::Sync,
            0x01 => EventKind::Key,
            0x02 => EventKind::Relative,
            other => EventKind::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub kind: EventKind,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn new(kind: EventKind, code: u16, value: i32) -> Self {
        Self { kind, code, value }
    }

    pub fn press(code: u16) -> Self {
        Self::new(EventKind::Key, code, PRESS)
    }

    pub fn release(code: u16) -> Self {
        Self::new(EventKind::Key, code, RELEASE)
    }

    pub fn repeat(code: u16) -> Self {
        Self::new(EventKind::Key, code, REPEAT)
    }

    pub fn motion(code: u16, delta: i32) -> Self {
        Self::new(EventKind::Relative, code, delta)
    }

    pub fn sync() -> Self {
        Self::new(EventKind::Sync, 0, 0)
    }

    /// Only the press transition of a key/button can trigger a chord.
    pub fn is_press(&self) -> bool {
        self.kind == EventKind::Key && self.value == PRESS
    }
}

impl From<evdev::InputEvent> for InputEvent {
    fn from(ev: evdev::InputEvent) -> Self {
        Self {
            kind: EventKind::from_type(ev.event_type().0),
            code: ev.code(),
            value: ev.value(),
        }
    }
}
