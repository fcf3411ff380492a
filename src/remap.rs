//! Remap table: trigger button -> key chord
//!
//! Built once from configuration and shared read-only with the engine.
//! Classification only looks at press transitions; releases and autorepeat
//! never fire a chord.

use crate::error::ConfigError;
use crate::event::InputEvent;
use crate::keys;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Ordered keys pressed in order and released in reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord(Vec<u16>);

impl Chord {
    pub fn new(keys: Vec<u16>) -> Self {
        Self(keys)
    }

    pub fn keys(&self) -> &[u16] {
        &self.0
    }

    pub fn press_order(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    pub fn release_order(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().rev().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&keys::display_chord(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapEntry {
    pub trigger: u16,
    pub chord: Chord,
}

impl RemapEntry {
    pub fn new(trigger: u16, chord: Vec<u16>) -> Self {
        Self {
            trigger,
            chord: Chord::new(chord),
        }
    }
}

/// Immutable trigger -> chord mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapTable {
    entries: BTreeMap<u16, Chord>,
}

impl RemapTable {
    /// Build a table, rejecting duplicate triggers, empty chords and chords
    /// that list the same key twice. Nothing is deduplicated silently.
    pub fn new(entries: Vec<RemapEntry>) -> Result<Self, ConfigError> {
        if entries.is_empty() {
            return Err(ConfigError::EmptyTable);
        }

        let mut map = BTreeMap::new();
        for entry in entries {
            let trigger = keys::display(entry.trigger);
            if entry.chord.is_empty() {
                return Err(ConfigError::EmptyChord { trigger });
            }

            let mut seen = BTreeSet::new();
            for key in entry.chord.press_order() {
                if !seen.insert(key) {
                    return Err(ConfigError::RepeatedKey {
                        trigger,
                        key: keys::display(key),
                    });
                }
            }

            if map.insert(entry.trigger, entry.chord).is_some() {
                return Err(ConfigError::DuplicateTrigger(trigger));
            }
        }

        Ok(Self { entries: map })
    }

    pub fn lookup(&self, trigger: u16) -> Option<&Chord> {
        self.entries.get(&trigger)
    }

    /// The chord to emit for this event, if any.
    ///
    /// Returns `None` for anything that is not a key press, and for presses
    /// of codes the table does not mention.
    pub fn classify(&self, event: &InputEvent) -> Option<&Chord> {
        if !event.is_press() {
            return None;
        }
        self.lookup(event.code)
    }

    /// Every key that appears in some chord: the sink's capability set.
    pub fn declared_keys(&self) -> BTreeSet<u16> {
        self.entries
            .values()
            .flat_map(|chord| chord.press_order())
            .collect()
    }

    pub fn triggers(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (u16, &Chord)> + '_ {
        self.entries.iter().map(|(t, c)| (*t, c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
