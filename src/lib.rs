//! mousechord - turn extra mouse buttons into key chords
//!
//! Watches one pointing device without grabbing it, and for each mapped
//! button press injects a modifier+key chord through a uinput keyboard.
//! Clicks, motion and scrolling are never touched.

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod event;
pub mod input_backend;
pub mod keys;
pub mod locator;
pub mod remap;
pub mod sink;
