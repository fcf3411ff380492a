//! Key and button names
//!
//! Maps the symbolic evdev names used in the config file (`KEY_LEFTMETA`,
//! `BTN_SIDE`, ...) to numeric codes and back. The name table is evdev's own
//! `Key` set, so every kernel key or button name is accepted.

use crate::error::ConfigError;
use evdev::Key;
use std::str::FromStr;

/// Highest valid key code (`KEY_MAX` in input-event-codes.h).
pub const KEY_MAX: u16 = 0x2ff;

pub const KEY_LEFTCTRL: u16 = Key::KEY_LEFTCTRL.0;
pub const KEY_LEFTSHIFT: u16 = Key::KEY_LEFTSHIFT.0;
pub const KEY_LEFTALT: u16 = Key::KEY_LEFTALT.0;
pub const KEY_TAB: u16 = Key::KEY_TAB.0;
pub const KEY_PAGEUP: u16 = Key::KEY_PAGEUP.0;
pub const KEY_PAGEDOWN: u16 = Key::KEY_PAGEDOWN.0;
pub const KEY_LEFTMETA: u16 = Key::KEY_LEFTMETA.0;

pub const BTN_LEFT: u16 = Key::BTN_LEFT.0;
pub const BTN_RIGHT: u16 = Key::BTN_RIGHT.0;
pub const BTN_MIDDLE: u16 = Key::BTN_MIDDLE.0;
pub const BTN_SIDE: u16 = Key::BTN_SIDE.0;
pub const BTN_EXTRA: u16 = Key::BTN_EXTRA.0;
pub const BTN_FORWARD: u16 = Key::BTN_FORWARD.0;
pub const BTN_BACK: u16 = Key::BTN_BACK.0;
pub const BTN_TASK: u16 = Key::BTN_TASK.0;

// Short forms people tend to write for modifiers.
const ALIASES: &[(&str, u16)] = &[
    ("META", KEY_LEFTMETA),
    ("SUPER", KEY_LEFTMETA),
    ("CTRL", KEY_LEFTCTRL),
    ("CONTROL", KEY_LEFTCTRL),
    ("ALT", KEY_LEFTALT),
    ("SHIFT", KEY_LEFTSHIFT),
];

/// Resolve a key name or numeric literal to a code.
///
/// Accepts evdev names case-insensitively (`KEY_PAGEUP`, `btn_side`), the
/// modifier aliases `META`/`SUPER`/`CTRL`/`ALT`/`SHIFT`, and decimal or
/// `0x`-prefixed hex codes.
pub fn parse(name: &str) -> Result<u16, ConfigError> {
    let trimmed = name.trim();
    if let Some(code) = parse_number(trimmed) {
        return check_code(code);
    }

    let upper = trimmed.to_ascii_uppercase();
    if let Some((_, code)) = ALIASES.iter().find(|(alias, _)| *alias == upper) {
        return Ok(*code);
    }
    Key::from_str(&upper)
        .map(|key| key.code())
        .map_err(|_| ConfigError::UnknownKey(trimmed.to_string()))
}

/// Validate a numeric code.
pub fn check_code(code: u32) -> Result<u16, ConfigError> {
    if code > KEY_MAX as u32 {
        return Err(ConfigError::CodeOutOfRange(code));
    }
    Ok(code as u16)
}

fn parse_number(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Canonical evdev name for a code, if evdev knows one.
pub fn name(code: u16) -> Option<String> {
    let name = format!("{:?}", Key::new(code));
    (name.starts_with("KEY_") || name.starts_with("BTN_")).then_some(name)
}

/// Name for logs and error messages; unknown codes render as `KEY_<code>`.
pub fn display(code: u16) -> String {
    name(code).unwrap_or_else(|| format!("KEY_{}", code))
}

/// Render a chord the way a user would type it, e.g. `KEY_LEFTMETA+KEY_PAGEUP`.
pub fn display_chord(codes: &[u16]) -> String {
    codes.iter().map(|c| display(*c)).collect::<Vec<_>>().join("+")
}

/// True for codes in the mouse/joystick button block (`BTN_MISC`..`BTN_GEAR_UP`).
pub fn is_button(code: u16) -> bool {
    (0x100..0x160).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(parse("KEY_LEFTMETA").unwrap(), 125);
        assert_eq!(parse("key_pagedown").unwrap(), 109);
        assert_eq!(parse("BTN_SIDE").unwrap(), 275);
        assert_eq!(parse(" BTN_EXTRA ").unwrap(), 276);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(parse("META").unwrap(), KEY_LEFTMETA);
        assert_eq!(parse("super").unwrap(), KEY_LEFTMETA);
        assert_eq!(parse("Ctrl").unwrap(), KEY_LEFTCTRL);
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse("275").unwrap(), BTN_SIDE);
        assert_eq!(parse("0x114").unwrap(), BTN_EXTRA);
    }

    #[test]
    fn test_parse_rejects_unknown_and_out_of_range() {
        assert!(matches!(parse("KEY_NOPE"), Err(ConfigError::UnknownKey(_))));
        assert!(matches!(parse("0x300"), Err(ConfigError::CodeOutOfRange(0x300))));
    }

    #[test]
    fn test_display() {
        assert_eq!(display(30), "KEY_A");
        assert_eq!(display(272), "BTN_LEFT");
        assert_eq!(display(999), "KEY_999");
        assert_eq!(
            display_chord(&[KEY_LEFTMETA, KEY_PAGEUP]),
            "KEY_LEFTMETA+KEY_PAGEUP"
        );
    }

    #[test]
    fn test_parse_accepts_any_evdev_name() {
        assert_eq!(parse("KEY_PROG1").unwrap(), Key::KEY_PROG1.0);
        assert_eq!(parse("btn_0").unwrap(), 0x100);
        assert_eq!(parse("KEY_F24").unwrap(), 194);
    }

    #[test]
    fn test_name_round_trips_through_parse() {
        for code in [KEY_LEFTMETA, KEY_PAGEUP, BTN_SIDE, BTN_EXTRA, Key::KEY_PROG1.0] {
            let canonical = name(code).unwrap();
            assert_eq!(parse(&canonical).unwrap(), code);
        }
        assert_eq!(name(KEY_MAX + 1), None);
    }

    #[test]
    fn test_is_button() {
        assert!(is_button(BTN_SIDE));
        assert!(!is_button(KEY_PAGEUP));
    }
}
