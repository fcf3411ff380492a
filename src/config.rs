//! Configuration file
//!
//! TOML, looked up in this order:
//!
//! 1. `--config <path>`
//! 2. `$MOUSECHORD_CONFIG`
//! 3. `~/.config/mousechord/config.toml`
//! 4. `/etc/mousechord/config.toml`
//!
//! With no file at all the built-in M720 setup is used.
//!
//! ```toml
//! [device]
//! ids = [{ vendor = 0x046d, product = 0xb015 }]
//! name_contains = ["M720"]
//! required_codes = ["BTN_SIDE", "BTN_EXTRA"]
//! on_ambiguous = "first"
//!
//! [[remap]]
//! trigger = "BTN_SIDE"
//! chord = ["KEY_LEFTMETA", "KEY_PAGEDOWN"]
//! ```

use crate::error::ConfigError;
use crate::keys::{self, *};
use crate::locator::{AmbiguityPolicy, DeviceCriteria, UsbId};
use crate::remap::{RemapEntry, RemapTable};
use crate::sink::{DEFAULT_SINK_NAME, SinkSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "MOUSECHORD_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/mousechord/config.toml";

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// A key written either by name (`"KEY_PAGEUP"`, `"super"`) or by code (`104`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Code(u32),
    Name(String),
}

impl KeySpec {
    pub fn resolve(&self) -> Result<u16, ConfigError> {
        match self {
            KeySpec::Code(code) => keys::check_code(*code),
            KeySpec::Name(name) => keys::parse(name),
        }
    }
}

impl From<u16> for KeySpec {
    fn from(code: u16) -> Self {
        match keys::name(code) {
            Some(name) => KeySpec::Name(name),
            None => KeySpec::Code(code as u32),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceSection {
    #[serde(default)]
    pub ids: Vec<UsbId>,
    #[serde(default)]
    pub name_contains: Vec<String>,
    #[serde(default)]
    pub required_codes: Vec<KeySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub on_ambiguous: AmbiguityPolicy,
}

impl Default for DeviceSection {
    /// Logitech M720 Triathlon (USB receiver, Bluetooth and Unifying ids).
    fn default() -> Self {
        Self {
            ids: [0x405e, 0xb015, 0xb013]
                .into_iter()
                .map(|product| UsbId {
                    vendor: 0x046d,
                    product,
                })
                .collect(),
            name_contains: vec!["M720".to_string(), "Logitech".to_string()],
            required_codes: vec![BTN_SIDE.into(), BTN_EXTRA.into()],
            path: None,
            on_ambiguous: AmbiguityPolicy::First,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemapSection {
    pub trigger: KeySpec,
    pub chord: Vec<KeySpec>,
}

fn default_remaps() -> Vec<RemapSection> {
    let entry = |trigger: u16, chord: &[u16]| RemapSection {
        trigger: trigger.into(),
        chord: chord.iter().map(|k| KeySpec::from(*k)).collect(),
    };
    // Back/forward buttons switch workspace down/up.
    vec![
        entry(BTN_SIDE, &[KEY_LEFTMETA, KEY_PAGEDOWN]),
        entry(BTN_EXTRA, &[KEY_LEFTMETA, KEY_PAGEUP]),
        entry(BTN_BACK, &[KEY_LEFTMETA, KEY_PAGEDOWN]),
        entry(BTN_FORWARD, &[KEY_LEFTMETA, KEY_PAGEUP]),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkSection {
    pub name: String,
    pub create_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self {
            name: DEFAULT_SINK_NAME.to_string(),
            create_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: String,
    /// Log every emitted chord at info instead of debug.
    pub log_dispatch: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dispatch: false,
        }
    }
}

/// On-disk layout. A missing `[device]` section or missing `[[remap]]`
/// entries fall back to the built-in M720 setup; a present section is taken
/// as written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remap: Option<Vec<RemapSection>>,
    #[serde(default)]
    pub sink: SinkSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConfigFile {
    /// The built-in configuration written out in full.
    pub fn builtin() -> Self {
        Self {
            device: Some(DeviceSection::default()),
            remap: Some(default_remaps()),
            sink: SinkSection::default(),
            logging: LoggingSection::default(),
        }
    }

    pub fn validate(self) -> Result<Config, ConfigError> {
        let device = self.device.unwrap_or_default();
        let criteria = DeviceCriteria {
            path: device.path,
            ids: device.ids,
            name_contains: device.name_contains,
            required_codes: device
                .required_codes
                .iter()
                .map(KeySpec::resolve)
                .collect::<Result<_, _>>()?,
            on_ambiguous: device.on_ambiguous,
        };
        if criteria.is_empty() {
            return Err(ConfigError::NoCriteria);
        }

        let mut entries = Vec::new();
        for row in self.remap.unwrap_or_else(default_remaps) {
            let trigger = row.trigger.resolve()?;
            let chord = row
                .chord
                .iter()
                .map(KeySpec::resolve)
                .collect::<Result<Vec<_>, _>>()?;
            entries.push(RemapEntry::new(trigger, chord));
        }
        let table = RemapTable::new(entries)?;

        if self.sink.create_attempts == 0 {
            return Err(ConfigError::NoSinkAttempts);
        }
        let sink = SinkSettings {
            name: self.sink.name,
            create_attempts: self.sink.create_attempts,
            retry_backoff: Duration::from_millis(self.sink.retry_backoff_ms),
        };

        let level = self.logging.level.trim().to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level));
        }

        Ok(Config {
            criteria,
            table,
            sink,
            logging: LoggingSettings {
                level,
                log_dispatch: self.logging.log_dispatch,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    pub log_dispatch: bool,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub criteria: DeviceCriteria,
    pub table: RemapTable,
    pub sink: SinkSettings,
    pub logging: LoggingSettings,
}

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Builtin,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Builtin => f.write_str("built-in defaults"),
        }
    }
}

impl ConfigSource {
    /// Startup log line for where the configuration came from.
    pub fn log_line(&self) -> String {
        match self {
            ConfigSource::File(path) => format!("Loaded config from {:?}", path),
            ConfigSource::Builtin => "No config file found, using built-in defaults".to_string(),
        }
    }
}

impl Config {
    pub fn builtin() -> Result<Self, ConfigError> {
        ConfigFile::builtin().validate()
    }

    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        file.validate()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Resolve and load the configuration. An explicitly named file (flag or
    /// environment) must exist; the standard locations are optional.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, ConfigSource), ConfigError> {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = named {
            let config = Self::from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        for path in standard_paths() {
            if path.exists() {
                let config = Self::from_file(&path)?;
                    return Ok((config, ConfigSource::File(path)));
            }
        }

        Ok((Self::builtin()?, ConfigSource::Builtin))
    }
}

fn standard_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("mousechord").join("config.toml"));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG));
    paths
}
