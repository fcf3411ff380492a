//! Error taxonomy for configuration loading and the event engine.
//!
//! Every fatal category maps to its own process exit status so a supervisor
//! can tell "device missing" from "permission problem" from "bad config".

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Exit status for a clean stop (signal, STOP command, device unplug).
pub const EXIT_OK: u8 = 0;
/// Anything without a dedicated category.
pub const EXIT_OTHER: u8 = 1;
/// sysexits `EX_NOINPUT`
pub const EXIT_STREAM_OPEN: u8 = 66;
/// sysexits `EX_UNAVAILABLE`
pub const EXIT_DEVICE_NOT_FOUND: u8 = 69;
/// sysexits `EX_CANTCREAT`
pub const EXIT_SINK_CREATION: u8 = 73;
/// sysexits `EX_CONFIG`
pub const EXIT_CONFIG: u8 = 78;

/// Problems found while loading or validating the configuration.
///
/// All of these are detected before the engine enters `Starting`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown key name {0:?}")]
    UnknownKey(String),

    #[error("key code {0} is out of range (max {max})", max = crate::keys::KEY_MAX)]
    CodeOutOfRange(u32),

    #[error("remap entry for {trigger} has an empty chord")]
    EmptyChord { trigger: String },

    #[error("remap entry for {trigger} lists {key} more than once")]
    RepeatedKey { trigger: String, key: String },

    #[error("duplicate remap trigger {0}")]
    DuplicateTrigger(String),

    #[error("remap table is empty")]
    EmptyTable,

    #[error("device criteria must name at least one vendor/product id, name substring or path")]
    NoCriteria,

    #[error("invalid log level {0:?} (expected error, warn, info, debug or trace)")]
    InvalidLogLevel(String),

    #[error("sink create_attempts must be at least 1")]
    NoSinkAttempts,
}

/// Engine failures, one variant per category the supervisor can observe.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no input device matched {criteria}")]
    DeviceNotFound { criteria: String },

    #[error("{count} devices matched and on_ambiguous = \"fail\": {candidates}")]
    AmbiguousDevice { count: usize, candidates: String },

    #[error("failed to create virtual output device after {attempts} attempt(s): {source}")]
    SinkCreationFailed {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("virtual output device already exists for this session")]
    SinkAlreadyCreated,

    #[error("failed to open {path:?} for monitoring: {reason}")]
    StreamOpenFailed {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("input stream ended: {reason}")]
    StreamReadError {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("chord for {trigger} failed at {failed_key} (left pressed: {left_pressed:?})")]
    EmitFailed {
        trigger: String,
        failed_key: String,
        left_pressed: Vec<String>,
        #[source]
        source: Option<io::Error>,
    },
}

impl EngineError {
    /// Short category tag used in log lines.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "ConfigError",
            EngineError::DeviceNotFound { .. } | EngineError::AmbiguousDevice { .. } => {
                "DeviceNotFound"
            }
            EngineError::SinkCreationFailed { .. } | EngineError::SinkAlreadyCreated => {
                "SinkCreationFailed"
            }
            EngineError::StreamOpenFailed { .. } => "StreamOpenFailed",
            EngineError::StreamReadError { .. } => "StreamReadError",
            EngineError::EmitFailed { .. } => "EmitFailed",
        }
    }

    /// Process exit status for this error when it terminates the process.
    ///
    /// `StreamReadError` is a clean shutdown path and maps to success.
    pub fn exit_code(&self) -> u8 {
        match self {
            EngineError::Config(_) => EXIT_CONFIG,
            EngineError::DeviceNotFound { .. } | EngineError::AmbiguousDevice { .. } => {
                EXIT_DEVICE_NOT_FOUND
            }
            EngineError::SinkCreationFailed { .. } | EngineError::SinkAlreadyCreated => {
                EXIT_SINK_CREATION
            }
            EngineError::StreamOpenFailed { .. } => EXIT_STREAM_OPEN,
            EngineError::StreamReadError { .. } => EXIT_OK,
            EngineError::EmitFailed { .. } => EXIT_OTHER,
        }
    }
}
