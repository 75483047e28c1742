use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Why an occasion was skipped. Skipping is never fatal; the engine logs and moves on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OccasionError {
    #[error("activation for unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("required channel `{0}` missing from activation map")]
    MissingChannel(String),
    #[error("channel `{channel}` strength {value} outside [0, 1]")]
    StrengthOutOfRange { channel: String, value: f64 },
    #[error("outcome quality {0} outside [0, 1]")]
    OutcomeOutOfRange(f64),
    #[error("anchor `{anchor}` references unknown channel `{channel}`")]
    UnknownAnchorChannel { anchor: String, channel: String },
    /// Tag content is deliberately not echoed: a malformed tag may be free text.
    #[error("categorical tag is not a short lowercase token")]
    MalformedTag,
}

impl OccasionError {
    /// Content-free label for telemetry.
    pub fn kind(&self) -> SkipReason {
        match self {
            OccasionError::UnknownChannel(_) | OccasionError::UnknownAnchorChannel { .. } => SkipReason::UnknownChannel,
            OccasionError::MissingChannel(_) => SkipReason::MissingChannel,
            OccasionError::StrengthOutOfRange { .. } | OccasionError::OutcomeOutOfRange(_) => SkipReason::OutOfRange,
            OccasionError::MalformedTag => SkipReason::MalformedTag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SkipReason {
    UnknownChannel,
    MissingChannel,
    OutOfRange,
    MalformedTag,
}

/// Persistence failures. `Timeout` and `Io` are retried; `Exhausted` is what reaches the operator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("snapshot rejected: {0}")]
    Rejected(String),
    #[error("{0} was unreadable at open and could not be moved aside; refusing to overwrite it")]
    Held(PathBuf),
    #[error("persistence failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
