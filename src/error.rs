use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount {0:?}: expected a non-negative decimal integer")]
    Invalid(String),
    #[error("amount {0:?} does not fit a 256-bit decimal")]
    OutOfRange(String),
    #[error("token precision {0} exceeds the supported maximum")]
    Precision(u32),
}

/// Failure to fetch a transfer window. Never fatal; adapters degrade it to
/// an empty batch.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("no transfers reported")]
    NoData,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("state file {path:?} is not a valid state document: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("telegram request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("telegram returned HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("telegram rejected the message: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("required settings are not set: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}
