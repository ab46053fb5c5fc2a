//! Error types for the proxy-link-pool crate.

use thiserror::Error;

/// Error returned when no healthy proxy is available in the pool.
#[derive(Debug, Error)]
#[error("No proxy available in pool")]
pub struct NoProxyAvailable;

/// Reason a candidate link could not be turned into a probable endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The link does not start with `scheme://`.
    #[error("link has no scheme separator")]
    MissingScheme,
    /// The scheme is not one we recognize.
    #[error("unsupported scheme `{0}`")]
    UnknownScheme(String),
    /// The URI itself is malformed.
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    /// The vmess payload is not valid base64 or not UTF-8 once decoded.
    #[error("payload is not valid base64")]
    InvalidBase64,
    /// The vmess payload decoded but is not a JSON object.
    #[error("payload is not valid json: {0}")]
    InvalidJson(String),
    /// No host could be found.
    #[error("missing host")]
    MissingHost,
    /// No port could be found, or it is out of range.
    #[error("missing or invalid port")]
    MissingPort,
}

/// Errors raised while fetching from an upstream source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error fetching {0}: {1}")]
    Http(String, #[source] reqwest::Error),
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("invalid json from {0}: {1}")]
    Json(String, #[source] serde_json::Error),
}

/// Classification of a failed probe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The link could not be parsed into host and port.
    #[error("unprobable link: {0}")]
    Unparsable(#[from] ParseError),
    /// The TCP connect did not finish in time.
    #[error("tcp connect timed out")]
    Timeout,
    /// The probe was abandoned because the batch was cancelled.
    #[error("probe cancelled")]
    Cancelled,
    /// The TCP connect was refused or otherwise failed.
    #[error("tcp connect failed: {0}")]
    Connect(String),
    /// The probe task itself died.
    #[error("probe task failed: {0}")]
    Task(String),
}

/// Errors raised by a [`LinkStore`](crate::store::LinkStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write failed for {hash}: {reason}")]
    Write { hash: String, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised while reading or writing run artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unrecognized artifact layout in {0}")]
    Layout(String),
}

/// Errors raised while building configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
    #[error("unknown target protocol `{0}`")]
    UnknownProtocol(String),
}
