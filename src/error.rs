use std::{fmt, io};

use http::status::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use thiserror::Error;
use url::ParseError as UrlParseError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum SweepersError {
    /// Connection refused, DNS failure or rejected credentials. Fatal to the run.
    #[error("Store connectivity error: {0}")]
    Connectivity(String),
    /// 5xx, 429 or a timeout. Retried under the active [crate::retry::RetryPolicy].
    #[error("Transient store error: {0}")]
    Transient(String),
    /// A page or bulk response that could not be decoded.
    #[error("Malformed store response: {0}")]
    MalformedResponse(String),
    #[error("Malformed document data: {0}")]
    DataShape(String),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Run cancelled")]
    OperationCancelled,
}

impl SweepersError {
    /// Whether the shared retry policy should attempt the failed call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SweepersError::Transient(_) | SweepersError::MalformedResponse(_)
        )
    }

    /// Classify a non-success HTTP status returned by the store.
    pub fn from_status(status: StatusCode, body: &str) -> SweepersError {
        let msg = format!("HTTP {status}: {body}");
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            SweepersError::Connectivity(msg)
        } else if status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            SweepersError::Transient(msg)
        } else {
            SweepersError::MalformedResponse(msg)
        }
    }
}

impl From<JsonError> for SweepersError {
    fn from(src: JsonError) -> SweepersError {
        SweepersError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<toml::de::Error> for SweepersError {
    fn from(src: toml::de::Error) -> SweepersError {
        SweepersError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<UrlParseError> for SweepersError {
    fn from(src: UrlParseError) -> SweepersError {
        SweepersError::Config(format!("Invalid URL: {src}"))
    }
}

impl From<io::Error> for SweepersError {
    fn from(x: io::Error) -> Self {
        SweepersError::Io(format!("IOError: {} ({x})", x.kind()))
    }
}

impl From<fmt::Error> for SweepersError {
    fn from(x: fmt::Error) -> Self {
        SweepersError::Serialization(format!("{x}"))
    }
}

impl From<reqwest::Error> for SweepersError {
    fn from(x: reqwest::Error) -> Self {
        if let Some(status) = x.status() {
            return SweepersError::from_status(status, &x.to_string());
        }
        if x.is_timeout() {
            SweepersError::Transient(format!("request timed out: {x}"))
        } else if x.is_decode() {
            SweepersError::MalformedResponse(format!("{x}"))
        } else if x.is_connect() {
            SweepersError::Connectivity(format!("{x}"))
        } else {
            SweepersError::Transient(format!("{x}"))
        }
    }
}
