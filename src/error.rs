//! Error types surfaced at the HTTP and store boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A required request field is missing or malformed
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown assignment, call or channel
    #[error("not found: {0}")]
    NotFound(String),

    /// The per-trunk origination queue is at capacity
    #[error("origination queue full for trunk {0}")]
    QueueFull(String),

    /// The PBX REST surface could not be reached or rejected the call
    #[error("pbx unavailable: {0}")]
    PbxUnavailable(String),

    /// The PBX no longer knows the resource; treated as already-gone
    #[error("pbx resource gone: {0}")]
    PbxGone(String),

    /// Unknown campaign or step in the catalog
    #[error("unknown campaign or step: {0}")]
    CatalogMiss(String),

    /// An outbound HTTP fetch timed out
    #[error("fetch timed out: {0}")]
    FetchTimeout(String),

    /// A wire payload could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Internal(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::FetchTimeout(err.to_string())
        } else {
            Error::PbxUnavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(format!("JSON error: {}", err))
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Parse(format!("XML error: {}", err))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
