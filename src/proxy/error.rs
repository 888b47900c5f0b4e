use std::fmt;
use tracing::{debug, error};

use crate::oci;
use crate::proxy::{cache_store, storage};

#[derive(Debug, PartialEq)]
pub enum Error {
    NotEnabled,
    NotFound(String),
    InvalidPayload(String),
    UpstreamAuth(String),
    UpstreamFetch(String),
    UpstreamTimeout,
    Storage(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotEnabled => write!(f, "Dependency proxy is not enabled"),
            Error::NotFound(msg) => write!(f, "Not found: {msg}"),
            Error::InvalidPayload(msg) => write!(f, "Invalid payload: {msg}"),
            Error::UpstreamAuth(msg) => write!(f, "Upstream authentication failed: {msg}"),
            Error::UpstreamFetch(msg) => write!(f, "Upstream fetch failed: {msg}"),
            Error::UpstreamTimeout => write!(f, "Upstream request timed out"),
            Error::Storage(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl From<storage::Error> for Error {
    fn from(err: storage::Error) -> Self {
        match err {
            storage::Error::TooLarge(limit) => {
                Error::InvalidPayload(format!("payload exceeds {limit} bytes"))
            }
            storage::Error::Source(err) => {
                debug!("Payload stream error: {err}");
                Error::InvalidPayload(format!("unable to read payload: {err}"))
            }
            err => {
                error!("Storage error: {err}");
                Error::Storage(err.to_string())
            }
        }
    }
}

impl From<cache_store::Error> for Error {
    fn from(err: cache_store::Error) -> Self {
        error!("Cache store error: {err}");
        Error::Storage(err.to_string())
    }
}

impl From<oci::Error> for Error {
    fn from(err: oci::Error) -> Self {
        Error::InvalidPayload(err.to_string())
    }
}
