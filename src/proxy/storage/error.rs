use std::{fmt, io};
use tracing::debug;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Source(io::Error),
    TooLarge(u64),
    InvalidHandle(String),
    NotFound(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::Source(err) => write!(f, "Error reading source: {err}"),
            Error::TooLarge(limit) => write!(f, "Object exceeds maximum size of {limit} bytes"),
            Error::InvalidHandle(handle) => write!(f, "Invalid storage handle: {handle}"),
            Error::NotFound(handle) => write!(f, "Object not found: {handle}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        debug!("Storage IO error: {err}");
        Error::Io(err)
    }
}
