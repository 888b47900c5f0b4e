use std::fmt::Display;

#[derive(Debug, PartialEq)]
pub enum Error {
    InvalidFormat(String),
    UnsupportedAlgorithm(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidFormat(s) => write!(f, "Invalid format: {s}"),
            Error::UnsupportedAlgorithm(s) => write!(f, "Unsupported digest algorithm: {s}"),
        }
    }
}
