//! Error types for the transport.

use std::fmt;

/// Error type for transport operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying driver.
    Driver(std::io::Error),
    /// The session was closed while RPCs were queued or in flight.
    Aborted,
    /// The driver could not parse a service locator.
    BadLocator(String),
    /// Invalid configuration.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Driver(e) => write!(f, "driver error: {}", e),
            Error::Aborted => write!(f, "RPC aborted"),
            Error::BadLocator(l) => write!(f, "bad service locator: {}", l),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Driver(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
