use std::io;

use crate::Transport;
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection already established with {0}")]
    ConnectionEstablished(String),
    #[error("connection not established")]
    ConnectionNotEstablished,
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("communication with {endpoint} failed: {message}")]
    Communication { endpoint: String, message: String },

    #[error("command {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("invalid response format: {0}")]
    ResponseFormat(String),
    #[error("empty response received")]
    EmptyResponse,

    #[error("timed out: {0}")]
    TimedOut(String),
    #[error("client was already disposed")]
    Disposed,

    #[error("transport unavailable: {0}")]
    TransportUnavailable(Transport),
    #[error("endpoint {endpoint} does not match transport {transport}")]
    WrongEndpointType {
        endpoint: String,
        transport: Transport,
    },
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed parsing address: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),
    #[error("failed parsing int: {0}")]
    IntParseError(#[from] std::num::ParseIntError),
    #[error("serde_json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("io error: {0}")]
    IoError(io::Error),

    #[error("other: {0}")]
    Other(String),
}

impl Error {
    /// Returns true for failures of the transport layer, which may succeed
    /// when attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TimedOut(_) | Error::Communication { .. } | Error::ConnectionRefused(_) => true,
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::TimedOut(_) => true,
            _ => false,
        }
    }

    /// Converts an io error, attaching the description of the operation
    /// that was being performed.
    pub(crate) fn from_io(e: io::Error, what: &str) -> Error {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::TimedOut(what.to_string()),
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused(what.to_string()),
            _ => Error::IoError(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let what = e.to_string();
        Error::from_io(e, &what)
    }
}

#[test]
fn io_timeouts_are_mapped() {
    let e: Error = io::Error::new(io::ErrorKind::WouldBlock, "would block").into();
    assert!(e.is_timeout());
    assert!(e.is_retryable());

    let e: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
    assert!(!e.is_retryable());
}
