//! Error types.

use std::io;

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Failure of the transport, protocol or request itself
    #[error(transparent)]
    Net(#[from] optislang_net::Error),

    #[error("server failed to start: {0}")]
    ServerStart(String),
    #[error("server failed to start due to licensing: {0}")]
    ServerLicensing(String),
    #[error("optislang instance was already disposed")]
    Disposed,

    #[error("invalid process state: {0}")]
    ProcessState(String),

    #[error("solver node {0} is already being serviced by another consumer")]
    ConsumerBusy(String),
    #[error("results for design {hid} were already submitted to solver node {uid}")]
    AlreadySubmitted { uid: String, hid: String },

    #[error("design study error: {0}")]
    Study(String),

    #[error("io error: {0}")]
    IoError(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("toml deserialization error: {0}")]
    TomlDeserError(#[from] toml::de::Error),
    #[error("toml serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
}

impl Error {
    /// Returns true if the underlying failure happened on the transport
    /// layer and may go away when attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Net(e) => e.is_retryable(),
            _ => false,
        }
    }
}
