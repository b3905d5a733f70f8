use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that may occur while managing sessions.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The session does not exist, or its transport is not connected.
    #[error("`{0}` is not connected")]
    NotConnected(String),

    /// Opening the underlying device or socket failed.
    #[error("Could not connect to `{key}`. Problem: {problem}")]
    ConnectionFailed {
        /// The session key which was attempted.
        key: String,

        /// What went wrong.
        problem: String,
    },

    /// A TCP session key was not on the form `host:port`.
    #[error("The address `{0}` is not on the form `host:port`")]
    BadAddress(String),

    /// The requested baud rate is not one we support.
    #[error("Unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),

    /// Reading or writing the device failed.
    #[error("IO problem: {0}")]
    Io(String),

    /// The configuration is not valid.
    #[error("Bad configuration. Problem: {0}")]
    BadConfig(String),

    /// The request did not conform to valid usage.
    #[error("The request did not conform to valid usage. Problem: `{0}`")]
    BadRequest(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
