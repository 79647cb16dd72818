use std::io;

use thiserror::Error;

/// Failures surfaced by the codec, connections and listeners.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying stream is broken. Never recoverable for a connection.
    #[error("stream i/o failure: {0}")]
    Io(#[from] io::Error),

    /// Well-formed bytes carrying semantically invalid content, e.g. an
    /// unregistered type header or a payload a decoder rejects.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Setup mistakes: duplicate or negative type IDs, unregistered outgoing
    /// messages, failed port binds.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(value: bincode::error::DecodeError) -> Self {
        use bincode::error::DecodeError;

        match value {
            DecodeError::Io { inner, .. } => Error::Io(inner),
            DecodeError::UnexpectedEnd { additional } => Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {additional} bytes short"),
            )),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(value: bincode::error::EncodeError) -> Self {
        use bincode::error::EncodeError;

        match value {
            EncodeError::Io { inner, .. } => Error::Io(inner),
            other => Error::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
