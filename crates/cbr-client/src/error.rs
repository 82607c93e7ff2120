//! Error types for the bridge-client library.

use cbr_proto::CodecError;

/// Errors that can occur in a bridge client
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Login rejected: {0}")]
    Auth(String),

    #[error("No reply from server")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, ClientError>;
