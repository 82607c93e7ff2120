//! Error types for the relay server.

/// Errors that can occur in the relay server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file problem
    #[error("config error: {0}")]
    Config(String),

    /// Login attempt for a name not present in the registry
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// Login attempt with a wrong secret
    #[error("bad credentials for client: {0}")]
    BadCredentials(String),

    /// Framing-level codec error
    #[error("codec error: {0}")]
    Codec(#[from] cbr_proto::CodecError),
}

pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// True for the two login-rejection variants.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ServerError::UnknownClient(_) | ServerError::BadCredentials(_)
        )
    }
}
