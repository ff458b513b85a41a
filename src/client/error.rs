use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced to error hooks by the connection manager
///
/// None of these are returned from `connect` or `send`; they are counted in
/// the metrics and delivered to the registered error hooks.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No authentication token available")]
    MissingToken,

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported origin scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
