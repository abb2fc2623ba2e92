//! Sync client error types.

use thiserror::Error;

use super::identity::InvalidIdentity;

/// Errors that can occur during sync client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Publish attempted while the client is not connected; the change was dropped
    #[error("Not connected to the sync server, change dropped")]
    NotConnected,

    /// Failed to open a transport to the server
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Read or write failure on an open transport
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Message could not be encoded or decoded
    #[error("Sync protocol error: {0}")]
    ProtocolError(String),

    /// Identity refused before any connection attempt
    #[error("Invalid identity: {0}")]
    InvalidIdentity(#[from] InvalidIdentity),

    /// The client gave up after too many consecutive failures
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Error talking to the server's HTTP endpoints
    #[error("HTTP error: {0}")]
    HttpError(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::ProtocolError(e.to_string())
    }
}
