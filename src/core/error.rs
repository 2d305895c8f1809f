//! Error types for the gateway session client.

use thiserror::Error;

use crate::frame::ErrorShape;

/// Errors decoding or encoding wire frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The text is not valid JSON for any known frame shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame carried a `type` this client does not handle.
    #[error("unsupported frame type: {0}")]
    UnsupportedType(String),
}

/// Errors in the device identity layer.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Key material could not be decoded.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// A persisted store could not be parsed or written as JSON.
    #[error("store format error: {0}")]
    Format(#[from] serde_json::Error),

    /// I/O error reading or writing a persisted store.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single request did not produce a payload.
///
/// `Clone` so a single teardown cause can be fanned out to every pending
/// request.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    /// The connection is not open; the request was never sent.
    #[error("gateway not connected")]
    NotConnected,

    /// The client was stopped while the request was outstanding.
    #[error("client stopped")]
    Stopped,

    /// The transport closed while the request was outstanding.
    #[error("gateway closed ({code}): {reason}")]
    Closed {
        /// Close code reported by the transport.
        code: u16,
        /// Close reason reported by the transport.
        reason: String,
    },

    /// The gateway answered with an application error.
    #[error("{}: {}", .0.code, .0.message)]
    Remote(ErrorShape),

    /// The request could not be encoded.
    #[error("request encoding failed: {0}")]
    Encode(String),

    /// The driver task is gone.
    #[error("client driver dropped")]
    Dropped,
}

impl RequestError {
    /// Error code of a remote application error, if any.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            Self::Remote(shape) => Some(shape.code.as_str()),
            _ => None,
        }
    }
}

/// Top-level gateway client errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Identity error.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Request error.
    #[error("request error: {0}")]
    Request(#[from] RequestError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
