//! Errors raised while decoding or typing wire messages.
//!
//! Kept separate from [`crate::transport::TransportError`] because these
//! errors are about the *shape* of a message, not the socket.

use thiserror::Error;

/// Failure decoding or typing an inbound wire message.
#[derive(Debug, Error)]
pub enum HassError {
    /// The raw JSON did not match any known message shape.
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    /// A `result` reply's `result` field did not decode to the type its
    /// command kind expects.
    #[error("result for command {id} did not decode as the expected type: {source}")]
    ResultMismatch {
        id: u64,
        #[source]
        source: serde_json::Error,
    },

    /// A handshake message arrived out of the expected order (e.g. a
    /// `result` before any `auth_ok`).
    #[error("unexpected message during handshake: {0}")]
    UnexpectedHandshake(String),
}
