//! Errors surfaced by the session façade.

use hass_core::transport::TransportError;
use thiserror::Error;

/// Errors a [`crate::session::Session`] can surface to callers.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `connect` was called with an empty URL.
    #[error("url must not be empty")]
    InvalidArgument,

    /// `connect` was called while the session was already connected.
    #[error("session is already connected")]
    AlreadyConnected,

    /// The server rejected the supplied access token.
    #[error("authentication failed")]
    AuthFailed,

    /// A per-call deadline elapsed while the session remained live.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// The session was cancelled (an explicit `close` or a pump failure)
    /// while the call was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// The transport failed to send or receive.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A `result` reply did not decode to the shape its command expected,
    /// or a handshake message arrived out of order.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The operation requires a connected session.
    #[error("session is not connected")]
    NotConnected,
}

impl From<hass_core::error::HassError> for SessionError {
    fn from(e: hass_core::error::HassError) -> Self {
        SessionError::Protocol(e.to_string())
    }
}
