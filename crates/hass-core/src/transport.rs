//! Transport abstraction for the WebSocket connection.
//!
//! Decouples the connection engine from any specific transport
//! implementation. [`Session`](hass_client crate)-level code uses the
//! [`Transport`] trait to establish connections without caring whether the
//! underlying socket is a real WebSocket or an in-memory test double.

use std::future::Future;

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O or protocol-level error.
    #[error("{0}")]
    Io(String),
}

/// The kind of frame a [`TransportReader`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// A complete UTF-8 text message.
    Text(String),
    /// A close frame initiated by the peer.
    Close,
}

/// Read half of a transport connection.
///
/// Implementations reassemble whatever framing the underlying transport
/// uses and hand the core one complete message at a time.
pub trait TransportReader: Send + 'static {
    /// Receive the next complete message.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed with no
    /// further frames available (equivalent to a zero-length read).
    fn receive(&mut self) -> impl Future<Output = Result<Option<FrameKind>, TransportError>> + Send;
}

/// Write half of a transport connection.
pub trait TransportWriter: Send + 'static {
    /// Send a single text message to the remote peer.
    fn send(&mut self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Initiate a half-close: send a close frame with the given code and
    /// reason. The peer is expected to respond with its own close frame,
    /// which the reader half will observe as [`FrameKind::Close`] or a
    /// clean `Ok(None)`.
    fn close_output(
        &mut self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A bidirectional transport that can be split into independent read and
/// write halves.
///
/// This allows the reader and writer to be moved into separate async tasks
/// for concurrent I/O — exactly one of each per connected session.
pub trait Transport: Send + 'static {
    /// The read half produced by [`split`](Transport::split).
    type Reader: TransportReader;
    /// The write half produced by [`split`](Transport::split).
    type Writer: TransportWriter;

    /// Split the transport into independent read and write halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}
