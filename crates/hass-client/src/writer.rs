//! Outbound queue and write pump.
//!
//! Exactly one write pump per session drains a bounded queue and transmits
//! one text frame per message, so JSON encoding need not be thread-safe
//! across messages.

use std::time::Duration;

use hass_core::protocol::Outbound;
use hass_core::transport::TransportWriter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

/// Backoff applied after a transport send failure, before the pump tears
/// down. Keeps a flaky peer from spinning the task hot.
const SEND_ERROR_BACKOFF: Duration = Duration::from_millis(20);

/// What the write pump drains from the queue: either a protocol message to
/// serialize and send, or a direct request to send the close frame. The
/// latter is internal to this crate — it is never part of the wire
/// protocol `Outbound` enum — and lets `Session::close` trigger the close
/// frame ahead of session cancellation instead of only as a side effect of
/// it.
enum WriterItem {
    Message(Outbound),
    Close,
}

/// Producer handle for the outbound queue.
///
/// Cloned freely — multiple callers may enqueue commands concurrently; the
/// single writer task drains them in enqueue order.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<WriterItem>,
}

impl OutboundQueue {
    /// Enqueue a message for transmission. Non-blocking: returns an error
    /// immediately if the queue is full rather than waiting — queue
    /// saturation means the transport is stalled.
    pub fn try_enqueue(&self, msg: Outbound) -> Result<(), SessionError> {
        self.tx.try_send(WriterItem::Message(msg)).map_err(|_| {
            SessionError::Transport(hass_core::transport::TransportError::Io(
                "outbound queue full".to_string(),
            ))
        })
    }

    /// Ask the write pump to send the close frame directly, ahead of and
    /// independent from session cancellation. Used by `Session::close` to
    /// implement the close-before-cancel ordering the graceful shutdown
    /// sequence requires.
    pub(crate) fn try_request_close(&self) -> Result<(), SessionError> {
        self.tx.try_send(WriterItem::Close).map_err(|_| {
            SessionError::Transport(hass_core::transport::TransportError::Io(
                "outbound queue full".to_string(),
            ))
        })
    }
}

/// Create a bounded outbound queue of the given capacity, returning the
/// producer handle and the receiver the write pump drains.
pub(crate) fn bounded(capacity: usize) -> (OutboundQueue, mpsc::Receiver<WriterItem>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundQueue { tx }, rx)
}

/// Drive the write pump: serialize and send each queued message, in order,
/// until cancelled or the transport fails.
///
/// A `WriterItem::Close` sends the close frame immediately, on the normal
/// dequeue path — this is how `Session::close` gets the frame out before
/// cancelling. Cancellation also sends the close frame if one hasn't gone
/// out yet, covering the abnormal paths (a pump erroring out on its own)
/// where nothing asked for a graceful close first.
pub(crate) async fn run<W: TransportWriter>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriterItem>,
    cancellation: CancellationToken,
) {
    let mut close_sent = false;
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                if !close_sent {
                    if let Err(e) = writer.close_output(1000, "normal closure").await {
                        tracing::debug!(error = %e, "close_output failed during shutdown");
                    }
                }
                break;
            }
            item = rx.recv() => {
                let Some(item) = item else { break };
                match item {
                    WriterItem::Close => {
                        if let Err(e) = writer.close_output(1000, "normal closure").await {
                            tracing::debug!(error = %e, "close_output failed during shutdown");
                        }
                        close_sent = true;
                    }
                    WriterItem::Message(msg) => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to serialize outbound message, dropping");
                                continue;
                            }
                        };
                        if let Err(e) = writer.send(&json).await {
                            tracing::error!(error = %e, "write pump transport error, closing session");
                            tokio::time::sleep(SEND_ERROR_BACKOFF).await;
                            cancellation.cancel();
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_enqueue_fails_fast_when_full() {
        let (queue, mut rx) = bounded(1);
        queue.try_enqueue(Outbound::Ping { id: 1 }).unwrap();
        let err = queue.try_enqueue(Outbound::Ping { id: 2 }).unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        rx.close();
    }
}
