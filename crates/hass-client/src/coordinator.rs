//! Request/response coordinator.
//!
//! Assigns monotonic ids, records per-id command types so the reader can
//! type-decode polymorphic `result` payloads, and hands each reply directly
//! to the caller that issued the command.
//!
//! The distilled design permits either a shared-channel "put back and
//! retry" discipline or a per-id one-shot mailbox as an equivalent
//! implementation strategy; this crate uses the mailbox — a
//! `HashMap<id, oneshot::Sender<Inbound>>` — since it removes the poll
//! latency and the spurious re-delivery traffic the put-back loop implies.
//! The observable contract (each reply reaches exactly the caller that
//! issued its command) is the same either way.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hass_core::protocol::{CommandKind, Inbound, Outbound};
use tokio::sync::{RwLock, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::writer::OutboundQueue;

/// Reserved id for handshake messages (`auth_required` / `auth_ok` /
/// `auth_invalid`), which carry no id of their own on the wire. Real
/// commands start at id 2, so 0 can never collide.
pub(crate) const HANDSHAKE_ID: u64 = 0;

pub(crate) struct PendingEntry {
    pub(crate) kind: Option<CommandKind>,
    reply_tx: oneshot::Sender<Inbound>,
}

pub(crate) type PendingMap = Arc<RwLock<HashMap<u64, PendingEntry>>>;

/// Owns the id counter and the pending-commands map for one session.
pub struct Coordinator {
    next_id: AtomicU64,
    pending: PendingMap,
    outbound: OutboundQueue,
}

impl Coordinator {
    pub(crate) fn new(outbound: OutboundQueue) -> Self {
        Self {
            // Pre-incremented: the first command issued gets id 2.
            next_id: AtomicU64::new(1),
            pending: Arc::new(RwLock::new(HashMap::with_capacity(200))),
            outbound,
        }
    }

    pub(crate) fn pending_map(&self) -> PendingMap {
        Arc::clone(&self.pending)
    }

    /// Enqueue the `auth` message. It carries no id and has no pending
    /// entry of its own — the handshake reply is awaited separately via
    /// [`Coordinator::await_handshake_message`].
    pub(crate) fn send_auth(&self, access_token: String) -> Result<(), SessionError> {
        self.outbound.try_enqueue(Outbound::Auth { access_token })
    }

    /// Ask the write pump to send the close frame directly, ahead of
    /// session cancellation. See `Session::close`.
    pub(crate) fn request_close(&self) -> Result<(), SessionError> {
        self.outbound.try_request_close()
    }

    /// Register the handshake mailbox and wait for the next
    /// `auth_required` / `auth_ok` / `auth_invalid` message, or timeout /
    /// session cancellation.
    pub(crate) async fn await_handshake_message(
        &self,
        cancellation: &CancellationToken,
        timeout: Duration,
    ) -> Result<Inbound, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.write().await.insert(
            HANDSHAKE_ID,
            PendingEntry {
                kind: None,
                reply_tx,
            },
        );
        Self::await_reply(reply_rx, &self.pending, HANDSHAKE_ID, cancellation, timeout).await
    }

    /// Assign an id, record the pending entry, enqueue the command, and
    /// await the matching reply (or a timeout / session cancellation).
    ///
    /// Returns the assigned id alongside the reply so callers that need the
    /// id (e.g. to later `unsubscribe_events`) don't have to thread it
    /// through separately.
    pub async fn send_command_and_await(
        &self,
        mut command: Outbound,
        cancellation: &CancellationToken,
        timeout: Duration,
    ) -> Result<(u64, Inbound), SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        command.set_id(id);
        let kind = command.kind();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .write()
            .await
            .insert(id, PendingEntry { kind, reply_tx });

        if let Err(e) = self.outbound.try_enqueue(command) {
            self.pending.write().await.remove(&id);
            return Err(e);
        }

        let reply = Self::await_reply(reply_rx, &self.pending, id, cancellation, timeout).await?;
        Ok((id, reply))
    }

    async fn await_reply(
        reply_rx: oneshot::Receiver<Inbound>,
        pending: &PendingMap,
        id: u64,
        cancellation: &CancellationToken,
        timeout: Duration,
    ) -> Result<Inbound, SessionError> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                pending.write().await.remove(&id);
                Err(SessionError::Cancelled)
            }
            reply = reply_rx => {
                reply.map_err(|_| SessionError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                pending.write().await.remove(&id);
                Err(SessionError::Timeout)
            }
        }
    }
}

/// Deliver a reply to whichever caller registered the matching id.
///
/// Called by the reader task. If no one is waiting (late, duplicated, or
/// unknown id — or the caller already timed out and dropped its receiver),
/// the reply is logged and dropped: there is no shared channel left to
/// put it back on.
pub(crate) async fn dispatch(pending: &PendingMap, id: u64, inbound: Inbound) {
    let entry = pending.write().await.remove(&id);
    match entry {
        Some(entry) => {
            let _ = entry.reply_tx.send(inbound);
        }
        None => {
            tracing::debug!(id, "reply for unknown or already-resolved id, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;

    #[tokio::test]
    async fn unmatched_reply_id_is_dropped_without_panic() {
        let (queue, _rx) = writer::bounded(8);
        let coordinator = Coordinator::new(queue);
        dispatch(&coordinator.pending, 12345, Inbound::AuthOk).await;
    }

    #[tokio::test]
    async fn send_command_and_await_times_out_when_no_reply_arrives() {
        let (queue, mut rx) = writer::bounded(8);
        let coordinator = Coordinator::new(queue);
        let token = CancellationToken::new();

        let result = coordinator
            .send_command_and_await(
                Outbound::GetConfig { id: 0 },
                &token,
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(SessionError::Timeout)));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_command_and_await_rethrows_cancelled_on_session_shutdown() {
        let (queue, _rx) = writer::bounded(8);
        let coordinator = Coordinator::new(queue);
        let token = CancellationToken::new();
        token.cancel();

        let result = coordinator
            .send_command_and_await(
                Outbound::GetConfig { id: 0 },
                &token,
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_start_at_two() {
        let (queue, mut rx) = writer::bounded(8);
        let coordinator = Coordinator::new(queue);
        let token = CancellationToken::new();

        // Fire-and-forget two commands without replying; both time out, but
        // we only care about the ids assigned.
        let a = coordinator.send_command_and_await(
            Outbound::GetConfig { id: 0 },
            &token,
            Duration::from_millis(5),
        );
        let b = coordinator.send_command_and_await(
            Outbound::GetStates { id: 0 },
            &token,
            Duration::from_millis(5),
        );
        let (_, _) = tokio::join!(a, b);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.id(), Some(2));
        assert_eq!(second.id(), Some(3));
    }
}
