//! Inbound reader & dispatcher.
//!
//! Exactly one reader task per session owns the transport's receive side.
//! It reassembles frames into complete JSON messages, discriminates by
//! `type`, and routes each to the event channel or to the caller awaiting
//! its reply via the coordinator's pending-commands map.
//!
//! The pending-commands map is consulted here, not by the caller, because
//! the reader is the only party that knows how to decode the polymorphic
//! `result` field — it has the command kind on hand.

use std::time::Duration;

use hass_core::protocol::{EventRecord, Inbound, RawInbound};
use hass_core::transport::{FrameKind, TransportReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::coordinator::{self, HANDSHAKE_ID, PendingMap};

/// Backoff applied after a malformed frame, before the reader tries again.
/// The reader never terminates for a decode error; this just avoids a
/// livelock if the peer emits a stream of garbage.
const DECODE_ERROR_BACKOFF: Duration = Duration::from_millis(20);

pub(crate) struct ReaderContext {
    pub(crate) pending: PendingMap,
    pub(crate) event_tx: mpsc::Sender<EventRecord>,
}

/// Drive the reader pump until cancelled, the peer closes, or the
/// transport errors. Any exit path cancels the session so the write pump
/// also unwinds.
///
/// `peer_closed_tx` fires the moment the peer's close frame (or stream end)
/// is observed, letting `Session::close` wait for that signal before it
/// cancels the session — the order the graceful shutdown sequence needs.
pub(crate) async fn run<R: TransportReader>(
    mut reader: R,
    ctx: ReaderContext,
    cancellation: CancellationToken,
    peer_closed_tx: oneshot::Sender<()>,
) {
    let mut peer_closed_tx = Some(peer_closed_tx);
    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            frame = reader.receive() => {
                match frame {
                    Ok(Some(FrameKind::Text(text))) => handle_text(&text, &ctx).await,
                    Ok(Some(FrameKind::Close)) | Ok(None) => {
                        tracing::debug!("transport closed by peer");
                        if let Some(tx) = peer_closed_tx.take() {
                            let _ = tx.send(());
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "read pump transport error, closing session");
                        break;
                    }
                }
            }
        }
    }
    cancellation.cancel();
}

async fn handle_text(text: &str, ctx: &ReaderContext) {
    let raw: RawInbound = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "malformed inbound JSON, dropping frame");
            tokio::time::sleep(DECODE_ERROR_BACKOFF).await;
            return;
        }
    };

    if let RawInbound::Event { event } = raw {
        let record: EventRecord = event.into();
        if ctx.event_tx.try_send(record).is_err() {
            tracing::debug!("event channel full, dropping event (best-effort delivery)");
        }
        return;
    }

    let kind = match &raw {
        RawInbound::Result { id, .. } => ctx.pending.read().await.get(id).and_then(|e| e.kind),
        _ => None,
    };

    let dispatch_id = match &raw {
        RawInbound::Result { id, .. } | RawInbound::Pong { id } => *id,
        RawInbound::AuthRequired | RawInbound::AuthOk | RawInbound::AuthInvalid { .. } => {
            HANDSHAKE_ID
        }
        RawInbound::Event { .. } => unreachable!("handled above"),
    };

    match raw.into_typed(kind) {
        Ok(inbound) => coordinator::dispatch(&ctx.pending, dispatch_id, inbound).await,
        Err(e) => tracing::warn!(error = %e, id = dispatch_id, "failed to type inbound result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    fn ctx() -> (ReaderContext, mpsc::Receiver<EventRecord>) {
        let (event_tx, event_rx) = mpsc::channel(8);
        let pending = Arc::new(RwLock::new(HashMap::new()));
        (ReaderContext { pending, event_tx }, event_rx)
    }

    #[tokio::test]
    async fn malformed_json_is_tolerated() {
        let (ctx, _rx) = ctx();
        handle_text("not json", &ctx).await;
        // No panic, no pending entries disturbed — the reader just moves on.
        assert!(ctx.pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn event_is_forwarded_to_event_channel() {
        let (ctx, mut rx) = ctx();
        let text = r#"{"type":"event","event":{"event_type":"state_changed","data":{"entity_id":"light.x"},"origin":"LOCAL","time_fired":"2024-01-01T00:00:00Z"}}"#;
        handle_text(text, &ctx).await;
        let record = rx.recv().await.unwrap();
        assert_eq!(record.event_type, "state_changed");
    }

    #[tokio::test]
    async fn result_is_typed_using_pending_command_kind() {
        let (queue, _outbound_rx) = writer::bounded(8);
        let coordinator = crate::coordinator::Coordinator::new(queue);
        let token = CancellationToken::new();

        let ctx = ReaderContext {
            pending: coordinator.pending_map(),
            event_tx: mpsc::channel(8).0,
        };

        let cmd = hass_core::protocol::Outbound::GetConfig { id: 0 };
        let waiter = coordinator.send_command_and_await(cmd, &token, Duration::from_secs(5));

        let text = r#"{"type":"result","id":2,"success":true,"result":{"version":"2024.1.0","location_name":"Home","latitude":1.0,"longitude":2.0,"time_zone":"UTC","components":[],"unit_system":{}}}"#;
        let dispatch = handle_text(text, &ctx);

        let (result, ()) = tokio::join!(waiter, dispatch);
        let (id, inbound) = result.unwrap();
        assert_eq!(id, 2);
        match inbound {
            Inbound::Result {
                result: hass_core::protocol::CommandResult::Config(cfg),
                ..
            } => assert_eq!(cfg.location_name, "Home"),
            other => panic!("unexpected inbound: {other:?}"),
        }
    }
}
