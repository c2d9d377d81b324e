//! Session controller: the public façade.
//!
//! Owns the lifecycle of a single connection — running the auth handshake,
//! wiring the reader and writer pumps to a freshly split transport,
//! optionally seeding the state mirror, and executing graceful shutdown.
//! Everything else in this crate exists to make this module's job
//! straightforward.

use std::sync::Arc;
use std::time::Duration;

use hass_core::protocol::{CommandResult, EventRecord, HassConfig, HassState, Inbound, Outbound};
use hass_core::transport::Transport;
use hass_core::ws_transport::WsTransport;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;
use crate::error::SessionError;
use crate::state::StateMirror;
use crate::{reader, writer};

/// Session-level tuning knobs, per §6 of the specification.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-call deadline for command/reply round trips.
    pub socket_timeout: Duration,
    /// Capacity of the outbound queue and the event channel.
    pub channel_capacity: usize,
    /// Minimum buffer size the transport reassembles frames into. Kept for
    /// parity with the spec's config surface; `hass-core`'s `Transport`
    /// trait already hands the reader whole messages, so this crate has no
    /// buffer of its own to size.
    pub receive_buffer_bytes: usize,
    /// How long `close` waits for the pumps to wind down before giving up.
    pub max_close_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(5),
            channel_capacity: 200,
            receive_buffer_bytes: 4096,
            max_close_wait: Duration::from_secs(5),
        }
    }
}

/// Options controlling what `connect` does after a successful auth.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Issue `get_states` after `auth_ok` and seed the state mirror.
    pub get_states_on_connect: bool,
    /// Issue `subscribe_events` after `auth_ok`.
    pub subscribe_events: bool,
    /// Event type filter passed to `subscribe_events`; `None` subscribes to
    /// every event.
    pub event_type_filter: Option<String>,
}

/// Handles and state that exist only while connected. Built by `connect`,
/// torn down by `close`.
struct Connection {
    coordinator: Coordinator,
    cancellation: CancellationToken,
    event_rx: Mutex<mpsc::Receiver<EventRecord>>,
    /// Fires once the reader observes the peer's close frame (or stream
    /// end). `close` takes this out and awaits it, bounded by
    /// `max_close_wait`, before cancelling the session.
    peer_closed_rx: Mutex<Option<oneshot::Receiver<()>>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

/// A Home Assistant WebSocket session.
///
/// Reusable across connect/close cycles: `close` tears down the current
/// connection and resets internal state so the same `Session` can be
/// reconnected.
pub struct Session {
    config: SessionConfig,
    state: StateMirror,
    connection: RwLock<Option<Connection>>,
    closing: Mutex<bool>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: StateMirror::new(),
            connection: RwLock::new(None),
            closing: Mutex::new(false),
        }
    }

    /// The local mirror of entity states, seeded at connect time by
    /// `get_states_on_connect`. Reflects the connect-time snapshot only —
    /// it is never updated from `state_changed` events inside this crate.
    pub fn state_mirror(&self) -> &StateMirror {
        &self.state
    }

    // -----------------------------------------------------------------
    // Connect
    // -----------------------------------------------------------------

    /// Connect over a real WebSocket, run the auth handshake, and perform
    /// the requested post-auth handshake steps.
    ///
    /// Returns `Ok(true)` on `auth_ok`, `Ok(false)` on `auth_invalid` or an
    /// unexpected first handshake message.
    pub async fn connect(
        &self,
        url: &str,
        token: &str,
        opts: ConnectOptions,
    ) -> Result<bool, SessionError> {
        if url.is_empty() {
            return Err(SessionError::InvalidArgument);
        }
        if self.connection.read().await.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let transport = WsTransport::connect(url).await?;
        self.connect_with_transport(transport, token, opts).await
    }

    /// Connect over any [`Transport`] implementation — the seam test doubles
    /// use to exercise the handshake and pumps without a real socket.
    pub async fn connect_with_transport<T: Transport>(
        &self,
        transport: T,
        token: &str,
        opts: ConnectOptions,
    ) -> Result<bool, SessionError> {
        if self.connection.read().await.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let (transport_reader, transport_writer) = transport.split();
        let cancellation = CancellationToken::new();

        let (outbound_tx, outbound_rx) = writer::bounded(self.config.channel_capacity);
        let coordinator = Coordinator::new(outbound_tx);
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_capacity);

        let reader_ctx = reader::ReaderContext {
            pending: coordinator.pending_map(),
            event_tx,
        };

        let (peer_closed_tx, peer_closed_rx) = oneshot::channel();

        let reader_handle = tokio::spawn(reader::run(
            transport_reader,
            reader_ctx,
            cancellation.clone(),
            peer_closed_tx,
        ));
        let writer_handle = tokio::spawn(writer::run(
            transport_writer,
            outbound_rx,
            cancellation.clone(),
        ));

        let connection = Connection {
            coordinator,
            cancellation: cancellation.clone(),
            event_rx: Mutex::new(event_rx),
            peer_closed_rx: Mutex::new(Some(peer_closed_rx)),
            reader_handle,
            writer_handle,
        };

        let authed = match self
            .run_handshake(&connection, token, &cancellation)
            .await
        {
            Ok(authed) => authed,
            Err(e) => {
                self.teardown(connection).await;
                return Err(e);
            }
        };

        if !authed {
            self.teardown(connection).await;
            return Ok(false);
        }

        if let Err(e) = self.run_post_auth(&connection, &opts, &cancellation).await {
            self.teardown(connection).await;
            return Err(e);
        }

        *self.connection.write().await = Some(connection);
        Ok(true)
    }

    /// Run the auth state machine: `auth_required` may or may not precede
    /// `auth_ok`. If the first message is already `auth_ok`/`auth_invalid`,
    /// the `auth` send is skipped.
    ///
    /// A message that never arrives within `socket_timeout` is treated the
    /// same as an unexpected first message: a server frame the reader
    /// couldn't route to the handshake mailbox (a stray `result`/`pong`
    /// sent before `auth_ok`, which real servers shouldn't send but which
    /// still must not leak a bare `Timeout` out of `connect`) looks
    /// identical from here to the server simply staying silent. Both
    /// resolve to `Ok(false)` with an error log rather than propagating the
    /// timeout.
    async fn run_handshake(
        &self,
        connection: &Connection,
        token: &str,
        cancellation: &CancellationToken,
    ) -> Result<bool, SessionError> {
        let first = match connection
            .coordinator
            .await_handshake_message(cancellation, self.config.socket_timeout)
            .await
        {
            Ok(msg) => msg,
            Err(SessionError::Timeout) => {
                tracing::error!("no handshake message arrived before the socket timeout");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let reply = if matches!(first, Inbound::AuthRequired) {
            connection.coordinator.send_auth(token.to_string())?;
            match connection
                .coordinator
                .await_handshake_message(cancellation, self.config.socket_timeout)
                .await
            {
                Ok(msg) => msg,
                Err(SessionError::Timeout) => {
                    tracing::error!("no auth reply arrived before the socket timeout");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        } else {
            first
        };

        match reply {
            Inbound::AuthOk => Ok(true),
            Inbound::AuthInvalid { message } => {
                tracing::error!(message = ?message, "authentication rejected");
                Ok(false)
            }
            other => {
                tracing::error!(?other, "unexpected message during handshake");
                Ok(false)
            }
        }
    }

    /// After `auth_ok`: optionally fetch states and seed the mirror,
    /// optionally subscribe to events.
    async fn run_post_auth(
        &self,
        connection: &Connection,
        opts: &ConnectOptions,
        cancellation: &CancellationToken,
    ) -> Result<(), SessionError> {
        if opts.get_states_on_connect {
            let (_, reply) = connection
                .coordinator
                .send_command_and_await(
                    Outbound::GetStates { id: 0 },
                    cancellation,
                    self.config.socket_timeout,
                )
                .await?;
            match reply {
                Inbound::Result {
                    result: CommandResult::States(states),
                    ..
                } => self.state.load(states).await,
                other => {
                    return Err(SessionError::Protocol(format!(
                        "get_states reply did not decode as a state list: {other:?}"
                    )));
                }
            }
        }

        if opts.subscribe_events {
            let (_, reply) = connection
                .coordinator
                .send_command_and_await(
                    Outbound::SubscribeEvents {
                        id: 0,
                        event_type: opts.event_type_filter.clone(),
                    },
                    cancellation,
                    self.config.socket_timeout,
                )
                .await?;
            match reply {
                Inbound::Result { success: true, .. } => {}
                Inbound::Result { success: false, .. } => {
                    return Err(SessionError::Protocol(
                        "subscribe_events returned success=false".to_string(),
                    ));
                }
                other => {
                    return Err(SessionError::Protocol(format!(
                        "subscribe_events reply was not a result: {other:?}"
                    )));
                }
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    /// Fetch the server configuration.
    pub async fn get_config(&self) -> Result<HassConfig, SessionError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;

        let (_, reply) = connection
            .coordinator
            .send_command_and_await(
                Outbound::GetConfig { id: 0 },
                &connection.cancellation,
                self.config.socket_timeout,
            )
            .await?;

        match reply {
            Inbound::Result {
                result: CommandResult::Config(cfg),
                ..
            } => Ok(cfg),
            other => Err(SessionError::Protocol(format!(
                "get_config reply did not decode as HassConfig: {other:?}"
            ))),
        }
    }

    /// Fetch the current bulk state list directly from the server (does not
    /// touch the connect-time state mirror).
    pub async fn get_states(&self) -> Result<Vec<HassState>, SessionError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;

        let (_, reply) = connection
            .coordinator
            .send_command_and_await(
                Outbound::GetStates { id: 0 },
                &connection.cancellation,
                self.config.socket_timeout,
            )
            .await?;

        match reply {
            Inbound::Result {
                result: CommandResult::States(states),
                ..
            } => Ok(states),
            other => Err(SessionError::Protocol(format!(
                "get_states reply did not decode as a state list: {other:?}"
            ))),
        }
    }

    /// Call a Home Assistant service. Returns `result.success`; a timeout
    /// surfaces as `false` rather than an error, matching `Ping`. Session
    /// cancellation (an explicit `close`) still propagates as `Cancelled`.
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<serde_json::Value>,
    ) -> Result<bool, SessionError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;

        let outcome = connection
            .coordinator
            .send_command_and_await(
                Outbound::CallService {
                    id: 0,
                    domain: domain.to_string(),
                    service: service.to_string(),
                    service_data,
                },
                &connection.cancellation,
                self.config.socket_timeout,
            )
            .await;

        match outcome {
            Ok((_, Inbound::Result { success, .. })) => Ok(success),
            Ok((_, other)) => Err(SessionError::Protocol(format!(
                "call_service reply was not a result: {other:?}"
            ))),
            Err(SessionError::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Subscribe to events, optionally filtered by `event_type`. Returns the
    /// subscription id (the command id), which `unsubscribe_events` takes.
    pub async fn subscribe_to_events(
        &self,
        event_type: Option<String>,
    ) -> Result<u64, SessionError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;

        let (id, reply) = connection
            .coordinator
            .send_command_and_await(
                Outbound::SubscribeEvents { id: 0, event_type },
                &connection.cancellation,
                self.config.socket_timeout,
            )
            .await?;

        match reply {
            Inbound::Result { success: true, .. } => Ok(id),
            Inbound::Result { success: false, .. } => Err(SessionError::Protocol(
                "subscribe_events returned success=false".to_string(),
            )),
            other => Err(SessionError::Protocol(format!(
                "subscribe_events reply was not a result: {other:?}"
            ))),
        }
    }

    /// Cancel a live event subscription.
    pub async fn unsubscribe_events(&self, subscription: u64) -> Result<(), SessionError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;

        let (_, reply) = connection
            .coordinator
            .send_command_and_await(
                Outbound::UnsubscribeEvents {
                    id: 0,
                    subscription,
                },
                &connection.cancellation,
                self.config.socket_timeout,
            )
            .await?;

        match reply {
            Inbound::Result { success: true, .. } => Ok(()),
            Inbound::Result { success: false, .. } => Err(SessionError::Protocol(
                "unsubscribe_events returned success=false".to_string(),
            )),
            other => Err(SessionError::Protocol(format!(
                "unsubscribe_events reply was not a result: {other:?}"
            ))),
        }
    }

    /// Send a `ping` and wait up to `timeout` for the matching `pong`.
    /// Returns `false` on timeout or transport error (both logged);
    /// session cancellation still propagates as `Cancelled`.
    pub async fn ping(&self, timeout: Duration) -> Result<bool, SessionError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;

        let outcome = connection
            .coordinator
            .send_command_and_await(Outbound::Ping { id: 0 }, &connection.cancellation, timeout)
            .await;

        match outcome {
            Ok((_, Inbound::Pong { .. })) => Ok(true),
            Ok((_, other)) => {
                tracing::warn!(?other, "ping reply was not a pong");
                Ok(false)
            }
            Err(SessionError::Timeout) => Ok(false),
            Err(SessionError::Cancelled) => Err(SessionError::Cancelled),
            Err(e) => {
                tracing::error!(error = %e, "ping failed");
                Ok(false)
            }
        }
    }

    /// Block until the next event arrives, honoring session cancellation.
    pub async fn read_event(&self) -> Result<EventRecord, SessionError> {
        let guard = self.connection.read().await;
        let connection = guard.as_ref().ok_or(SessionError::NotConnected)?;

        let mut event_rx = connection.event_rx.lock().await;
        tokio::select! {
            biased;
            _ = connection.cancellation.cancelled() => Err(SessionError::Cancelled),
            event = event_rx.recv() => event.ok_or(SessionError::Cancelled),
        }
    }

    // -----------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------

    /// Idempotent graceful shutdown, following the `ClosingGracefully`
    /// ordering: send the close frame and wait (bounded by
    /// `max_close_wait`) for the reader to observe the peer's close
    /// response, *then* cancel the session to unblock both pumps, then
    /// wait for them to terminate. Resets internal state so the session
    /// object is reusable for a subsequent `connect`.
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut closing = self.closing.lock().await;
        if *closing {
            return Ok(());
        }
        *closing = true;
        drop(closing);

        // Step 1: ask the writer to send the close frame directly, and take
        // the peer-closed mailbox out so we can await it below. Held only
        // under a read lock — in-flight callers (e.g. `call_service`
        // awaiting a reply) hold their own read guard across the await, so
        // taking the write lock here would deadlock against them.
        let peer_closed_rx = {
            let guard = self.connection.read().await;
            match guard.as_ref() {
                Some(connection) => {
                    if let Err(e) = connection.coordinator.request_close() {
                        tracing::debug!(error = %e, "failed to enqueue close frame");
                    }
                    connection.peer_closed_rx.lock().await.take()
                }
                None => None,
            }
        };

        // Step 2: wait for the reader to observe the peer's close frame
        // before touching the cancellation token — cancelling first would
        // let the reader exit on its next poll without ever draining the
        // peer's response.
        if let Some(peer_closed_rx) = peer_closed_rx {
            match tokio::time::timeout(self.config.max_close_wait, peer_closed_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    tracing::debug!("reader exited before observing the peer's close frame");
                }
                Err(_) => tracing::warn!("timed out waiting for the peer's close frame"),
            }
        }

        // Step 3: cancel — unblocks both pumps and any caller still
        // awaiting a reply, under only a read lock for the same reason as
        // above.
        if let Some(connection) = self.connection.read().await.as_ref() {
            connection.cancellation.cancel();
        }

        if let Some(connection) = self.connection.write().await.take() {
            self.teardown(connection).await;
        }

        *self.closing.lock().await = false;
        Ok(())
    }

    /// Cancel the session (idempotent if `close` already did) and wait
    /// (bounded by `max_close_wait`) for both pumps to terminate.
    async fn teardown(&self, connection: Connection) {
        connection.cancellation.cancel();

        let wait = tokio::time::timeout(self.config.max_close_wait, async {
            let _ = connection.reader_handle.await;
            let _ = connection.writer_handle.await;
        })
        .await;

        if wait.is_err() {
            tracing::warn!("timed out waiting for reader/writer pumps to terminate on close");
        }
    }
}

/// Convenience constructor mirroring [`Session::new`] with the default
/// configuration, for callers that don't need to tune timeouts.
impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

/// Shared handle alias for callers that want to hand a `Session` to
/// multiple tasks (e.g. one polling `read_event`, others issuing commands).
pub type SharedSession = Arc<Session>;

#[cfg(test)]
mod tests {
    use super::*;
    use hass_core::transport::{FrameKind, TransportError, TransportReader, TransportWriter};
    use std::collections::VecDeque;
    use std::sync::Arc as StdArc;
    use tokio::sync::Mutex as TokioMutex;

    /// An in-memory transport double: a scripted queue of inbound frames
    /// plus a log of every outbound frame sent, so tests can assert on
    /// both directions without a real socket.
    struct MockTransport {
        inbound: StdArc<TokioMutex<VecDeque<FrameKind>>>,
        outbound: StdArc<TokioMutex<Vec<String>>>,
    }

    impl MockTransport {
        fn new(scripted: Vec<FrameKind>) -> Self {
            Self {
                inbound: StdArc::new(TokioMutex::new(scripted.into())),
                outbound: StdArc::new(TokioMutex::new(Vec::new())),
            }
        }

        fn outbound_log(&self) -> StdArc<TokioMutex<Vec<String>>> {
            StdArc::clone(&self.outbound)
        }
    }

    struct MockReader {
        inbound: StdArc<TokioMutex<VecDeque<FrameKind>>>,
    }

    impl TransportReader for MockReader {
        async fn receive(&mut self) -> Result<Option<FrameKind>, TransportError> {
            loop {
                if let Some(frame) = self.inbound.lock().await.pop_front() {
                    return Ok(Some(frame));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    struct MockWriter {
        outbound: StdArc<TokioMutex<Vec<String>>>,
        /// Shared with `MockReader`: `close_output` pushes a `FrameKind::Close`
        /// here, the way a real peer echoes a close frame back once it sees
        /// ours — lets tests exercise the reader actually observing it.
        inbound: StdArc<TokioMutex<VecDeque<FrameKind>>>,
    }

    impl TransportWriter for MockWriter {
        async fn send(&mut self, text: &str) -> Result<(), TransportError> {
            self.outbound.lock().await.push(text.to_string());
            Ok(())
        }

        async fn close_output(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
            self.inbound.lock().await.push_back(FrameKind::Close);
            Ok(())
        }
    }

    impl Transport for MockTransport {
        type Reader = MockReader;
        type Writer = MockWriter;

        fn split(self) -> (Self::Reader, Self::Writer) {
            (
                MockReader {
                    inbound: StdArc::clone(&self.inbound),
                },
                MockWriter {
                    outbound: self.outbound,
                    inbound: self.inbound,
                },
            )
        }
    }

    fn text(json: serde_json::Value) -> FrameKind {
        FrameKind::Text(json.to_string())
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            socket_timeout: Duration::from_millis(200),
            channel_capacity: 32,
            receive_buffer_bytes: 4096,
            max_close_wait: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn happy_connect_returns_true() {
        let transport = MockTransport::new(vec![
            text(serde_json::json!({"type": "auth_required"})),
            text(serde_json::json!({"type": "auth_ok"})),
        ]);
        let session = Session::new(fast_config());
        let ok = session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();
        assert!(ok);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn auth_invalid_returns_false() {
        let transport = MockTransport::new(vec![
            text(serde_json::json!({"type": "auth_required"})),
            text(serde_json::json!({"type": "auth_invalid", "message": "nope"})),
        ]);
        let session = Session::new(fast_config());
        let ok = session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn auth_ok_without_leading_auth_required_skips_auth_send() {
        let transport = MockTransport::new(vec![text(serde_json::json!({"type": "auth_ok"}))]);
        let log = transport.outbound_log();
        let session = Session::new(fast_config());
        let ok = session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();
        assert!(ok);
        assert!(log.lock().await.is_empty(), "no auth message should be sent");
    }

    #[tokio::test]
    async fn get_states_on_connect_seeds_state_mirror() {
        let states: Vec<_> = (0..19)
            .map(|i| {
                serde_json::json!({
                    "entity_id": format!("sensor.s{i}"),
                    "state": "on",
                    "attributes": {},
                    "last_changed": "2024-01-01T00:00:00Z",
                    "last_updated": "2024-01-01T00:00:00Z",
                })
            })
            .collect();

        let transport = MockTransport::new(vec![
            text(serde_json::json!({"type": "auth_ok"})),
            text(serde_json::json!({"id": 2, "type": "result", "success": true, "result": states})),
        ]);
        let session = Session::new(fast_config());
        let ok = session
            .connect_with_transport(
                transport,
                "TOKEN",
                ConnectOptions {
                    get_states_on_connect: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(session.state_mirror().len().await, 19);
    }

    #[tokio::test]
    async fn unexpected_reply_id_before_expected_one_is_resolved_to_the_right_caller() {
        let transport = MockTransport::new(vec![
            text(serde_json::json!({"type": "auth_ok"})),
            text(serde_json::json!({"id": 12345, "type": "result", "success": false, "result": null})),
            text(serde_json::json!({
                "id": 2, "type": "result", "success": true,
                "result": {
                    "version": "2024.1.0",
                    "location_name": "Home",
                    "latitude": 1.0,
                    "longitude": 2.0,
                    "time_zone": "UTC",
                    "components": [],
                    "unit_system": {},
                },
            })),
        ]);
        let session = Session::new(fast_config());
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        let cfg = session.get_config().await.unwrap();
        assert_eq!(cfg.location_name, "Home");
    }

    #[tokio::test]
    async fn call_service_success() {
        let transport = MockTransport::new(vec![
            text(serde_json::json!({"type": "auth_ok"})),
            text(serde_json::json!({"id": 2, "type": "result", "success": true, "result": {}})),
        ]);
        let session = Session::new(fast_config());
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        let ok = session
            .call_service("light", "turn_on", Some(serde_json::json!({"entity_id": "light.x"})))
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn ping_pong_round_trip() {
        let transport = MockTransport::new(vec![
            text(serde_json::json!({"type": "auth_ok"})),
            text(serde_json::json!({"id": 2, "type": "pong"})),
        ]);
        let session = Session::new(fast_config());
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        let pong = session.ping(Duration::from_millis(200)).await.unwrap();
        assert!(pong);
    }

    #[tokio::test]
    async fn ping_times_out_to_false_without_a_reply() {
        let transport = MockTransport::new(vec![text(serde_json::json!({"type": "auth_ok"}))]);
        let session = Session::new(fast_config());
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        let pong = session.ping(Duration::from_millis(30)).await.unwrap();
        assert!(!pong);
    }

    #[tokio::test]
    async fn close_observes_the_peers_close_frame_before_cancelling() {
        let transport = MockTransport::new(vec![text(serde_json::json!({"type": "auth_ok"}))]);
        let session = Session::new(fast_config());
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        // Nothing is queued for the reader at this point — the mock writer
        // only pushes `FrameKind::Close` (echoing a real peer's close
        // response) once it actually processes the close request. If
        // `close` observes that frame (rather than cancelling first and
        // racing the reader), this returns well under `max_close_wait`.
        let started = std::time::Instant::now();
        session.close().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "close should have observed the peer's close frame instead of waiting out max_close_wait"
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = MockTransport::new(vec![text(serde_json::json!({"type": "auth_ok"}))]);
        let session = Session::new(fast_config());
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn pending_call_surfaces_cancelled_when_closed_mid_flight() {
        let transport = MockTransport::new(vec![text(serde_json::json!({"type": "auth_ok"}))]);
        let session = StdArc::new(Session::new(SessionConfig {
            socket_timeout: Duration::from_secs(5),
            ..fast_config()
        }));
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        let session_for_call = StdArc::clone(&session);
        let call = tokio::spawn(async move {
            session_for_call
                .call_service("light", "turn_on", None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close().await.unwrap();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(SessionError::Cancelled)));
    }

    #[tokio::test]
    async fn connect_rejects_empty_url() {
        let session = Session::new(fast_config());
        let err = session
            .connect("", "TOKEN", ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument));
    }

    #[tokio::test]
    async fn connect_rejects_second_connect_while_already_connected() {
        let transport = MockTransport::new(vec![text(serde_json::json!({"type": "auth_ok"}))]);
        let session = Session::new(fast_config());
        session
            .connect_with_transport(transport, "TOKEN", ConnectOptions::default())
            .await
            .unwrap();

        let second = MockTransport::new(vec![text(serde_json::json!({"type": "auth_ok"}))]);
        let err = session
            .connect_with_transport(second, "TOKEN", ConnectOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyConnected));
    }
}
