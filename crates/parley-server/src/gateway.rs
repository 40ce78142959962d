//! Connection gateway for the relay.
//!
//! Owns the per-connection protocol state machine
//! (UNAUTHENTICATED → AUTHENTICATED → CLOSED) and liveness tracking.
//! Every outbound frame for a connection, whether a direct response or
//! a broker fan-out, goes through that connection's outbound queue and
//! is written by the single connection task, so socket writes are never
//! interleaved.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parley_core::{
    Broker, MessageStore, RelayError, RelayLimits, SubscriptionManager, TokenVerifier,
};
use parley_protocol::{codec, Frame, ProtocolError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Live connections, keyed by connection id. Values hold the username
/// once the connection authenticates.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Option<String>>,
}

impl ConnectionRegistry {
    /// Register a freshly accepted connection.
    pub fn insert(&self, connection_id: &str) {
        self.connections.insert(connection_id.to_string(), None);
    }

    /// Record the identity a connection authenticated as.
    pub fn set_username(&self, connection_id: &str, username: &str) {
        if let Some(mut entry) = self.connections.get_mut(connection_id) {
            *entry = Some(username.to_string());
        }
    }

    /// Drop a closed connection.
    pub fn remove(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether any connections are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Shared server state.
pub struct AppState {
    /// Bearer token verifier.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Durable room/message store.
    pub store: Arc<dyn MessageStore>,
    /// Broker adapter shared by every connection.
    pub broker: Arc<dyn Broker>,
    /// Live connection registry.
    pub registry: ConnectionRegistry,
    /// Server configuration.
    pub config: Config,
}

/// Run the HTTP/WebSocket server until shutdown is signalled.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    config: Config,
    verifier: Arc<dyn TokenVerifier>,
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn Broker>,
) -> Result<()> {
    let addr = config.bind_addr()?;
    let websocket_path = config.transport.websocket_path.clone();

    let state = Arc::new(AppState {
        verifier,
        store,
        broker,
        registry: ConnectionRegistry::default(),
        config,
    });

    let app = Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;

    info!("Parley relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, websocket_path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.len(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Whether the connection survives the frame it just handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Continue,
    Close,
}

/// Handle a WebSocket connection for its whole lifetime.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = generate_connection_id();
    state.registry.insert(&connection_id);
    debug!(connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Single-writer discipline: broker delivery tasks and the session
    // itself enqueue here; only this task writes to the socket.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let mut session = Session::new(connection_id.clone(), Arc::clone(&state), outbound_tx);

    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut alive = true;
    let mut clean_close = false;
    let mut server_closed = false;

    'conn: loop {
        tokio::select! {
            biased;

            Some(frame) = outbound_rx.recv() => {
                if send_frame(&mut sender, &frame).await.is_err() {
                    break 'conn;
                }
            }

            _ = heartbeat.tick() => {
                if !alive {
                    warn!(connection = %connection_id, "Heartbeat missed, terminating connection");
                    server_closed = true;
                    break 'conn;
                }
                alive = false;
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break 'conn;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let started = Instant::now();
                        metrics::record_message(text.len(), "inbound");
                        feed(&mut read_buffer, text.as_bytes());
                        if drain_frames(&mut read_buffer, &mut session).await == Disposition::Close {
                            server_closed = true;
                            break 'conn;
                        }
                        metrics::record_latency(started.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let started = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        feed(&mut read_buffer, &data);
                        if drain_frames(&mut read_buffer, &mut session).await == Disposition::Close {
                            server_closed = true;
                            break 'conn;
                        }
                        metrics::record_latency(started.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break 'conn;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        alive = true;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        clean_close = true;
                        break 'conn;
                    }
                    Some(Err(err)) => {
                        warn!(connection = %connection_id, error = %err, "WebSocket error");
                        metrics::record_error("websocket");
                        break 'conn;
                    }
                    None => {
                        break 'conn;
                    }
                }
            }
        }
    }

    // Flush frames enqueued on the way out, the AUTH failure ERROR in
    // particular. Best-effort; the socket may already be gone.
    while let Ok(frame) = outbound_rx.try_recv() {
        if send_frame(&mut sender, &frame).await.is_err() {
            break;
        }
    }

    if !clean_close && !server_closed {
        warn!(connection = %connection_id, "Connection closed uncleanly");
    }

    // Cleanup is unconditional and idempotent, whatever the close path.
    session.teardown().await;
    state.registry.remove(&connection_id);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

fn generate_connection_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("conn_{:x}", timestamp)
}

/// Buffer an incoming WebSocket message. Message boundaries already
/// delimit frames, so a missing trailing newline is supplied.
fn feed(buf: &mut BytesMut, data: &[u8]) {
    buf.extend_from_slice(data);
    if !data.ends_with(b"\n") {
        buf.extend_from_slice(b"\n");
    }
}

/// Decode and dispatch every buffered frame.
async fn drain_frames(buf: &mut BytesMut, session: &mut Session) -> Disposition {
    loop {
        match codec::decode_from(buf) {
            Ok(Some(frame)) => {
                if session.handle_frame(frame).await == Disposition::Close {
                    return Disposition::Close;
                }
            }
            Ok(None) => return Disposition::Continue,
            Err(err @ ProtocolError::FrameTooLarge(_)) => {
                metrics::record_error("protocol");
                session.push(Frame::error(err.to_string()));
                return Disposition::Close;
            }
            Err(err) => {
                // Unknown type or malformed JSON: report it, keep the
                // connection open.
                metrics::record_error("protocol");
                session.push(Frame::error(err.to_string()));
            }
        }
    }
}

/// Encode and write one frame to the socket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    match codec::encode_string(frame) {
        Ok(line) => {
            metrics::record_message(line.len(), "outbound");
            sender.send(Message::Text(line)).await
        }
        Err(err) => {
            error!(error = %err, "Failed to encode outbound frame");
            Ok(())
        }
    }
}

/// Per-connection protocol state machine.
///
/// The subscription manager exists only once the connection has
/// authenticated; its absence *is* the UNAUTHENTICATED state.
struct Session {
    connection_id: String,
    state: Arc<AppState>,
    outbound: mpsc::UnboundedSender<Frame>,
    manager: Option<SubscriptionManager>,
}

impl Session {
    fn new(
        connection_id: String,
        state: Arc<AppState>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            connection_id,
            state,
            outbound,
            manager: None,
        }
    }

    /// Dispatch one decoded frame.
    async fn handle_frame(&mut self, frame: Frame) -> Disposition {
        match frame {
            Frame::Auth { token } => self.handle_auth(&token).await,

            Frame::Join { room_id } => {
                let Some(manager) = self.manager.as_mut() else {
                    self.reject_unauthenticated("JOIN");
                    return Disposition::Continue;
                };
                match manager.join(&room_id).await {
                    Ok(()) => metrics::record_subscription(),
                    Err(err) => self.report(err),
                }
                Disposition::Continue
            }

            Frame::Leave { room_id } => {
                let Some(manager) = self.manager.as_mut() else {
                    self.reject_unauthenticated("LEAVE");
                    return Disposition::Continue;
                };
                if let Err(err) = manager.leave(&room_id).await {
                    self.report(err);
                }
                Disposition::Continue
            }

            Frame::Message { room_id, content } => {
                let Some(manager) = self.manager.as_mut() else {
                    self.reject_unauthenticated("MESSAGE");
                    return Disposition::Continue;
                };
                if let Err(err) = manager.send(&room_id, &content).await {
                    self.report(err);
                }
                Disposition::Continue
            }

            // Server-bound only; a client sending these is confused.
            other => {
                self.push(Frame::error(format!(
                    "Unexpected frame type: {}",
                    other.frame_type()
                )));
                Disposition::Continue
            }
        }
    }

    async fn handle_auth(&mut self, token: &str) -> Disposition {
        if let Some(manager) = &self.manager {
            debug!(
                connection = %self.connection_id,
                user = %manager.username(),
                "Duplicate AUTH ignored"
            );
            self.push(Frame::error("Already authenticated"));
            return Disposition::Continue;
        }

        match self.state.verifier.verify(token).await {
            Ok(identity) => {
                info!(
                    connection = %self.connection_id,
                    user = %identity.username,
                    "User authenticated"
                );
                self.state
                    .registry
                    .set_username(&self.connection_id, &identity.username);

                let limits = RelayLimits {
                    history_limit: self.state.config.store.history_limit,
                    op_timeout: Duration::from_millis(
                        self.state.config.limits.operation_timeout_ms,
                    ),
                };
                self.manager = Some(SubscriptionManager::new(
                    identity.username.clone(),
                    Arc::clone(&self.state.broker),
                    Arc::clone(&self.state.store),
                    limits,
                    self.outbound.clone(),
                ));

                self.push(Frame::auth_success(identity.username));
                Disposition::Continue
            }
            Err(err) => {
                warn!(connection = %self.connection_id, "Authentication failed");
                self.report(err);
                // Fail fast: the client must reconnect and resend AUTH.
                Disposition::Close
            }
        }
    }

    /// Release everything the connection owns. Safe to call on any
    /// close path, clean or not.
    async fn teardown(&mut self) {
        if let Some(manager) = self.manager.as_mut() {
            manager.shutdown().await;
        }
    }

    fn reject_unauthenticated(&self, frame_type: &str) {
        debug!(
            connection = %self.connection_id,
            frame = %frame_type,
            "Frame received before AUTH"
        );
        self.report(RelayError::NotAuthenticated);
    }

    fn report(&self, err: RelayError) {
        metrics::record_error(error_kind(&err));
        self.push(Frame::error(err.to_string()));
    }

    fn push(&self, frame: Frame) {
        let _ = self.outbound.send(frame);
    }
}

fn error_kind(err: &RelayError) -> &'static str {
    match err {
        RelayError::AuthFailure => "auth",
        RelayError::NotAuthenticated => "not_authenticated",
        RelayError::RoomNotFound(_) => "room_not_found",
        RelayError::BrokerUnavailable(_) => "broker",
        RelayError::StoreUnavailable(_) => "store",
        RelayError::InvalidFrame(_) => "invalid_frame",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parley_core::{
        ChatMessage, DeliveryCallback, Identity, Room, SubscriptionHandle,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticVerifier;

    #[async_trait]
    impl TokenVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> parley_core::Result<Identity> {
            if token == "good" {
                Ok(Identity {
                    username: "alice".to_string(),
                })
            } else {
                Err(RelayError::AuthFailure)
            }
        }
    }

    struct TestStore;

    #[async_trait]
    impl MessageStore for TestStore {
        async fn find_room(&self, room_id: &str) -> parley_core::Result<Option<Room>> {
            if room_id == "r1" {
                Ok(Some(Room {
                    room_id: "r1".to_string(),
                    name: "general".to_string(),
                    description: None,
                    created_by: None,
                    created_at: 0,
                }))
            } else {
                Ok(None)
            }
        }

        async fn append_message(
            &self,
            room_id: &str,
            sender: &str,
            content: &str,
            timestamp: i64,
        ) -> parley_core::Result<ChatMessage> {
            Ok(ChatMessage {
                id: "m0".to_string(),
                room_id: room_id.to_string(),
                sender: sender.to_string(),
                content: content.to_string(),
                timestamp,
            })
        }

        async fn recent_messages(
            &self,
            _room_id: &str,
            _limit: usize,
        ) -> parley_core::Result<Vec<ChatMessage>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct TestBroker {
        subscribes: AtomicUsize,
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl Broker for TestBroker {
        async fn ensure(&self, _room_id: &str) -> parley_core::Result<()> {
            Ok(())
        }

        async fn publish(&self, _room_id: &str, _payload: Bytes) -> parley_core::Result<()> {
            Ok(())
        }

        async fn subscribe(
            &self,
            room_id: &str,
            _on_message: DeliveryCallback,
        ) -> parley_core::Result<SubscriptionHandle> {
            let n = self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(SubscriptionHandle::new(room_id, format!("test-{n}")))
        }

        async fn cancel(&self, _handle: SubscriptionHandle) -> parley_core::Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session_with_broker(
        broker: Arc<TestBroker>,
    ) -> (Session, mpsc::UnboundedReceiver<Frame>) {
        let state = Arc::new(AppState {
            verifier: Arc::new(StaticVerifier),
            store: Arc::new(TestStore),
            broker,
            registry: ConnectionRegistry::default(),
            config: Config::default(),
        });
        state.registry.insert("conn_test");
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new("conn_test".to_string(), state, tx), rx)
    }

    fn session() -> (Session, mpsc::UnboundedReceiver<Frame>) {
        session_with_broker(Arc::new(TestBroker::default()))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_join_before_auth_is_rejected() {
        let broker = Arc::new(TestBroker::default());
        let (mut session, mut rx) = session_with_broker(Arc::clone(&broker));

        let disposition = session.handle_frame(Frame::join("r1")).await;

        assert_eq!(disposition, Disposition::Continue, "connection stays open");
        assert_eq!(drain(&mut rx), vec![Frame::error("Not authenticated")]);
        assert_eq!(broker.subscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_auth_then_join_succeeds() {
        let (mut session, mut rx) = session();

        assert_eq!(
            session.handle_frame(Frame::auth("good")).await,
            Disposition::Continue
        );
        assert_eq!(drain(&mut rx), vec![Frame::auth_success("alice")]);

        assert_eq!(
            session.handle_frame(Frame::join("r1")).await,
            Disposition::Continue
        );
        let frames = drain(&mut rx);
        assert_eq!(frames[0], Frame::join_success("r1", "general"));
        assert_eq!(frames[1], Frame::message_history("r1", vec![]));
    }

    #[tokio::test]
    async fn test_auth_failure_closes_connection() {
        let (mut session, mut rx) = session();

        assert_eq!(
            session.handle_frame(Frame::auth("bad")).await,
            Disposition::Close
        );
        assert_eq!(drain(&mut rx), vec![Frame::error("Authentication failed")]);
    }

    #[tokio::test]
    async fn test_duplicate_auth_keeps_connection_open() {
        let (mut session, mut rx) = session();

        session.handle_frame(Frame::auth("good")).await;
        drain(&mut rx);

        assert_eq!(
            session.handle_frame(Frame::auth("good")).await,
            Disposition::Continue
        );
        assert_eq!(drain(&mut rx), vec![Frame::error("Already authenticated")]);
    }

    #[tokio::test]
    async fn test_join_unknown_room_reports_not_found() {
        let (mut session, mut rx) = session();
        session.handle_frame(Frame::auth("good")).await;
        drain(&mut rx);

        session.handle_frame(Frame::join("nope")).await;

        let frames = drain(&mut rx);
        assert_eq!(frames, vec![Frame::error("Room not found: nope")]);
    }

    #[tokio::test]
    async fn test_client_bound_frame_is_rejected() {
        let (mut session, mut rx) = session();

        session
            .handle_frame(Frame::auth_success("impostor"))
            .await;

        assert_eq!(
            drain(&mut rx),
            vec![Frame::error("Unexpected frame type: AUTH_SUCCESS")]
        );
    }

    #[tokio::test]
    async fn test_teardown_cancels_subscriptions() {
        let broker = Arc::new(TestBroker::default());
        let (mut session, mut rx) = session_with_broker(Arc::clone(&broker));

        session.handle_frame(Frame::auth("good")).await;
        session.handle_frame(Frame::join("r1")).await;
        drain(&mut rx);

        session.teardown().await;
        assert_eq!(broker.cancels.load(Ordering::SeqCst), 1);

        // Teardown is idempotent.
        session.teardown().await;
        assert_eq!(broker.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_handles_unknown_and_malformed_lines() {
        let (mut session, mut rx) = session();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"type\":\"SHRUG\"}\nnot json\n");

        assert_eq!(
            drain_frames(&mut buf, &mut session).await,
            Disposition::Continue
        );

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Error { message } => assert!(message.contains("SHRUG")),
            other => panic!("Expected ERROR, got {other:?}"),
        }
    }
}
