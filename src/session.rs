use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router as HttpRouter,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{StateBroadcaster, StateMirror};
use crate::discovery::{DiscoveredController, DiscoveryService, DEFAULT_PROBE_TIMEOUT};
use crate::identity::{DeviceIdentity, Role};
use crate::pairing::{PairingAuthority, PairingRequest, ResolvedPairing, DEFAULT_PAIRING_TIMEOUT};
use crate::player::{PlaybackEngine, PlayerState};
use crate::protocol::{DiscoverResponse, Message, PairRequest};
use crate::router::{Inbound, MessageRouter};
use crate::storage::BlobStore;
use crate::sync::{ProfileSynchronizer, DEFAULT_SYNC_TIMEOUT};
use crate::trust::TrustStore;

pub const DEFAULT_PORT: u16 = 8901;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// One active transport session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub status: ConnectionStatus,
    pub device_name: Option<String>,
}

/// Cheap clonable sender half of a session, used by handlers to reply.
/// Messages queue in send order; the writer task owns the socket sink.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: Uuid, peer: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, peer, outbound }
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| anyhow!("connection closed"))
    }
}

/// Curated lifecycle notifications for the layer that renders connection
/// lists and pairing prompts.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerConnected {
        connection_id: Uuid,
        peer: SocketAddr,
    },
    PeerDisconnected {
        connection_id: Uuid,
    },
    PairingRequested(PairingRequest),
    PairingResolved {
        connection_id: Uuid,
        accepted: bool,
        device_id: Option<String>,
    },
    CacheUpdated {
        uuid: String,
    },
    UserDataMerged {
        uuid: String,
    },
    StateUpdated(PlayerState),
}

/// Bounded exponential backoff for reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        (self.base_delay * factor).min(Duration::from_secs(30))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Listening port in server mode, probe port for discovery.
    pub port: u16,
    pub probe_timeout: Duration,
    pub sync_timeout: Duration,
    /// How long a surfaced pairing request may sit undecided before it is
    /// auto-rejected and the next queued one takes its place.
    pub pairing_timeout: Duration,
    pub reconnect: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            reconnect: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Off,
    Server,
    Client,
}

enum ModeState {
    Off,
    Server {
        shutdown: CancellationToken,
        task: JoinHandle<()>,
        port: u16,
    },
    Client {
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    },
}

/// Owns the operating mode, the transport sessions, and every protocol
/// service bound to them. One instance per process side; nothing in here is
/// a global.
pub struct SessionManager {
    identity: DeviceIdentity,
    config: SessionConfig,
    mode: Mutex<ModeState>,
    status: Mutex<ConnectionStatus>,
    connections: Arc<DashMap<Uuid, Connection>>,
    handles: Arc<DashMap<Uuid, ConnectionHandle>>,
    router: Arc<MessageRouter>,
    pairing: Arc<PairingAuthority>,
    sync: Arc<ProfileSynchronizer>,
    mirror: Arc<StateMirror>,
    broadcaster: Arc<StateBroadcaster>,
    trust: Arc<TrustStore>,
    discovery: DiscoveryService,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        identity: DeviceIdentity,
        config: SessionConfig,
        store: Arc<dyn BlobStore>,
        engine: Option<Arc<dyn PlaybackEngine>>,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(128);
        let trust = Arc::new(TrustStore::new(Arc::clone(&store))?);
        let pairing = Arc::new(PairingAuthority::new(
            identity.clone(),
            Arc::clone(&trust),
            config.pairing_timeout,
            events.clone(),
        ));
        let sync = Arc::new(ProfileSynchronizer::new(
            identity.role,
            store,
            config.sync_timeout,
            events.clone(),
        ));
        let mirror = Arc::new(StateMirror::new());
        let connections = Arc::new(DashMap::new());
        let router = Arc::new(MessageRouter::new(
            identity.role,
            Arc::clone(&pairing),
            Arc::clone(&sync),
            Arc::clone(&mirror),
            engine,
            Arc::clone(&connections),
            events.clone(),
        ));

        Ok(Arc::new(Self {
            discovery: DiscoveryService::new(config.probe_timeout),
            identity,
            config,
            mode: Mutex::new(ModeState::Off),
            status: Mutex::new(ConnectionStatus::Disconnected),
            connections,
            handles: Arc::new(DashMap::new()),
            router,
            pairing,
            sync,
            mirror,
            broadcaster: Arc::new(StateBroadcaster::new()),
            trust,
            events,
        }))
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn mode(&self) -> Mode {
        match &*self.mode.lock() {
            ModeState::Off => Mode::Off,
            ModeState::Server { .. } => Mode::Server,
            ModeState::Client { .. } => Mode::Client,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Generic tap over every decoded inbound message.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<Inbound> {
        self.router.subscribe()
    }

    pub fn trust(&self) -> &Arc<TrustStore> {
        &self.trust
    }

    pub fn synchronizer(&self) -> &Arc<ProfileSynchronizer> {
        &self.sync
    }

    pub fn mirror(&self) -> &Arc<StateMirror> {
        &self.mirror
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    /// Body served at `/api/discover`. Advertises the actually bound port
    /// when the listener is up.
    pub fn discover_response(&self) -> DiscoverResponse {
        let port = match &*self.mode.lock() {
            ModeState::Server { port, .. } => *port,
            _ => self.config.port,
        };
        DiscoverResponse {
            role: self.identity.role,
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            port,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Stop whatever the current mode has open. Idempotent; no messages are
    /// processed for the old session once this begins.
    pub async fn set_off(self: &Arc<Self>) {
        // Cancel while still holding the mode slot so a session task cannot
        // dispatch between the mode swap and the cancellation.
        let previous = {
            let mut mode = self.mode.lock();
            match &*mode {
                ModeState::Off => {}
                ModeState::Server { shutdown, .. } | ModeState::Client { shutdown, .. } => {
                    shutdown.cancel()
                }
            }
            std::mem::replace(&mut *mode, ModeState::Off)
        };
        match previous {
            ModeState::Off => {}
            ModeState::Server { task, port, .. } => {
                let _ = task.await;
                tracing::info!("stopped listening on port {port}");
            }
            ModeState::Client { task, .. } => {
                let _ = task.await;
            }
        }
        self.pairing.clear();
        self.broadcaster.detach();
        self.handles.clear();
        for entry in self.connections.iter() {
            let _ = self.events.send(SessionEvent::PeerDisconnected {
                connection_id: entry.id,
            });
        }
        self.connections.clear();
        *self.status.lock() = ConnectionStatus::Disconnected;
    }

    pub async fn disconnect(self: &Arc<Self>) {
        self.set_off().await;
    }

    pub async fn stop_server(self: &Arc<Self>) {
        self.set_off().await;
    }

    /// Enter server mode: discovery responder plus message transport on one
    /// listener. Returns the actually bound port (`config.port` 0 binds an
    /// ephemeral one). Inbound sessions are `Connected` immediately;
    /// pairing happens afterward in-band.
    pub async fn start_server(self: &Arc<Self>) -> Result<u16> {
        self.set_off().await;

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.status.lock() = ConnectionStatus::Error;
                return Err(e).context("failed to bind listening endpoint");
            }
        };
        let port = listener.local_addr()?.port();

        let shutdown = CancellationToken::new();
        let ctx = ServerCtx {
            manager: Arc::clone(self),
            shutdown: shutdown.clone(),
        };
        let app = HttpRouter::new()
            .route("/api/discover", get(discover_endpoint))
            .route("/ws", get(ws_endpoint))
            .with_state(ctx);

        let graceful = shutdown.clone();
        let task = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(async move { graceful.cancelled().await })
                .await
            {
                tracing::error!("listener error: {e}");
            }
        });

        *self.mode.lock() = ModeState::Server {
            shutdown,
            task,
            port,
        };
        tracing::info!("listening for players on port {port}");
        Ok(port)
    }

    /// Enter client mode with a single outbound session. Any prior session
    /// or server is torn down first. On success the pairing request goes
    /// out immediately.
    pub async fn connect_to_server(self: &Arc<Self>, address: IpAddr, port: u16) -> Result<()> {
        self.set_off().await;
        *self.status.lock() = ConnectionStatus::Connecting;

        let url = format!("ws://{address}:{port}/ws");
        let (stream, _) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.status.lock() = ConnectionStatus::Error;
                return Err(e).with_context(|| format!("failed to connect to {address}:{port}"));
            }
        };

        let conn_id = Uuid::new_v4();
        let peer = SocketAddr::new(address, port);
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let handle = ConnectionHandle::new(conn_id, peer, tx);
        let (mut ws_sender, mut ws_receiver) = stream.split();
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    queued = rx.recv() => {
                        let Some(msg) = queued else { break };
                        let json = match msg.encode() {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("failed to serialize message: {e}");
                                continue;
                            }
                        };
                        if ws_sender.send(WsMessage::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        let reader_shutdown = shutdown.clone();
        let reader_handle = handle.clone();
        let task = tokio::spawn(async move {
            let clean = loop {
                tokio::select! {
                    biased;
                    _ = reader_shutdown.cancelled() => break true,
                    incoming = ws_receiver.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if reader_shutdown.is_cancelled() {
                                break true;
                            }
                            manager.router.dispatch(&reader_handle, &text)
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break true,
                        Some(Err(e)) => {
                            tracing::debug!("socket error: {e}");
                            break false;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            };
            manager.broadcaster.detach();
            manager.unregister(conn_id);
            *manager.status.lock() = if clean {
                ConnectionStatus::Disconnected
            } else {
                ConnectionStatus::Error
            };
        });

        self.register(
            Connection {
                id: conn_id,
                peer,
                status: ConnectionStatus::Connected,
                device_name: None,
            },
            handle.clone(),
        );
        self.broadcaster.attach(handle.clone());
        *self.mode.lock() = ModeState::Client { shutdown, task };
        *self.status.lock() = ConnectionStatus::Connected;
        tracing::info!("connected to controller at {peer}");

        handle.send(Message::PairRequest(PairRequest {
            device_id: self.identity.device_id.clone(),
            device_name: self.identity.device_name.clone(),
            pin: None,
        }))?;
        Ok(())
    }

    /// `connect_to_server` with the configured bounded backoff.
    pub async fn connect_with_retry(self: &Arc<Self>, address: IpAddr, port: u16) -> Result<()> {
        let policy = self.config.reconnect;
        let mut attempt = 1u32;
        loop {
            match self.connect_to_server(address, port).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!("connect attempt {attempt} failed: {e}, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a discovery scan, refresh trusted-peer addresses from the
    /// results, then auto-connect to the first trusted match that opted in.
    pub async fn scan_and_auto_connect(self: &Arc<Self>) -> Result<Vec<DiscoveredController>> {
        let discovered = self.discovery.scan(self.config.port).await?;
        for controller in &discovered {
            self.trust.refresh_address(
                &controller.device_id,
                IpAddr::V4(controller.address),
                controller.port,
            )?;
        }

        if self.identity.role == Role::Player {
            if let Some(hit) = self.trust.first_auto_connect_match(&discovered).cloned() {
                if let Err(e) = self
                    .connect_with_retry(IpAddr::V4(hit.address), hit.port)
                    .await
                {
                    tracing::warn!("auto-connect to {} failed: {e}", hit.device_name);
                }
            }
        }
        Ok(discovered)
    }

    pub fn pending_pairing(&self) -> Option<PairingRequest> {
        self.pairing.pending()
    }

    /// Operator accepted the surfaced pairing request.
    pub fn accept_pairing(
        &self,
        remember: bool,
        auto_connect: bool,
    ) -> Result<Option<ResolvedPairing>> {
        let resolved = self.pairing.accept(remember, auto_connect)?;
        if let Some(resolved) = &resolved {
            if let Some(mut conn) = self.connections.get_mut(&resolved.connection_id) {
                conn.device_name = Some(resolved.device_name.clone());
            }
            self.emit_pairing_resolution(resolved);
        }
        Ok(resolved)
    }

    /// Operator rejected the surfaced pairing request.
    pub fn reject_pairing(&self) -> Result<Option<ResolvedPairing>> {
        let resolved = self.pairing.reject()?;
        if let Some(resolved) = &resolved {
            self.emit_pairing_resolution(resolved);
        }
        Ok(resolved)
    }

    fn emit_pairing_resolution(&self, resolved: &ResolvedPairing) {
        let _ = self.events.send(SessionEvent::PairingResolved {
            connection_id: resolved.connection_id,
            accepted: resolved.accepted,
            device_id: Some(resolved.device_id.clone()),
        });
    }

    pub fn send(&self, connection_id: Uuid, message: Message) -> Result<()> {
        let handle = self
            .handles
            .get(&connection_id)
            .map(|e| e.value().clone())
            .with_context(|| format!("no session {connection_id}"))?;
        handle.send(message)
    }

    /// Bootstrap the active profile from the connected controller.
    pub async fn request_full_sync(&self) -> Result<()> {
        let handle = self.single_handle()?;
        self.sync.request_full(&handle).await
    }

    /// Push the local user-data snapshot to the peer for merging.
    pub fn push_user_data(&self) -> Result<()> {
        let handle = self.single_handle()?;
        self.sync.push_user_data(&handle)
    }

    /// Player-side telemetry out. One message per state change.
    pub fn publish_state(&self, state: PlayerState) {
        self.broadcaster.publish(state);
    }

    fn single_handle(&self) -> Result<ConnectionHandle> {
        self.handles
            .iter()
            .next()
            .map(|e| e.value().clone())
            .context("not connected")
    }

    fn register(&self, connection: Connection, handle: ConnectionHandle) {
        let _ = self.events.send(SessionEvent::PeerConnected {
            connection_id: connection.id,
            peer: connection.peer,
        });
        self.handles.insert(connection.id, handle);
        self.connections.insert(connection.id, connection);
    }

    /// Idempotent: unregistering an unknown or already-removed session is a
    /// no-op.
    fn unregister(&self, connection_id: Uuid) {
        self.handles.remove(&connection_id);
        if self.connections.remove(&connection_id).is_some() {
            let _ = self
                .events
                .send(SessionEvent::PeerDisconnected { connection_id });
        }
    }
}

#[derive(Clone)]
struct ServerCtx {
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
}

async fn discover_endpoint(State(ctx): State<ServerCtx>) -> Json<DiscoverResponse> {
    Json(ctx.manager.discover_response())
}

async fn ws_endpoint(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(ctx): State<ServerCtx>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_inbound_session(socket, peer, ctx))
}

async fn handle_inbound_session(socket: WebSocket, peer: SocketAddr, ctx: ServerCtx) {
    let manager = ctx.manager;
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let handle = ConnectionHandle::new(conn_id, peer, tx);

    manager.register(
        Connection {
            id: conn_id,
            peer,
            status: ConnectionStatus::Connected,
            device_name: None,
        },
        handle.clone(),
    );
    tracing::info!("player session {conn_id} from {peer}");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match msg.encode() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("failed to serialize message: {e}");
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::debug!("send failed: {e}");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(AxumWsMessage::Text(text))) => {
                    if ctx.shutdown.is_cancelled() {
                        break;
                    }
                    manager.router.dispatch(&handle, &text)
                }
                Some(Ok(AxumWsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!("socket error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    manager.unregister(conn_id);
    send_task.abort();
    tracing::info!("player session {conn_id} closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(30), Duration::from_secs(30));
    }
}
