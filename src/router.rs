use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::broadcast::StateMirror;
use crate::identity::Role;
use crate::pairing::PairingAuthority;
use crate::player::{CommandKind, PlaybackEngine};
use crate::protocol::{Decoded, Message};
use crate::session::{Connection, ConnectionHandle, SessionEvent};
use crate::sync::ProfileSynchronizer;

/// An inbound message paired with the session it arrived on, published on
/// the generic tap for any layer that wants to observe traffic.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub connection_id: Uuid,
    pub message: Message,
}

/// Dispatches each inbound message to exactly one handler by type. Unknown
/// types are logged and dropped so an older build survives a newer peer;
/// protocol errors never tear the connection down.
pub struct MessageRouter {
    role: Role,
    tap: broadcast::Sender<Inbound>,
    pairing: Arc<PairingAuthority>,
    sync: Arc<ProfileSynchronizer>,
    mirror: Arc<StateMirror>,
    engine: Option<Arc<dyn PlaybackEngine>>,
    connections: Arc<DashMap<Uuid, Connection>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Role,
        pairing: Arc<PairingAuthority>,
        sync: Arc<ProfileSynchronizer>,
        mirror: Arc<StateMirror>,
        engine: Option<Arc<dyn PlaybackEngine>>,
        connections: Arc<DashMap<Uuid, Connection>>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (tap, _) = broadcast::channel(128);
        Self {
            role,
            tap,
            pairing,
            sync,
            mirror,
            engine,
            connections,
            events,
        }
    }

    /// Subscribe to every successfully decoded inbound message.
    pub fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.tap.subscribe()
    }

    pub fn dispatch(&self, handle: &ConnectionHandle, text: &str) {
        let message = match Message::decode(text) {
            Ok(Decoded::Known(message)) => message,
            Ok(Decoded::Unknown(kind)) => {
                tracing::warn!("dropping message of unknown type \"{kind}\"");
                return;
            }
            Err(e) => {
                tracing::warn!("dropping malformed message: {e}");
                return;
            }
        };

        let _ = self.tap.send(Inbound {
            connection_id: handle.id,
            message: message.clone(),
        });

        match message {
            Message::PairRequest(request) => {
                if self.role != Role::Controller {
                    tracing::warn!("ignoring pair request: not in controller role");
                    return;
                }
                self.pairing.submit(handle.clone(), request);
            }
            Message::PairResponse(response) => {
                if response.accepted {
                    if let Some(mut conn) = self.connections.get_mut(&handle.id) {
                        conn.device_name = response.device_name.clone();
                    }
                }
                let _ = self.events.send(SessionEvent::PairingResolved {
                    connection_id: handle.id,
                    accepted: response.accepted,
                    device_id: response.device_id,
                });
            }
            Message::Open(options) => self.forward(CommandKind::Open, options),
            Message::Playback(options) => self.forward(CommandKind::Playback, options),
            Message::Audio(options) => self.forward(CommandKind::Audio, options),
            Message::Video(options) => self.forward(CommandKind::Video, options),
            Message::Subtitle(options) => self.forward(CommandKind::Subtitle, options),
            Message::Window(options) => self.forward(CommandKind::Window, options),
            Message::Shortcut(options) => self.forward(CommandKind::Shortcut, options),
            Message::ProfileSync(payload) => self.sync.handle_inbound(handle, payload),
            Message::StateUpdate(state) => {
                if self.role == Role::Controller {
                    self.mirror.apply(state.clone());
                    let _ = self.events.send(SessionEvent::StateUpdated(state));
                } else {
                    tracing::debug!("ignoring state update: not in controller role");
                }
            }
        }
    }

    /// Hand a command to the local playback engine, options untouched.
    fn forward(&self, kind: CommandKind, options: Value) {
        let Some(engine) = &self.engine else {
            tracing::warn!("no playback engine attached, dropping {} command", kind.as_str());
            return;
        };
        if let Err(e) = engine.command(kind, &options) {
            tracing::warn!("{} command failed: {e}", kind.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::pairing::DEFAULT_PAIRING_TIMEOUT;
    use crate::session::ConnectionStatus;
    use crate::storage::{BlobStore, FsBlobStore};
    use crate::sync::DEFAULT_SYNC_TIMEOUT;
    use crate::trust::TrustStore;
    use parking_lot::Mutex;
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::sync::mpsc;

    struct RecordingEngine {
        seen: Mutex<Vec<(CommandKind, Value)>>,
    }

    impl PlaybackEngine for RecordingEngine {
        fn command(&self, kind: CommandKind, options: &Value) -> anyhow::Result<()> {
            self.seen.lock().push((kind, options.clone()));
            Ok(())
        }
    }

    fn router(role: Role, engine: Option<Arc<dyn PlaybackEngine>>) -> (MessageRouter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));
        let identity = DeviceIdentity {
            device_id: "local".into(),
            device_name: "Local".into(),
            role,
        };
        let trust = Arc::new(TrustStore::new(Arc::clone(&store)).unwrap());
        let (events, _) = broadcast::channel(16);
        let router = MessageRouter::new(
            role,
            Arc::new(PairingAuthority::new(
                identity,
                trust,
                DEFAULT_PAIRING_TIMEOUT,
                events.clone(),
            )),
            Arc::new(ProfileSynchronizer::new(
                role,
                store,
                DEFAULT_SYNC_TIMEOUT,
                events.clone(),
            )),
            Arc::new(StateMirror::new()),
            engine,
            Arc::new(DashMap::new()),
            events,
        );
        (router, dir)
    }

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 9000);
        (ConnectionHandle::new(Uuid::new_v4(), peer, tx), rx)
    }

    #[tokio::test]
    async fn commands_reach_the_engine_verbatim() {
        let engine = Arc::new(RecordingEngine {
            seen: Mutex::new(Vec::new()),
        });
        let (router, _dir) = router(Role::Player, Some(engine.clone() as Arc<dyn PlaybackEngine>));
        let (conn, _rx) = handle();

        router.dispatch(
            &conn,
            r#"{"type":"subtitle","payload":{"action":"setTrack","track":3}}"#,
        );

        let seen = engine.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, CommandKind::Subtitle);
        assert_eq!(seen[0].1["track"], 3);
    }

    #[tokio::test]
    async fn unknown_and_malformed_messages_are_dropped_quietly() {
        let (router, _dir) = router(Role::Player, None);
        let (conn, _rx) = handle();

        router.dispatch(&conn, r#"{"type":"quantum_leap","payload":{}}"#);
        router.dispatch(&conn, "not json at all");
        // nothing to assert beyond "no panic, connection still usable"
        router.dispatch(&conn, r#"{"type":"playback","payload":{"action":"pause"}}"#);
    }

    #[tokio::test]
    async fn tap_sees_every_decoded_message() {
        let (router, _dir) = router(Role::Controller, None);
        let (conn, _rx) = handle();
        let mut tap = router.subscribe();

        router.dispatch(
            &conn,
            r#"{"type":"state_update","payload":{"time":5.0,"duration":60.0,"state":"playing","volume":1.0,"muted":false}}"#,
        );

        let inbound = tap.try_recv().unwrap();
        assert_eq!(inbound.connection_id, conn.id);
        assert!(matches!(inbound.message, Message::StateUpdate(_)));
    }

    #[tokio::test]
    async fn accepted_pair_response_updates_connection_name() {
        let (router, _dir) = router(Role::Player, None);
        let (conn, _rx) = handle();
        router.connections.insert(
            conn.id,
            Connection {
                id: conn.id,
                peer: conn.peer,
                status: ConnectionStatus::Connected,
                device_name: None,
            },
        );

        router.dispatch(
            &conn,
            r#"{"type":"pair_response","payload":{"accepted":true,"deviceId":"srv","deviceName":"Desk"}}"#,
        );

        let stored = router.connections.get(&conn.id).unwrap();
        assert_eq!(stored.device_name.as_deref(), Some("Desk"));
    }
}
