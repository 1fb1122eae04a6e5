use parking_lot::Mutex;

use crate::player::PlayerState;
use crate::protocol::Message;
use crate::session::ConnectionHandle;

/// One-way, best-effort telemetry out of the player side. Every state
/// change produces exactly one `state_update` message; no batching or
/// delta-encoding. Publishing while disconnected is a silent no-op.
pub struct StateBroadcaster {
    link: Mutex<Option<ConnectionHandle>>,
}

impl StateBroadcaster {
    pub fn new() -> Self {
        Self {
            link: Mutex::new(None),
        }
    }

    pub fn attach(&self, handle: ConnectionHandle) {
        *self.link.lock() = Some(handle);
    }

    pub fn detach(&self) {
        *self.link.lock() = None;
    }

    pub fn publish(&self, state: PlayerState) {
        let link = self.link.lock().clone();
        if let Some(handle) = link {
            if let Err(e) = handle.send(Message::StateUpdate(state)) {
                tracing::debug!("dropping state update: {e}");
            }
        }
    }
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Controller-side mirror of the remote player. Applies updates directly,
/// last received wins; this is live telemetry, not durable state.
pub struct StateMirror {
    latest: Mutex<PlayerState>,
}

impl StateMirror {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(PlayerState::default()),
        }
    }

    pub fn apply(&self, state: PlayerState) {
        *self.latest.lock() = state;
    }

    pub fn latest(&self) -> PlayerState {
        self.latest.lock().clone()
    }
}

impl Default for StateMirror {
    fn default() -> Self {
        Self::new()
    }
}
