use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;

use crate::identity::Role;
use crate::protocol::Message;
use crate::session::{ConnectionHandle, SessionEvent};
use crate::storage::BlobStore;
use crate::userdata::{merge, UserDataSnapshot};

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(15);

/// Which profile the replicated content belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDescriptor {
    pub username: String,
    pub uuid: String,
    #[serde(rename = "sourceURL")]
    pub source_url: String,
}

/// Complete playlist source plus its derived update-tracking and statistics
/// blobs, transferred as-is on bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct M3uBundle {
    pub source: String,
    pub update: Value,
    pub stats: Value,
}

/// Transfer envelope for `profile_sync` messages, used both for bootstrap
/// and steady-state merge traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<ProfileDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m3u_data: Option<M3uBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<UserDataSnapshot>,
}

impl ProfileSyncPayload {
    pub fn full_request(profile: Option<ProfileDescriptor>) -> Self {
        Self {
            profile,
            request: Some("full".to_string()),
            ..Default::default()
        }
    }
}

struct CachePaths {
    playlist: String,
    update: String,
    stats: String,
    user_data: String,
    profile: String,
}

fn cache_paths(uuid: &str) -> CachePaths {
    CachePaths {
        playlist: format!("profiles/{uuid}/playlist.m3u"),
        update: format!("profiles/{uuid}/update.json"),
        stats: format!("profiles/{uuid}/stats.json"),
        user_data: format!("profiles/{uuid}/userdata.json"),
        profile: format!("profiles/{uuid}/profile.json"),
    }
}

/// Keeps replicated per-item user data convergent across both sides and
/// serves/consumes the full-state bootstrap transfer. Reads and merges
/// snapshots only; the profile/content layer owns the canonical copy.
pub struct ProfileSynchronizer {
    role: Role,
    store: Arc<dyn BlobStore>,
    profile: Mutex<Option<ProfileDescriptor>>,
    pending_full: Mutex<Option<oneshot::Sender<()>>>,
    sync_timeout: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl ProfileSynchronizer {
    pub fn new(
        role: Role,
        store: Arc<dyn BlobStore>,
        sync_timeout: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            role,
            store,
            profile: Mutex::new(None),
            pending_full: Mutex::new(None),
            sync_timeout,
            events,
        }
    }

    /// Select the active profile. On the controller this decides what a
    /// full-sync request is answered with.
    pub fn select_profile(&self, profile: ProfileDescriptor) -> Result<()> {
        let paths = cache_paths(&profile.uuid);
        self.store
            .write(&paths.profile, &serde_json::to_vec_pretty(&profile)?)?;
        *self.profile.lock() = Some(profile);
        Ok(())
    }

    pub fn active_profile(&self) -> Option<ProfileDescriptor> {
        self.profile.lock().clone()
    }

    /// True when no playlist cache exists locally for the active profile,
    /// i.e. a full sync is needed before content can render.
    pub fn needs_bootstrap(&self) -> Result<bool> {
        let Some(profile) = self.active_profile() else {
            return Ok(false);
        };
        Ok(self.store.read(&cache_paths(&profile.uuid).playlist)?.is_none())
    }

    /// Ask the peer for the complete playlist bundle and wait for it to
    /// arrive, bounded by the sync timeout.
    pub async fn request_full(&self, handle: &ConnectionHandle) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        *self.pending_full.lock() = Some(tx);

        handle.send(Message::ProfileSync(ProfileSyncPayload::full_request(
            self.active_profile(),
        )))?;

        match timeout(self.sync_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                *self.pending_full.lock() = None;
                bail!("full sync timed out after {:?}", self.sync_timeout)
            }
        }
    }

    /// Send the local user-data snapshot to the peer.
    pub fn push_user_data(&self, handle: &ConnectionHandle) -> Result<()> {
        let Some(profile) = self.active_profile() else {
            bail!("no active profile to sync");
        };
        let snapshot = self.load_user_data(&profile.uuid)?;
        handle.send(Message::ProfileSync(ProfileSyncPayload {
            user_data: Some(snapshot),
            ..Default::default()
        }))
    }

    /// Handle an inbound `profile_sync` payload. Any combination of parts
    /// may be present.
    pub fn handle_inbound(&self, handle: &ConnectionHandle, payload: ProfileSyncPayload) {
        if let Some(profile) = payload.profile {
            if let Err(e) = self.select_profile(profile) {
                tracing::warn!("failed to adopt peer profile descriptor: {e}");
            }
        }

        if payload.request.as_deref() == Some("full") {
            if self.role == Role::Controller {
                if let Err(e) = self.serve_full(handle) {
                    tracing::warn!("failed to serve full sync: {e}");
                }
            } else {
                tracing::warn!("ignoring full sync request: not the controller");
            }
        }

        if let Some(bundle) = payload.m3u_data {
            match self.adopt_m3u(bundle) {
                Ok(uuid) => {
                    if let Some(tx) = self.pending_full.lock().take() {
                        let _ = tx.send(());
                    }
                    let _ = self.events.send(SessionEvent::CacheUpdated { uuid });
                }
                Err(e) => tracing::warn!("failed to persist transferred playlist: {e}"),
            }
        }

        if let Some(remote) = payload.user_data {
            if let Err(e) = self.merge_inbound(handle, remote) {
                tracing::warn!("failed to merge user data: {e}");
            }
        }
    }

    fn serve_full(&self, handle: &ConnectionHandle) -> Result<()> {
        let Some(profile) = self.active_profile() else {
            bail!("no active profile selected");
        };
        let paths = cache_paths(&profile.uuid);

        let source_bytes = self
            .store
            .read(&paths.playlist)?
            .context("no playlist cached for the active profile")?;
        let source =
            String::from_utf8(source_bytes).context("cached playlist is not valid utf-8")?;
        let update = self.read_json(&paths.update)?;
        let stats = self.read_json(&paths.stats)?;
        let user_data = self.load_user_data(&profile.uuid)?;

        tracing::info!(
            "serving full sync for profile {} ({} bytes)",
            profile.uuid,
            source.len()
        );
        handle.send(Message::ProfileSync(ProfileSyncPayload {
            m3u_data: Some(M3uBundle {
                source,
                update,
                stats,
            }),
            user_data: Some(user_data),
            ..Default::default()
        }))
    }

    /// Persist a transferred bundle as-is. First write wins; there is
    /// nothing local to merge a bootstrap against.
    fn adopt_m3u(&self, bundle: M3uBundle) -> Result<String> {
        let Some(profile) = self.active_profile() else {
            bail!("received playlist bundle without an active profile");
        };
        let paths = cache_paths(&profile.uuid);
        self.store.write(&paths.playlist, bundle.source.as_bytes())?;
        self.store
            .write(&paths.update, &serde_json::to_vec(&bundle.update)?)?;
        self.store
            .write(&paths.stats, &serde_json::to_vec(&bundle.stats)?)?;
        tracing::info!("cached playlist for profile {}", profile.uuid);
        Ok(profile.uuid)
    }

    /// Merge a remote snapshot into the local one and persist the result.
    /// Only the player echoes the merged snapshot back, which converges
    /// both sides within one round trip.
    fn merge_inbound(&self, handle: &ConnectionHandle, remote: UserDataSnapshot) -> Result<()> {
        let Some(profile) = self.active_profile() else {
            bail!("received user data without an active profile");
        };
        let local = self.load_user_data(&profile.uuid)?;
        let merged = merge(&local, &remote);
        self.save_user_data(&profile.uuid, &merged)?;
        let _ = self.events.send(SessionEvent::UserDataMerged {
            uuid: profile.uuid.clone(),
        });

        if self.role == Role::Player {
            handle.send(Message::ProfileSync(ProfileSyncPayload {
                user_data: Some(merged),
                ..Default::default()
            }))?;
        }
        Ok(())
    }

    fn load_user_data(&self, uuid: &str) -> Result<UserDataSnapshot> {
        match self.store.read(&cache_paths(uuid).user_data)? {
            Some(bytes) => serde_json::from_slice(&bytes).context("corrupt user data cache"),
            None => Ok(UserDataSnapshot::default()),
        }
    }

    fn save_user_data(&self, uuid: &str, snapshot: &UserDataSnapshot) -> Result<()> {
        self.store.write(
            &cache_paths(uuid).user_data,
            &serde_json::to_vec_pretty(snapshot)?,
        )
    }

    fn read_json(&self, path: &str) -> Result<Value> {
        match self.store.read(path)? {
            Some(bytes) => serde_json::from_slice(&bytes).context("corrupt cached json blob"),
            None => Ok(Value::Null),
        }
    }
}
