use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::BlobStore;

const IDENTITY_PATH: &str = "identity.json";

/// Which half of a session this device plays. Fixed by local configuration,
/// never negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Player,
}

/// Stable per-installation identity, independent of the current network
/// address. Generated once and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
    pub role: Role,
}

impl DeviceIdentity {
    /// Load the persisted identity, or mint and persist a fresh one. The
    /// device id survives role changes; only the role field is rewritten
    /// when configuration flips it.
    pub fn load_or_create(
        store: &Arc<dyn BlobStore>,
        role: Role,
        default_name: &str,
    ) -> Result<Self> {
        if let Some(bytes) = store.read(IDENTITY_PATH)? {
            let mut identity: DeviceIdentity =
                serde_json::from_slice(&bytes).context("corrupt identity record")?;
            if identity.role != role {
                identity.role = role;
                store.write(IDENTITY_PATH, &serde_json::to_vec_pretty(&identity)?)?;
            }
            return Ok(identity);
        }

        let identity = DeviceIdentity {
            device_id: Uuid::new_v4().to_string(),
            device_name: default_name.to_string(),
            role,
        };
        store.write(IDENTITY_PATH, &serde_json::to_vec_pretty(&identity)?)?;
        tracing::info!("generated device identity {}", identity.device_id);
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;

    #[test]
    fn identity_is_stable_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));

        let first = DeviceIdentity::load_or_create(&store, Role::Player, "Bedroom TV").unwrap();
        let second = DeviceIdentity::load_or_create(&store, Role::Player, "ignored").unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(second.device_name, "Bedroom TV");
    }

    #[test]
    fn role_change_keeps_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()));

        let player = DeviceIdentity::load_or_create(&store, Role::Player, "TV").unwrap();
        let controller = DeviceIdentity::load_or_create(&store, Role::Controller, "TV").unwrap();
        assert_eq!(player.device_id, controller.device_id);
        assert_eq!(controller.role, Role::Controller);
    }
}
