use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

use crate::discovery::DiscoveredController;
use crate::storage::BlobStore;

const TRUST_PATH: &str = "trusted_peers.json";

/// Durable record of an operator-approved peer. Entries never auto-expire;
/// only pairing acceptance, manual removal, or an address refresh on
/// rediscovery mutate the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPeer {
    pub device_id: String,
    pub device_name: String,
    /// Unknown at pairing time; filled in when a discovery scan matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_address: Option<(IpAddr, u16)>,
    pub auto_connect: bool,
    /// Unix ms.
    pub paired_at: u64,
}

/// The authorization list, persisted through the blob store on every change.
pub struct TrustStore {
    store: Arc<dyn BlobStore>,
    peers: Mutex<Vec<TrustedPeer>>,
}

impl TrustStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Result<Self> {
        let peers = match store.read(TRUST_PATH)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).context("corrupt trusted peer list")?
            }
            None => Vec::new(),
        };
        Ok(Self {
            store,
            peers: Mutex::new(peers),
        })
    }

    pub fn peers(&self) -> Vec<TrustedPeer> {
        self.peers.lock().clone()
    }

    pub fn find(&self, device_id: &str) -> Option<TrustedPeer> {
        self.peers
            .lock()
            .iter()
            .find(|p| p.device_id == device_id)
            .cloned()
    }

    /// Insert or replace the entry for `peer.device_id`.
    pub fn upsert(&self, peer: TrustedPeer) -> Result<()> {
        let snapshot = {
            let mut peers = self.peers.lock();
            peers.retain(|p| p.device_id != peer.device_id);
            peers.push(peer);
            peers.clone()
        };
        self.persist(&snapshot)
    }

    pub fn remove(&self, device_id: &str) -> Result<bool> {
        let (removed, snapshot) = {
            let mut peers = self.peers.lock();
            let before = peers.len();
            peers.retain(|p| p.device_id != device_id);
            (peers.len() != before, peers.clone())
        };
        if removed {
            self.persist(&snapshot)?;
        }
        Ok(removed)
    }

    /// Record where a known device was last seen.
    pub fn refresh_address(&self, device_id: &str, address: IpAddr, port: u16) -> Result<()> {
        let snapshot = {
            let mut peers = self.peers.lock();
            let Some(peer) = peers.iter_mut().find(|p| p.device_id == device_id) else {
                return Ok(());
            };
            peer.last_address = Some((address, port));
            peers.clone()
        };
        self.persist(&snapshot)
    }

    /// First discovered controller that matches a trusted entry with
    /// auto-connect enabled. First match wins; later candidates are not
    /// compared.
    pub fn first_auto_connect_match<'a>(
        &self,
        discovered: &'a [DiscoveredController],
    ) -> Option<&'a DiscoveredController> {
        let peers = self.peers.lock();
        discovered.iter().find(|candidate| {
            peers
                .iter()
                .any(|p| p.device_id == candidate.device_id && p.auto_connect)
        })
    }

    fn persist(&self, peers: &[TrustedPeer]) -> Result<()> {
        self.store
            .write(TRUST_PATH, &serde_json::to_vec_pretty(peers)?)
            .context("failed to persist trusted peer list")
    }
}
