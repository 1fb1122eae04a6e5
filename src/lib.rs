//! LAN remote-control and profile-synchronization core for an IPTV player.
//!
//! One device (the controller) discovers, pairs with, and drives playback on
//! another (the player), while per-item viewing preferences stay convergent
//! on both sides without a central server. The GUI, the native video engine,
//! and the playlist parser live outside this crate behind the
//! [`PlaybackEngine`] and [`BlobStore`] contracts.

mod broadcast;
mod discovery;
mod identity;
mod pairing;
mod player;
mod protocol;
mod router;
mod session;
mod storage;
mod sync;
mod trust;
mod userdata;
mod util;

pub use broadcast::{StateBroadcaster, StateMirror};
pub use discovery::{
    local_ipv4, DiscoveredController, DiscoveryService, DEFAULT_PROBE_TIMEOUT,
};
pub use identity::{DeviceIdentity, Role};
pub use pairing::{PairingAuthority, PairingRequest, ResolvedPairing, DEFAULT_PAIRING_TIMEOUT};
pub use player::{CommandKind, PlaybackEngine, PlaybackState, PlayerState, Track};
pub use protocol::{Decoded, DiscoverResponse, Message, PairRequest, PairResponse};
pub use router::{Inbound, MessageRouter};
pub use session::{
    Connection, ConnectionHandle, ConnectionStatus, Mode, RetryPolicy, SessionConfig,
    SessionEvent, SessionManager, DEFAULT_PORT,
};
pub use storage::{BlobStore, FsBlobStore};
pub use sync::{
    M3uBundle, ProfileDescriptor, ProfileSyncPayload, ProfileSynchronizer, DEFAULT_SYNC_TIMEOUT,
};
pub use trust::{TrustStore, TrustedPeer};
pub use userdata::{merge, DevicePrefs, Stamped, TrackSelection, UserDataSnapshot, UserItemData};
pub use util::now_millis;
