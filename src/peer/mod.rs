//! Peer transport
//!
//! Remote command delivery in, clip and preview delivery out.

pub mod channel;
pub mod session;
pub mod ws;

pub use channel::{normalize_service_name, PeerTransmissionChannel, CLIP_RESOURCE_NAME};
pub use session::{PeerError, PeerEvent, PeerId, PeerSession, PeerState};
pub use ws::{WsPeerSession, PEER_PATH};
