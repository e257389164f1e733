//! Peer session abstraction
//!
//! A reliable bidirectional channel to a single remote peer. Discovery and
//! transport details live behind [`PeerSession`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Display name of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    Connecting,
    Connected,
    NotConnected,
}

/// Inbound notifications from the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StateChanged { peer: PeerId, state: PeerState },
    Data { peer: PeerId, bytes: Vec<u8> },
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("No connected peer")]
    NoConnectedPeer,

    #[error("Peer {0} is not connected")]
    Closed(PeerId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] axum::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait PeerSession: Send + Sync {
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Called on the capture path for every frame; must stay cheap
    fn connected_peer_count(&self) -> usize {
        self.connected_peers().len()
    }

    /// Transfer the file at `path` to `peer` under a logical `name`
    async fn send_resource(&self, peer: &PeerId, name: &str, path: &Path) -> Result<(), PeerError>;

    /// Reliable delivery of one data message to every listed peer
    async fn send_data(&self, peers: &[PeerId], bytes: &[u8]) -> Result<(), PeerError>;
}
