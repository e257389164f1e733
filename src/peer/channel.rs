//! Peer transmission channel
//!
//! Clip delivery, preview fan-out and inbound command decoding on top of a
//! [`PeerSession`].

use super::session::{PeerError, PeerId, PeerSession, PeerState};
use crate::capture::preview::PreviewFrame;
use crate::commands::remote::{self, RemoteCommand};
use std::path::Path;
use std::sync::Arc;

/// Logical name the finished clip is sent under
pub const CLIP_RESOURCE_NAME: &str = "Video";

/// Longest service name the discovery layer accepts
pub const MAX_SERVICE_NAME_LEN: usize = 15;

/// Alphanumerics of `name`, at most [`MAX_SERVICE_NAME_LEN`] of them
pub fn normalize_service_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(MAX_SERVICE_NAME_LEN)
        .collect()
}

#[derive(Clone)]
pub struct PeerTransmissionChannel {
    session: Arc<dyn PeerSession>,
}

impl PeerTransmissionChannel {
    pub fn new(session: Arc<dyn PeerSession>) -> Self {
        Self { session }
    }

    pub fn connected_peer_count(&self) -> usize {
        self.session.connected_peer_count()
    }

    /// Send the clip to the first connected peer.
    ///
    /// The caller reinitializes the writers afterwards whatever the result.
    pub async fn send_clip(&self, path: &Path) -> Result<(), PeerError> {
        let peer = self
            .session
            .connected_peers()
            .into_iter()
            .next()
            .ok_or(PeerError::NoConnectedPeer)?;

        tracing::info!(peer = %peer, path = %path.display(), "Sending clip");
        self.session
            .send_resource(&peer, CLIP_RESOURCE_NAME, path)
            .await
    }

    /// Fan a preview frame out to every connected peer. Failures are logged.
    pub async fn send_preview_frame(&self, frame: &PreviewFrame) {
        let peers = self.session.connected_peers();
        if peers.is_empty() {
            return;
        }

        let payload = match serde_json::to_vec(frame) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!("Failed to serialize preview frame: {error}");
                return;
            }
        };
        if let Err(error) = self.session.send_data(&peers, &payload).await {
            tracing::warn!(peers = peers.len(), "Failed to send preview frame: {error}");
        }
    }

    /// Decode inbound data as a command. Bad payloads are logged and dropped.
    pub fn receive(&self, peer: &PeerId, bytes: &[u8]) -> Option<RemoteCommand> {
        match remote::decode(bytes) {
            Ok(command) => {
                tracing::debug!(peer = %peer, ?command, "Received command");
                Some(command)
            }
            Err(error) => {
                tracing::warn!(peer = %peer, "Ignoring peer data: {error}");
                None
            }
        }
    }

    /// Log a connection change; true when the peer went away
    pub fn on_state_change(&self, peer: &PeerId, state: PeerState) -> bool {
        match state {
            PeerState::Connected => tracing::info!(peer = %peer, "Peer connected"),
            PeerState::Connecting => tracing::info!(peer = %peer, "Peer connecting"),
            PeerState::NotConnected => tracing::info!(peer = %peer, "Peer not connected"),
        }
        state == PeerState::NotConnected
    }
}
