//! WebSocket peer session
//!
//! Serves one remote peer at a time on [`PEER_PATH`]. The peer receives a
//! JSON `hello` text message on connect. Anything it sends back, text or
//! binary, is surfaced as [`PeerEvent::Data`]. Data sent to the peer goes
//! out as binary messages; a resource is a JSON `resource` header followed
//! by one binary message with the file contents.

use super::session::{PeerError, PeerEvent, PeerId, PeerSession, PeerState};
use async_trait::async_trait;
use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Route the peer connects to
pub const PEER_PATH: &str = "/peer";

/// Largest message accepted from a peer; commands are a few bytes
pub const MAX_INBOUND_MESSAGE_LEN: usize = 64 * 1024;

/// Text control messages sent to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    Hello { service: String },
    /// The next binary message holds `size` bytes of the resource
    Resource { name: String, size: u64 },
}

impl ControlMessage {
    fn to_message(&self) -> Result<Message, PeerError> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

type PeerSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

struct ConnectedPeer {
    id: PeerId,
    sink: PeerSink,
}

struct Shared {
    service_name: String,
    /// Claimed in the upgrade handler, before the handshake completes
    owner: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<ConnectedPeer>>,
    events: mpsc::Sender<PeerEvent>,
}

impl Shared {
    fn reserve(&self, addr: SocketAddr) -> bool {
        let mut owner = self.owner.lock();
        if owner.is_some() {
            return false;
        }
        *owner = Some(addr);
        true
    }

    fn release(&self, addr: SocketAddr) {
        let mut owner = self.owner.lock();
        if *owner == Some(addr) {
            *owner = None;
        }
    }

    fn sink_for(&self, peer: &PeerId) -> Result<PeerSink, PeerError> {
        match self.peer.lock().as_ref() {
            Some(connected) if connected.id == *peer => Ok(connected.sink.clone()),
            _ => Err(PeerError::Closed(peer.clone())),
        }
    }

    async fn emit(&self, event: PeerEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Peer event receiver dropped");
        }
    }
}

/// Single-peer session over WebSocket
pub struct WsPeerSession {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    server: JoinHandle<()>,
}

impl WsPeerSession {
    /// Start serving. Peer events arrive on the returned receiver.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        service_name: &str,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), PeerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (events, events_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            service_name: service_name.to_string(),
            owner: Mutex::new(None),
            peer: Mutex::new(None),
            events,
        });

        let app = Router::new()
            .route(PEER_PATH, get(peer_handler))
            .with_state(shared.clone());

        tracing::info!(addr = %local_addr, service = service_name, "Peer session listening");
        let server = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(error) = axum::serve(listener, service).await {
                tracing::error!("Peer server stopped: {error}");
            }
        });

        Ok((
            Self {
                shared,
                local_addr,
                server,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }
}

impl Drop for WsPeerSession {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn peer_handler(
    ws: WebSocketUpgrade,
    State(shared): State<Arc<Shared>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !shared.reserve(addr) {
        tracing::warn!(addr = %addr, "Rejecting peer, slot already taken");
        return (StatusCode::CONFLICT, "Peer slot already taken").into_response();
    }

    let on_failure = shared.clone();
    ws.max_message_size(MAX_INBOUND_MESSAGE_LEN)
        .max_frame_size(MAX_INBOUND_MESSAGE_LEN)
        .on_failed_upgrade(move |error| {
            tracing::warn!(addr = %addr, "Peer upgrade failed: {error}");
            on_failure.release(addr);
        })
        .on_upgrade(move |socket| serve_peer(socket, addr, shared))
}

async fn serve_peer(socket: WebSocket, addr: SocketAddr, shared: Arc<Shared>) {
    let peer = PeerId::new(addr.to_string());
    shared
        .emit(PeerEvent::StateChanged {
            peer: peer.clone(),
            state: PeerState::Connecting,
        })
        .await;

    let (mut sink, stream) = socket.split();
    let hello = ControlMessage::Hello {
        service: shared.service_name.clone(),
    };
    let greeted = match hello.to_message() {
        Ok(message) => sink.send(message).await.map_err(PeerError::from),
        Err(error) => Err(error),
    };
    if let Err(error) = greeted {
        tracing::warn!(peer = %peer, "Handshake failed: {error}");
        shared.release(addr);
        shared
            .emit(PeerEvent::StateChanged {
                peer,
                state: PeerState::NotConnected,
            })
            .await;
        return;
    }

    *shared.peer.lock() = Some(ConnectedPeer {
        id: peer.clone(),
        sink: Arc::new(tokio::sync::Mutex::new(sink)),
    });
    shared
        .emit(PeerEvent::StateChanged {
            peer: peer.clone(),
            state: PeerState::Connected,
        })
        .await;

    read_loop(stream, &peer, &shared).await;

    {
        let mut slot = shared.peer.lock();
        if slot.as_ref().is_some_and(|connected| connected.id == peer) {
            *slot = None;
        }
    }
    shared.release(addr);
    shared
        .emit(PeerEvent::StateChanged {
            peer,
            state: PeerState::NotConnected,
        })
        .await;
}

async fn read_loop(mut stream: SplitStream<WebSocket>, peer: &PeerId, shared: &Shared) {
    while let Some(message) = stream.next().await {
        let bytes = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(_)) => return,
            // Ping/pong are answered by the socket itself.
            Ok(_) => continue,
            Err(error) => {
                tracing::warn!(peer = %peer, "Peer read failed: {error}");
                return;
            }
        };
        shared
            .emit(PeerEvent::Data {
                peer: peer.clone(),
                bytes,
            })
            .await;
    }
}

#[async_trait]
impl PeerSession for WsPeerSession {
    fn connected_peers(&self) -> Vec<PeerId> {
        self.shared
            .peer
            .lock()
            .as_ref()
            .map(|connected| vec![connected.id.clone()])
            .unwrap_or_default()
    }

    fn connected_peer_count(&self) -> usize {
        usize::from(self.shared.peer.lock().is_some())
    }

    async fn send_resource(&self, peer: &PeerId, name: &str, path: &Path) -> Result<(), PeerError> {
        let sink = self.shared.sink_for(peer)?;
        let contents = tokio::fs::read(path).await?;
        let header = ControlMessage::Resource {
            name: name.to_string(),
            size: contents.len() as u64,
        }
        .to_message()?;

        // Header and body must not interleave with preview data.
        let mut sink = sink.lock().await;
        sink.send(header).await?;
        sink.send(Message::Binary(contents)).await?;
        Ok(())
    }

    async fn send_data(&self, peers: &[PeerId], bytes: &[u8]) -> Result<(), PeerError> {
        for peer in peers {
            let sink = self.shared.sink_for(peer)?;
            let mut sink = sink.lock().await;
            sink.send(Message::Binary(bytes.to_vec())).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as ClientMessage};

    async fn next_event(events: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn url(session: &WsPeerSession) -> String {
        format!("ws://{}{}", session.local_addr(), PEER_PATH)
    }

    #[test]
    fn test_control_message_json() {
        let header = ControlMessage::Resource {
            name: "Video".to_string(),
            size: 9,
        };
        let json = serde_json::to_string(&header).unwrap();
        assert_eq!(json, r#"{"type":"resource","name":"Video","size":9}"#);
        assert_eq!(serde_json::from_str::<ControlMessage>(&json).unwrap(), header);
    }

    #[test]
    fn test_slot_reservation() {
        let (events, _rx) = mpsc::channel(1);
        let shared = Shared {
            service_name: "Companion".to_string(),
            owner: Mutex::new(None),
            peer: Mutex::new(None),
            events,
        };
        let first: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let second: SocketAddr = "10.0.0.2:5000".parse().unwrap();

        assert!(shared.reserve(first));
        assert!(!shared.reserve(second));
        shared.release(second);
        assert!(!shared.reserve(second));
        shared.release(first);
        assert!(shared.reserve(second));
    }

    #[tokio::test]
    async fn test_loopback_session() {
        let (session, mut events) = WsPeerSession::bind("127.0.0.1:0", "Companion").await.unwrap();
        let (mut client, _) = connect_async(url(&session)).await.unwrap();

        let hello = client.next().await.unwrap().unwrap();
        let hello: ControlMessage = serde_json::from_str(hello.to_text().unwrap()).unwrap();
        assert_eq!(
            hello,
            ControlMessage::Hello {
                service: "Companion".to_string()
            }
        );

        let peer = match next_event(&mut events).await {
            PeerEvent::StateChanged { peer, state } => {
                assert_eq!(state, PeerState::Connecting);
                peer
            }
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::StateChanged {
                peer: peer.clone(),
                state: PeerState::Connected
            }
        );
        assert_eq!(session.connected_peer_count(), 1);

        client.send(ClientMessage::Text("stop".into())).await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::Data {
                peer: peer.clone(),
                bytes: b"stop".to_vec()
            }
        );

        let dir = tempdir().unwrap();
        let clip = dir.path().join("impactVideo.mp4");
        std::fs::write(&clip, b"mp4 bytes").unwrap();
        session.send_resource(&peer, "Video", &clip).await.unwrap();
        let header = client.next().await.unwrap().unwrap();
        assert_eq!(
            serde_json::from_str::<ControlMessage>(header.to_text().unwrap()).unwrap(),
            ControlMessage::Resource {
                name: "Video".to_string(),
                size: 9
            }
        );
        let body = client.next().await.unwrap().unwrap();
        assert_eq!(body.into_data(), b"mp4 bytes".to_vec());

        // Second peer is turned away while the first holds the slot.
        assert!(connect_async(url(&session)).await.is_err());

        client.close(None).await.unwrap();
        assert_eq!(
            next_event(&mut events).await,
            PeerEvent::StateChanged {
                peer,
                state: PeerState::NotConnected
            }
        );
        assert_eq!(session.connected_peer_count(), 0);

        // The slot is free again.
        let (_again, _) = connect_async(url(&session)).await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_drops_peer() {
        let (session, mut events) = WsPeerSession::bind("127.0.0.1:0", "Companion").await.unwrap();
        let (mut client, _) = connect_async(url(&session)).await.unwrap();
        client.next().await.unwrap().unwrap();
        let _connecting = next_event(&mut events).await;
        let _connected = next_event(&mut events).await;

        let oversized = vec![0u8; MAX_INBOUND_MESSAGE_LEN + 1];
        let _ = client.send(ClientMessage::Binary(oversized)).await;

        match next_event(&mut events).await {
            PeerEvent::StateChanged { state, .. } => assert_eq!(state, PeerState::NotConnected),
            other => panic!("oversized message was delivered: {other:?}"),
        }
    }
}
