//! Peer bookkeeping: who we talk to, over which connection, and how to
//! reach them again when a socket drops.

use crate::pending::ConnectionId;
use crate::routing::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite;
use tracing::{event, Level};

pub type Peers = Arc<RwLock<HashMap<ConnectionId, Peer>>>;

/// One peer from the configuration file.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerSetting {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    /// Route-of-last-resort: traffic with no direct route (including the
    /// broadcast destination) is forwarded here.
    #[serde(default)]
    pub upstream: bool,
}

/// Whether we dialled the peer or it dialled us.
#[derive(Serialize, Deserialize, Debug, Copy, PartialEq, Clone)]
pub enum PeerType {
    Outbound,
    Inbound,
}

/// A peer, i.e. another node in the mesh.
#[derive(Debug, Clone)]
pub struct Peer {
    pub connection_id: ConnectionId,
    pub node_id: Option<NodeId>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub peer_type: PeerType,
    pub upstream: bool,
    pub is_connected: bool,
    pub is_connecting: bool,
    /// Peers from the settings file are redialled by the reconnect loop.
    pub is_from_peer_list: bool,
}

impl Peer {
    pub fn from_setting(connection_id: ConnectionId, setting: &PeerSetting) -> Peer {
        Peer {
            connection_id,
            node_id: Some(NodeId::new(&setting.node_id)),
            host: Some(setting.host.clone()),
            port: Some(setting.port),
            peer_type: PeerType::Outbound,
            upstream: setting.upstream,
            is_connected: false,
            is_connecting: false,
            is_from_peer_list: true,
        }
    }

    pub fn inbound(connection_id: ConnectionId, node_id: Option<NodeId>) -> Peer {
        Peer {
            connection_id,
            node_id,
            host: None,
            port: None,
            peer_type: PeerType::Inbound,
            upstream: false,
            is_connected: true,
            is_connecting: false,
            is_from_peer_list: false,
        }
    }

    pub fn set_is_connected(&mut self, x: bool) {
        self.is_connected = x;
    }

    pub fn set_is_connecting(&mut self, x: bool) {
        self.is_connecting = x;
    }
}

/// One frame headed for a transport, codec already applied.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub bytes: Vec<u8>,
    pub binary: bool,
}

/// The write half of a connection. Inbound (warp) and outbound
/// (tungstenite) sockets use different message types, so each side forwards
/// an unbounded channel into its own sink task and the rest of the node only
/// sees this enum.
#[derive(Debug, Clone)]
pub enum ConnectionSender {
    Inbound(mpsc::UnboundedSender<std::result::Result<warp::ws::Message, warp::Error>>),
    Outbound(mpsc::UnboundedSender<tungstenite::Message>),
}

impl ConnectionSender {
    pub fn send(&self, frame: WireFrame) -> crate::Result<()> {
        match self {
            ConnectionSender::Inbound(sender) => {
                let message = if frame.binary {
                    warp::ws::Message::binary(frame.bytes)
                } else {
                    warp::ws::Message::text(String::from_utf8_lossy(&frame.bytes).to_string())
                };
                sender
                    .send(Ok(message))
                    .map_err(|e| crate::Error::Transport(e.to_string()))
            }
            ConnectionSender::Outbound(sender) => {
                let message = if frame.binary {
                    tungstenite::Message::binary(frame.bytes)
                } else {
                    tungstenite::Message::text(
                        String::from_utf8_lossy(&frame.bytes).to_string(),
                    )
                };
                sender
                    .send(message)
                    .map_err(|e| crate::Error::Transport(e.to_string()))
            }
        }
    }
}

/// Mark a peer disconnected so the reconnect loop picks it up again.
pub async fn mark_disconnected(peers: &Peers, connection_id: &ConnectionId) {
    let mut peer_db = peers.write().await;
    if let Some(peer) = peer_db.get_mut(connection_id) {
        peer.set_is_connected(false);
        peer.set_is_connecting(false);
        event!(
            Level::INFO,
            "peer {:?} marked disconnected",
            peer.node_id.as_ref().map(|n| n.as_str())
        );
    }
}
