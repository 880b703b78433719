//! The connection adapters binding a websocket to the node's shared state.
//!
//! The inbound side serves sockets accepted by the warp upgrade filter; the
//! outbound side dials configured peers with tokio-tungstenite. Either way
//! the socket's write half is fed from an unbounded channel by its own
//! forward task, the read half is drained by this connection's worker in
//! arrival order, and teardown funnels through
//! [`Node::unregister_connection`] so pending requests resolve with
//! `ConnectionLost` instead of timing out silently.

use crate::networking::node::{ConnectionHandle, Node};
use crate::networking::peer::{mark_disconnected, ConnectionSender, Peer, Peers};
use crate::pending::ConnectionId;
use crate::routing::NodeId;
use futures::{FutureExt, SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{event, Level};
use url::Url;
use uuid::Uuid;
use warp::ws::WebSocket;

/// Fresh connection identifier: hash of a v4 UUID.
pub fn new_connection_id() -> ConnectionId {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    let mut id = [0u8; 32];
    id.copy_from_slice(hasher.finalize().as_slice());
    id
}

/// Serve one accepted websocket until it closes.
pub async fn inbound_connection(
    ws: WebSocket,
    claimed_node: Option<NodeId>,
    node: Arc<Node>,
    peers: Peers,
) {
    let connection_id = new_connection_id();
    let (ws_sender, mut ws_rcv) = ws.split();
    let (sender, receiver) = mpsc::unbounded_channel();
    let receiver = UnboundedReceiverStream::new(receiver);
    tokio::task::spawn(receiver.forward(ws_sender).map(|result| {
        if let Err(e) = result {
            event!(Level::ERROR, "error sending websocket msg: {}", e);
        }
    }));

    node.register_connection(ConnectionHandle {
        connection_id,
        peer_node: claimed_node.clone(),
        sender: ConnectionSender::Inbound(sender),
        upstream: false,
    })
    .await;
    peers
        .write()
        .await
        .insert(connection_id, Peer::inbound(connection_id, claimed_node.clone()));
    event!(
        Level::INFO,
        "inbound peer {:?} connected",
        claimed_node.as_ref().map(|n| n.as_str())
    );

    while let Some(result) = ws_rcv.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                event!(Level::ERROR, "error receiving ws message: {}", e);
                break;
            }
        };
        if msg.is_text() || msg.is_binary() {
            let binary = msg.is_binary();
            node.handle_frame(connection_id, msg.as_bytes(), binary).await;
        } else if msg.is_close() {
            break;
        }
    }

    peers.write().await.remove(&connection_id);
    node.unregister_connection(&connection_id).await;
    event!(
        Level::INFO,
        "inbound peer {:?} disconnected",
        claimed_node.as_ref().map(|n| n.as_str())
    );
}

/// Dial one configured peer and serve the socket until it closes. The
/// reconnect loop calls this again whenever the peer shows disconnected.
pub async fn connect_to_peer(connection_id: ConnectionId, node: Arc<Node>, peers: Peers) {
    let peer_url;
    let peer_node;
    let upstream;
    {
        let mut peer_db = peers.write().await;
        let peer = match peer_db.get_mut(&connection_id) {
            Some(peer) => peer,
            None => return,
        };
        let (host, port) = match (&peer.host, peer.port) {
            (Some(host), Some(port)) => (host.clone(), port),
            _ => return,
        };
        peer_url = match Url::parse(&format!("ws://{}:{}/mesh/{}", host, port, node.node_id)) {
            Ok(url) => url,
            Err(e) => {
                event!(Level::ERROR, "bad peer url: {}", e);
                return;
            }
        };
        peer_node = peer.node_id.clone();
        upstream = peer.upstream;
        peer.set_is_connecting(true);
    }

    match connect_async(peer_url).await {
        Ok((ws_stream, _)) => {
            let (mut write_sink, mut read_stream) = ws_stream.split();
            let (sender, mut receiver) = mpsc::unbounded_channel::<tungstenite::Message>();
            tokio::spawn(async move {
                while let Some(message) = receiver.recv().await {
                    if write_sink.send(message).await.is_err() {
                        break;
                    }
                }
            });

            node.register_connection(ConnectionHandle {
                connection_id,
                peer_node: peer_node.clone(),
                sender: ConnectionSender::Outbound(sender),
                upstream,
            })
            .await;
            {
                let mut peer_db = peers.write().await;
                if let Some(peer) = peer_db.get_mut(&connection_id) {
                    peer.set_is_connected(true);
                    peer.set_is_connecting(false);
                }
            }
            event!(
                Level::INFO,
                "connected to peer {:?}",
                peer_node.as_ref().map(|n| n.as_str())
            );

            tokio::spawn(async move {
                while let Some(result) = read_stream.next().await {
                    match result {
                        Ok(message) => {
                            if message.is_empty() {
                                continue;
                            }
                            let binary = message.is_binary();
                            if message.is_text() || message.is_binary() {
                                node.handle_frame(connection_id, &message.into_data(), binary)
                                    .await;
                            }
                        }
                        Err(error) => {
                            event!(Level::ERROR, "error reading from peer socket {}", error);
                            break;
                        }
                    }
                }
                node.unregister_connection(&connection_id).await;
                mark_disconnected(&peers, &connection_id).await;
            });
        }
        Err(error) => {
            event!(Level::ERROR, "error connecting to peer {}", error);
            mark_disconnected(&peers, &connection_id).await;
        }
    }
}
