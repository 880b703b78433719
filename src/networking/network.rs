//! The network runner: listens for inbound peers, dials and redials the
//! configured ones.

use crate::networking::connection::{connect_to_peer, new_connection_id};
use crate::networking::filters::ws_upgrade_route_filter;
use crate::networking::node::Node;
use crate::networking::peer::{Peer, PeerSetting, Peers};
use crate::pending::ConnectionId;
use config::Config;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{event, Level};

pub struct Network {
    config_settings: Config,
    node: Arc<Node>,
    peers: Peers,
}

impl Network {
    pub fn new(config_settings: Config, node: Arc<Node>) -> Network {
        Network {
            config_settings,
            node,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn peers(&self) -> Peers {
        self.peers.clone()
    }

    pub async fn run(&self) -> crate::Result<()> {
        tokio::select! {
            res = self.run_client() => {
                if let Err(err) = res {
                    event!(Level::ERROR, "network client err {:?}", err);
                }
            },
            res = self.run_server() => {
                if let Err(err) = res {
                    event!(Level::ERROR, "network server err {:?}", err);
                }
            },
        }
        Ok(())
    }

    /// Load peers from the settings file into the peers db. They start
    /// disconnected; the reconnect loop dials them.
    pub async fn initialize_configured_peers(&self) {
        let peer_settings = match self
            .config_settings
            .get::<Vec<PeerSetting>>("network.peers")
        {
            Ok(peer_settings) => Some(peer_settings),
            Err(_) => None,
        };

        if let Some(peer_settings) = peer_settings {
            for peer_setting in peer_settings {
                let connection_id: ConnectionId = new_connection_id();
                let peer = Peer::from_setting(connection_id, &peer_setting);
                self.peers.write().await.insert(connection_id, peer);
            }
        }
    }

    /// Keep configured peers connected: any settings-file peer found
    /// disconnected is (re)dialled, which also makes the initial
    /// connections.
    pub async fn spawn_reconnect_to_configured_peers_task(&self) -> crate::Result<()> {
        let node = self.node.clone();
        let peers = self.peers.clone();
        tokio::spawn(async move {
            loop {
                let peer_states: Vec<(ConnectionId, bool)> = {
                    let peer_db = peers.read().await;
                    peer_db
                        .iter()
                        .map(|(connection_id, peer)| {
                            let should_try_reconnect = peer.is_from_peer_list
                                && !peer.is_connected
                                && !peer.is_connecting;
                            (*connection_id, should_try_reconnect)
                        })
                        .collect()
                };
                for (connection_id, should_try_reconnect) in peer_states {
                    if should_try_reconnect {
                        event!(
                            Level::INFO,
                            "found disconnected peer in peer settings, (re)connecting..."
                        );
                        connect_to_peer(connection_id, node.clone(), peers.clone()).await;
                    }
                }
                sleep(Duration::from_millis(1000)).await;
            }
        })
        .await
        .map_err(|e| crate::Error::Transport(e.to_string()))?;
        Ok(())
    }

    /// Runs warp::serve to listen for incoming connections.
    pub async fn run_server(&self) -> crate::Result<()> {
        let host: [u8; 4] = self
            .config_settings
            .get::<[u8; 4]>("network.host")
            .unwrap_or([127, 0, 0, 1]);
        let port: u16 = self.config_settings.get::<u16>("network.port")?;

        let routes = ws_upgrade_route_filter(self.node.clone(), self.peers.clone());
        event!(Level::INFO, "listening on {:?}:{}", host, port);
        warp::serve(routes).run((host, port)).await;
        Ok(())
    }

    /// Connects to any peers configured in our peers list.
    pub async fn run_client(&self) -> crate::Result<()> {
        self.initialize_configured_peers().await;
        self.spawn_reconnect_to_configured_peers_task().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PermissiveCatalog;
    use crate::dispatch::{ActionHandler, Dispatcher, IncomingRequest};
    use crate::envelope::{self, Envelope, EnvelopeKind};
    use crate::error::ErrorCode;
    use crate::keystore::KeyStore;
    use crate::pending::PendingRequestTable;
    use crate::routing::{NodeId, NodeRole};
    use crate::signature::SignaturePolicy;
    use async_trait::async_trait;
    use warp::ws::Message;

    struct AcceptHandler;

    #[async_trait]
    impl ActionHandler for AcceptHandler {
        async fn handle(&self, _request: &IncomingRequest) -> crate::Result<Option<Vec<u8>>> {
            Ok(Some(br#"{"status":"Accepted"}"#.to_vec()))
        }
    }

    fn csms_node() -> Arc<Node> {
        let dispatcher = Arc::new(Dispatcher::new(
            NodeRole::Csms,
            Arc::new(PermissiveCatalog),
            SignaturePolicy::new(),
            Arc::new(KeyStore::new()),
        ));
        Arc::new(Node::new(
            NodeId::new("CSMS"),
            NodeRole::Csms,
            dispatcher,
            Arc::new(PendingRequestTable::new()),
            false,
            Duration::from_secs(30),
        ))
    }

    #[tokio::test]
    async fn test_ws_request_response_over_upgrade_filter() {
        let node = csms_node();
        node.dispatcher
            .register_handler("Authorize", Arc::new(AcceptHandler))
            .await;
        let peers: Peers = Arc::new(RwLock::new(HashMap::new()));
        let socket_filter = ws_upgrade_route_filter(node.clone(), peers);

        let mut ws_client = warp::test::ws()
            .path("/mesh/CS001")
            .handshake(socket_filter)
            .await
            .expect("handshake");

        let request = Envelope::new_request("42", "Authorize", br#"{"idToken":"A"}"#.to_vec());
        let bytes = envelope::encode(&request, false).unwrap();
        ws_client
            .send(Message::text(String::from_utf8(bytes).unwrap()))
            .await;

        let resp = ws_client.recv().await.unwrap();
        let reply = envelope::decode(resp.as_bytes(), false).unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Response);
        assert_eq!(reply.request_id, "42");
        assert_eq!(reply.payload, br#"{"status":"Accepted"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_ws_binary_frame_uses_binary_codec() {
        let node = csms_node();
        node.dispatcher
            .register_handler("Heartbeat", Arc::new(AcceptHandler))
            .await;
        let peers: Peers = Arc::new(RwLock::new(HashMap::new()));
        let socket_filter = ws_upgrade_route_filter(node.clone(), peers);

        let mut ws_client = warp::test::ws()
            .path("/mesh/CS001")
            .handshake(socket_filter)
            .await
            .expect("handshake");

        let request = Envelope::new_request("43", "Heartbeat", b"{}".to_vec());
        let bytes = envelope::encode(&request, true).unwrap();
        ws_client.send(Message::binary(bytes)).await;

        let resp = ws_client.recv().await.unwrap();
        assert!(resp.is_binary());
        let reply = envelope::decode(resp.as_bytes(), true).unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Response);
        assert_eq!(reply.request_id, "43");
    }

    #[tokio::test]
    async fn test_ws_unhandled_action_reports_failed() {
        let node = csms_node();
        let peers: Peers = Arc::new(RwLock::new(HashMap::new()));
        let socket_filter = ws_upgrade_route_filter(node.clone(), peers);

        let mut ws_client = warp::test::ws()
            .path("/mesh/CS001")
            .handshake(socket_filter)
            .await
            .expect("handshake");

        let request = Envelope::new_request("44", "Foo", b"{}".to_vec());
        let bytes = envelope::encode(&request, false).unwrap();
        ws_client
            .send(Message::text(String::from_utf8(bytes).unwrap()))
            .await;

        let resp = ws_client.recv().await.unwrap();
        let reply = envelope::decode(resp.as_bytes(), false).unwrap();
        assert_eq!(reply.kind, EnvelopeKind::RequestError);
        assert_eq!(reply.error.unwrap().code, ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn test_configured_peers_load_into_peers_db() {
        let mut settings = Config::default();
        settings
            .set(
                "network.peers",
                vec![HashMap::from([
                    ("node_id".to_string(), "NN1".to_string()),
                    ("host".to_string(), "127.0.0.1".to_string()),
                    ("port".to_string(), "9100".to_string()),
                ])],
            )
            .unwrap();
        let network = Network::new(settings, csms_node());
        network.initialize_configured_peers().await;
        let peers = network.peers();
        let peer_db = peers.read().await;
        assert_eq!(peer_db.len(), 1);
        let peer = peer_db.values().next().unwrap();
        assert_eq!(peer.node_id, Some(NodeId::new("NN1")));
        assert!(peer.is_from_peer_list);
        assert!(!peer.is_connected);
    }
}
