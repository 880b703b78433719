//! The per-node routing and session state shared by every connection
//! worker: the dispatcher, the pending-request table, the live connection
//! registry, the route table and the relay table for multi-hop traffic.
//!
//! The IN side ([`Node::handle_frame`]) runs codec → router → dispatcher (or
//! relay). The OUT side ([`Node::send_request`]) registers the request in
//! the pending table, signs, encodes and writes it toward its destination.
//! Both sides hold an explicit reference to this shared state; nothing is
//! global.

use crate::dispatch::Dispatcher;
use crate::envelope::{self, Envelope, EnvelopeKind};
use crate::error::{Error, ErrorCode};
use crate::pending::{ConnectionId, PendingRequestTable, RequestOutcome, ResultHandle};
use crate::routing::{route_incoming, NetworkPath, NodeId, NodeRole, RouteDecision};
use crate::signature::Direction;
use crate::time::create_timestamp;
use crate::networking::peer::{ConnectionSender, WireFrame};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{event, Level};
use uuid::Uuid;

/// How long a forwarded request's relay entry survives without a response
/// before the purge drops it.
const RELAY_TTL_MS: u64 = 120_000;

/// The write half plus identity of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    /// Identity of the directly connected peer, when it is known (claimed
    /// on the websocket path for inbound peers, configured for outbound).
    pub peer_node: Option<NodeId>,
    pub sender: ConnectionSender,
    /// Route-of-last-resort flag, from the peer settings.
    pub upstream: bool,
}

/// Where a relayed request came from, so its response can travel back.
#[derive(Debug, Clone)]
struct RelayEntry {
    back: ConnectionId,
    forwarded_at: u64,
}

/// Shared node state. One per process, shared behind `Arc` by every
/// connection worker.
pub struct Node {
    pub node_id: NodeId,
    pub role: NodeRole,
    pub dispatcher: Arc<Dispatcher>,
    pub pending: Arc<PendingRequestTable>,
    /// Wire codec for locally originated requests.
    pub binary_wire: bool,
    pub default_timeout: Duration,
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    routes: RwLock<HashMap<NodeId, ConnectionId>>,
    relays: RwLock<HashMap<String, RelayEntry>>,
}

impl Node {
    pub fn new(
        node_id: NodeId,
        role: NodeRole,
        dispatcher: Arc<Dispatcher>,
        pending: Arc<PendingRequestTable>,
        binary_wire: bool,
        default_timeout: Duration,
    ) -> Node {
        Node {
            node_id,
            role,
            dispatcher,
            pending,
            binary_wire,
            default_timeout,
            connections: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            relays: RwLock::new(HashMap::new()),
        }
    }

    //
    // connection registry
    //

    pub async fn register_connection(&self, handle: ConnectionHandle) {
        if let Some(peer_node) = &handle.peer_node {
            self.routes
                .write()
                .await
                .insert(peer_node.clone(), handle.connection_id);
            event!(
                Level::INFO,
                "route to {} via connection {}",
                peer_node,
                hex::encode(&handle.connection_id[..4])
            );
        }
        self.connections
            .write()
            .await
            .insert(handle.connection_id, handle);
    }

    /// Tear down a closed connection: withdraw its routes, fail its pending
    /// requests, drop relay entries that would send into it.
    pub async fn unregister_connection(&self, connection_id: &ConnectionId) {
        let handle = self.connections.write().await.remove(connection_id);
        if let Some(handle) = &handle {
            if let Some(peer_node) = &handle.peer_node {
                let mut routes = self.routes.write().await;
                if routes.get(peer_node) == Some(connection_id) {
                    routes.remove(peer_node);
                }
            }
        }
        self.relays
            .write()
            .await
            .retain(|_, entry| &entry.back != connection_id);
        self.pending.fail_connection(connection_id).await;
        event!(
            Level::INFO,
            "connection {} unregistered",
            hex::encode(&connection_id[..4])
        );
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn sender_for(&self, connection_id: &ConnectionId) -> Option<ConnectionSender> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|h| h.sender.clone())
    }

    /// Connection that reaches `destination`: a direct route when one is
    /// live, the upstream peer otherwise.
    async fn route_to(&self, destination: &NodeId) -> Option<ConnectionId> {
        if !destination.is_any() {
            if let Some(conn) = self.routes.read().await.get(destination) {
                return Some(*conn);
            }
        }
        self.connections
            .read()
            .await
            .values()
            .find(|h| h.upstream)
            .map(|h| h.connection_id)
    }

    async fn write_frame(&self, connection_id: &ConnectionId, frame: WireFrame) -> crate::Result<()> {
        match self.sender_for(connection_id).await {
            Some(sender) => sender.send(frame),
            None => Err(Error::Transport("connection is gone".to_string())),
        }
    }

    async fn write_envelope(
        &self,
        connection_id: &ConnectionId,
        envelope: &Envelope,
        binary: bool,
    ) -> crate::Result<()> {
        let bytes = envelope::encode(envelope, binary)?;
        self.write_frame(connection_id, WireFrame { bytes, binary }).await
    }

    //
    // IN side
    //

    /// Process one inbound frame from `connection_id`. Called sequentially
    /// by that connection's worker, so one connection's requests are
    /// dispatched in arrival order.
    pub async fn handle_frame(
        self: &Arc<Node>,
        connection_id: ConnectionId,
        bytes: &[u8],
        binary: bool,
    ) {
        let envelope = match envelope::decode(bytes, binary) {
            Ok(envelope) => envelope,
            Err(err) => {
                event!(Level::WARN, "dropping malformed frame: {}", err);
                // No request id to correlate with; still tell the sender.
                let mut reply =
                    Envelope::new_request_error("", ErrorCode::FormationViolation, &err.to_string());
                reply.timestamp = Some(create_timestamp());
                let _ = self.write_envelope(&connection_id, &reply, binary).await;
                return;
            }
        };

        match envelope.kind {
            EnvelopeKind::Request => {
                self.handle_request(connection_id, envelope, binary).await;
            }
            EnvelopeKind::Response | EnvelopeKind::RequestError | EnvelopeKind::ResponseError => {
                self.handle_reply(connection_id, envelope, binary).await;
            }
        }
    }

    async fn handle_request(
        self: &Arc<Node>,
        connection_id: ConnectionId,
        envelope: Envelope,
        binary: bool,
    ) {
        let decision = match route_incoming(envelope, &self.node_id, self.role) {
            Ok(decision) => decision,
            Err(err) => {
                // A routing loop has no safe recipient to notify.
                event!(Level::ERROR, "dropping request: {}", err);
                return;
            }
        };
        match decision {
            RouteDecision::Local(envelope) => {
                let peer_node = self
                    .connections
                    .read()
                    .await
                    .get(&connection_id)
                    .and_then(|h| h.peer_node.clone());
                let reply = self
                    .dispatcher
                    .dispatch(&envelope, connection_id, peer_node)
                    .await;
                if let Err(err) = self.write_envelope(&connection_id, &reply, binary).await {
                    event!(
                        Level::ERROR,
                        "could not send reply for request {}: {}",
                        reply.request_id,
                        err
                    );
                } else {
                    event!(Level::DEBUG, "request {} stage Sent", reply.request_id);
                }
            }
            RouteDecision::Forward(envelope) => {
                self.forward_request(connection_id, envelope, binary).await;
            }
        }
    }

    async fn forward_request(
        self: &Arc<Node>,
        origin: ConnectionId,
        envelope: Envelope,
        binary: bool,
    ) {
        let destination = match &envelope.destination {
            Some(destination) => destination.clone(),
            None => return,
        };
        let next_hop = match self.route_to(&destination).await {
            Some(next_hop) => next_hop,
            None => {
                event!(Level::WARN, "no route toward {}", destination);
                let mut reply = Envelope::new_request_error(
                    &envelope.request_id,
                    ErrorCode::GenericError,
                    &format!("no route toward destination {}", destination),
                );
                reply.timestamp = Some(create_timestamp());
                let _ = self.write_envelope(&origin, &reply, binary).await;
                return;
            }
        };
        self.relays.write().await.insert(
            envelope.request_id.clone(),
            RelayEntry {
                back: origin,
                forwarded_at: create_timestamp(),
            },
        );
        event!(
            Level::INFO,
            "forwarding request {} toward {} (path {})",
            envelope.request_id,
            destination,
            envelope.network_path
        );
        if let Err(err) = self.write_envelope(&next_hop, &envelope, binary).await {
            event!(Level::ERROR, "forward failed: {}", err);
            self.relays.write().await.remove(&envelope.request_id);
            let mut reply = Envelope::new_request_error(
                &envelope.request_id,
                ErrorCode::GenericError,
                "next hop unreachable",
            );
            reply.timestamp = Some(create_timestamp());
            let _ = self.write_envelope(&origin, &reply, binary).await;
        }
    }

    /// A response or error frame: resolve a local pending request, or relay
    /// it back along the reverse path recorded when the request was
    /// forwarded. Anything else is dropped.
    async fn handle_reply(
        self: &Arc<Node>,
        connection_id: ConnectionId,
        envelope: Envelope,
        binary: bool,
    ) {
        let local = match &envelope.destination {
            None => true,
            Some(destination) => destination == &self.node_id,
        };
        if local {
            let outcome = match envelope.kind {
                EnvelopeKind::Response => RequestOutcome::Response(envelope.clone()),
                _ => RequestOutcome::ProtocolError(envelope.clone()),
            };
            // At-most-one resolution; a late reply is a logged no-op inside.
            self.pending.resolve(&envelope.request_id, outcome).await;
            return;
        }

        let entry = self.relays.write().await.remove(&envelope.request_id);
        match entry {
            Some(entry) => {
                if entry.back == connection_id {
                    // Reverse path must leave over a different connection
                    // than the response arrived on.
                    event!(
                        Level::WARN,
                        "reply {} would relay back where it came from, dropped",
                        envelope.request_id
                    );
                    return;
                }
                if let Err(err) = self.write_envelope(&entry.back, &envelope, binary).await {
                    event!(Level::ERROR, "relay of reply failed: {}", err);
                }
            }
            None => {
                event!(
                    Level::INFO,
                    "reply {} matches no hop this node remembers sending, dropped",
                    envelope.request_id
                );
            }
        }
    }

    //
    // OUT side
    //

    /// Send a request toward `destination` and return the caller's handle on
    /// its outcome. The handle resolves with exactly one of response,
    /// protocol error, timeout, cancellation or connection loss.
    pub async fn send_request(
        self: &Arc<Node>,
        destination: NodeId,
        action: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> crate::Result<(String, ResultHandle)> {
        let request_id = Uuid::new_v4().to_string();
        let mut envelope = Envelope::new_request(&request_id, action, payload);
        envelope.destination = Some(destination.clone());
        envelope.network_path = NetworkPath::from_hops(vec![self.node_id.clone()]);

        self.dispatcher
            .signature_policy()
            .sign(
                &mut envelope,
                Direction::Outbound,
                self.role,
                self.dispatcher.keys(),
            )
            .map_err(Error::Signature)?;

        let next_hop = self
            .route_to(&destination)
            .await
            .ok_or_else(|| Error::NoRoute(destination.to_string()))?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let handle = self
            .pending
            .register(&request_id, action, timeout, next_hop)
            .await;

        if let Err(err) = self
            .write_envelope(&next_hop, &envelope, self.binary_wire)
            .await
        {
            event!(Level::ERROR, "send of request {} failed: {}", request_id, err);
            self.pending
                .resolve(&request_id, RequestOutcome::ConnectionLost)
                .await;
        }
        Ok((request_id, handle))
    }

    /// Send and await in one call.
    pub async fn call(
        self: &Arc<Node>,
        destination: NodeId,
        action: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> crate::Result<RequestOutcome> {
        let (_, handle) = self
            .send_request(destination, action, payload, timeout)
            .await?;
        handle.await.map_err(|_| Error::ConnectionLost)
    }

    /// Cancel an in-flight request. Downstream nodes are not chased; the
    /// cancellation is local and best-effort.
    pub async fn cancel_request(&self, request_id: &str) -> bool {
        self.pending.cancel(request_id).await
    }

    /// Drop relay entries whose response never came back. Runs from the
    /// same maintenance task as the pending-request sweep.
    pub async fn purge_stale_relays(&self, now: u64) -> usize {
        let mut relays = self.relays.write().await;
        let before = relays.len();
        relays.retain(|_, entry| now < entry.forwarded_at + RELAY_TTL_MS);
        before - relays.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PermissiveCatalog;
    use crate::dispatch::{ActionHandler, IncomingRequest};
    use crate::keystore::KeyStore;
    use crate::signature::SignaturePolicy;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite;

    struct EchoHandler;

    #[async_trait]
    impl ActionHandler for EchoHandler {
        async fn handle(&self, request: &IncomingRequest) -> crate::Result<Option<Vec<u8>>> {
            Ok(Some(request.payload.clone()))
        }
    }

    fn test_node(id: &str, role: NodeRole) -> Arc<Node> {
        let dispatcher = Arc::new(Dispatcher::new(
            role,
            Arc::new(PermissiveCatalog),
            SignaturePolicy::new(),
            Arc::new(KeyStore::new()),
        ));
        Arc::new(Node::new(
            NodeId::new(id),
            role,
            dispatcher,
            Arc::new(PendingRequestTable::new()),
            false,
            Duration::from_secs(30),
        ))
    }

    /// Attach a fake outbound connection and return the frames written to it.
    async fn attach_connection(
        node: &Arc<Node>,
        connection_id: ConnectionId,
        peer_node: Option<&str>,
        upstream: bool,
    ) -> mpsc::UnboundedReceiver<tungstenite::Message> {
        let (sender, receiver) = mpsc::unbounded_channel();
        node.register_connection(ConnectionHandle {
            connection_id,
            peer_node: peer_node.map(NodeId::new),
            sender: ConnectionSender::Outbound(sender),
            upstream,
        })
        .await;
        receiver
    }

    fn frame_for(envelope: &Envelope) -> Vec<u8> {
        envelope::encode(envelope, false).unwrap()
    }

    fn decode_written(message: tungstenite::Message) -> Envelope {
        envelope::decode(&message.into_data(), false).unwrap()
    }

    #[tokio::test]
    async fn test_local_request_is_dispatched_and_answered() {
        let node = test_node("CSMS", NodeRole::Csms);
        node.dispatcher
            .register_handler("Authorize", Arc::new(EchoHandler))
            .await;
        let mut rx = attach_connection(&node, [1u8; 32], Some("CS001"), false).await;

        let mut request = Envelope::new_request("r-1", "Authorize", br#"{"idToken":"A"}"#.to_vec());
        request.destination = Some(NodeId::new("CSMS"));
        request.network_path = NetworkPath::from_hops(vec![NodeId::new("CS001")]);
        node.handle_frame([1u8; 32], &frame_for(&request), false).await;

        let reply = decode_written(rx.recv().await.unwrap());
        assert_eq!(reply.kind, EnvelopeKind::Response);
        assert_eq!(reply.request_id, "r-1");
        assert_eq!(reply.payload, br#"{"idToken":"A"}"#.to_vec());
        assert_eq!(reply.destination, Some(NodeId::new("CS001")));
    }

    #[tokio::test]
    async fn test_forward_and_relay_back() {
        // NN1 relays CS001 -> CSMS and the response back.
        let node = test_node("NN1", NodeRole::NetworkingNode);
        let mut station_rx = attach_connection(&node, [1u8; 32], Some("CS001"), false).await;
        let mut csms_rx = attach_connection(&node, [2u8; 32], Some("CSMS"), true).await;

        let mut request = Envelope::new_request("r-9", "BootNotification", b"{}".to_vec());
        request.destination = Some(NodeId::new("CSMS"));
        request.network_path = NetworkPath::from_hops(vec![NodeId::new("CS001")]);
        node.handle_frame([1u8; 32], &frame_for(&request), false).await;

        let forwarded = decode_written(csms_rx.recv().await.unwrap());
        assert_eq!(forwarded.kind, EnvelopeKind::Request);
        assert_eq!(
            forwarded.network_path.hops(),
            &[NodeId::new("CS001"), NodeId::new("NN1")]
        );

        // The CSMS answers along the reverse path.
        let mut response = Envelope::new_response("r-9", br#"{"status":"Accepted"}"#.to_vec());
        response.destination = Some(NodeId::new("CS001"));
        response.network_path = forwarded.network_path.reversed();
        node.handle_frame([2u8; 32], &frame_for(&response), false).await;

        let relayed = decode_written(station_rx.recv().await.unwrap());
        assert_eq!(relayed.kind, EnvelopeKind::Response);
        assert_eq!(relayed.request_id, "r-9");

        // The relay entry is consumed: a duplicate response is dropped.
        node.handle_frame([2u8; 32], &frame_for(&response), false).await;
        assert!(station_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_routing_loop_is_dropped_not_forwarded() {
        let node = test_node("NN1", NodeRole::NetworkingNode);
        let _station_rx = attach_connection(&node, [1u8; 32], Some("CS001"), false).await;
        let mut csms_rx = attach_connection(&node, [2u8; 32], Some("CSMS"), true).await;

        let mut request = Envelope::new_request("r-2", "Heartbeat", b"{}".to_vec());
        request.destination = Some(NodeId::new("CSMS"));
        request.network_path =
            NetworkPath::from_hops(vec![NodeId::new("CS001"), NodeId::new("NN1")]);
        node.handle_frame([1u8; 32], &frame_for(&request), false).await;
        assert!(csms_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unroutable_request_reports_back() {
        let node = test_node("NN1", NodeRole::NetworkingNode);
        let mut station_rx = attach_connection(&node, [1u8; 32], Some("CS001"), false).await;

        let mut request = Envelope::new_request("r-3", "Heartbeat", b"{}".to_vec());
        request.destination = Some(NodeId::new("CSMS"));
        request.network_path = NetworkPath::from_hops(vec![NodeId::new("CS001")]);
        node.handle_frame([1u8; 32], &frame_for(&request), false).await;

        let reply = decode_written(station_rx.recv().await.unwrap());
        assert_eq!(reply.kind, EnvelopeKind::RequestError);
        assert_eq!(reply.error.unwrap().code, ErrorCode::GenericError);
    }

    #[tokio::test]
    async fn test_send_request_and_correlated_response() {
        let node = test_node("CS001", NodeRole::ChargingStation);
        let mut csms_rx = attach_connection(&node, [2u8; 32], Some("CSMS"), true).await;

        let (request_id, handle) = node
            .send_request(
                NodeId::new("CSMS"),
                "Authorize",
                br#"{"idToken":"A"}"#.to_vec(),
                None,
            )
            .await
            .unwrap();

        let sent = decode_written(csms_rx.recv().await.unwrap());
        assert_eq!(sent.kind, EnvelopeKind::Request);
        assert_eq!(sent.network_path.hops(), &[NodeId::new("CS001")]);

        let response = Envelope::new_response(&request_id, br#"{"status":"Accepted"}"#.to_vec());
        node.handle_frame([2u8; 32], &frame_for(&response), false).await;

        match handle.await.unwrap() {
            RequestOutcome::Response(envelope) => {
                assert_eq!(envelope.payload, br#"{"status":"Accepted"}"#.to_vec());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_request_without_route() {
        let node = test_node("CS001", NodeRole::ChargingStation);
        let result = node
            .send_request(NodeId::new("CSMS"), "Authorize", b"{}".to_vec(), None)
            .await;
        assert!(matches!(result, Err(Error::NoRoute(_))));
    }

    #[tokio::test]
    async fn test_connection_close_resolves_pending() {
        let node = test_node("CS001", NodeRole::ChargingStation);
        let _csms_rx = attach_connection(&node, [2u8; 32], Some("CSMS"), true).await;

        let (_, handle) = node
            .send_request(NodeId::new("CSMS"), "Authorize", b"{}".to_vec(), None)
            .await
            .unwrap();
        node.unregister_connection(&[2u8; 32]).await;

        assert!(matches!(
            handle.await.unwrap(),
            RequestOutcome::ConnectionLost
        ));
        assert_eq!(node.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_uncorrelated_reply_is_dropped() {
        let node = test_node("CS001", NodeRole::ChargingStation);
        let _csms_rx = attach_connection(&node, [2u8; 32], Some("CSMS"), true).await;
        let response = Envelope::new_response("never-sent", b"{}".to_vec());
        // Must not panic, must not create state.
        node.handle_frame([2u8; 32], &frame_for(&response), false).await;
        assert_eq!(node.pending.len().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_formation_violation() {
        let node = test_node("CSMS", NodeRole::Csms);
        let mut rx = attach_connection(&node, [1u8; 32], Some("CS001"), false).await;
        node.handle_frame([1u8; 32], b"this is not a frame", false).await;
        let reply = decode_written(rx.recv().await.unwrap());
        assert_eq!(reply.kind, EnvelopeKind::RequestError);
        assert_eq!(reply.error.unwrap().code, ErrorCode::FormationViolation);
    }

    #[tokio::test]
    async fn test_relay_purge() {
        let node = test_node("NN1", NodeRole::NetworkingNode);
        let _a = attach_connection(&node, [1u8; 32], Some("CS001"), false).await;
        let _b = attach_connection(&node, [2u8; 32], Some("CSMS"), true).await;

        let mut request = Envelope::new_request("r-old", "Heartbeat", b"{}".to_vec());
        request.destination = Some(NodeId::new("CSMS"));
        request.network_path = NetworkPath::from_hops(vec![NodeId::new("CS001")]);
        node.handle_frame([1u8; 32], &frame_for(&request), false).await;

        assert_eq!(node.purge_stale_relays(create_timestamp()).await, 0);
        assert_eq!(
            node.purge_stale_relays(create_timestamp() + RELAY_TTL_MS + 1).await,
            1
        );
    }
}
