use crate::networking::connection::inbound_connection;
use crate::networking::node::Node;
use crate::networking::peer::Peers;
use crate::routing::NodeId;
use std::sync::Arc;
use warp::{Rejection, Reply};

/// Upgrade an accepted socket and hand it to its connection worker. The
/// path parameter is the peer's claimed node identity; proving it is the
/// signature policy's job, not the transport's.
pub async fn ws_upgrade_handler(
    peer_id: String,
    ws: warp::ws::Ws,
    node: Arc<Node>,
    peers: Peers,
) -> std::result::Result<impl Reply, Rejection> {
    let claimed = if peer_id.is_empty() {
        None
    } else {
        Some(NodeId::new(&peer_id))
    };
    Ok(ws.on_upgrade(move |socket| inbound_connection(socket, claimed, node, peers)))
}
