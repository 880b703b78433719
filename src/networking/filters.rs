use crate::networking::handlers::ws_upgrade_handler;
use crate::networking::node::Node;
use crate::networking::peer::Peers;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Reply};

/// websocket upgrade filter: `GET /mesh/<peer-node-id>`.
pub fn ws_upgrade_route_filter(
    node: Arc<Node>,
    peers: Peers,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::path("mesh")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_node(node))
        .and(with_peers(peers))
        .and_then(ws_upgrade_handler)
}

/// inject node state
fn with_node(node: Arc<Node>) -> impl Filter<Extract = (Arc<Node>,), Error = Infallible> + Clone {
    warp::any().map(move || node.clone())
}

/// inject peers db
fn with_peers(peers: Peers) -> impl Filter<Extract = (Peers,), Error = Infallible> + Clone {
    warp::any().map(move || peers.clone())
}
