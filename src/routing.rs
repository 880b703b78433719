use crate::envelope::Envelope;
use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Sentinel destination meaning "whoever ultimately consumes this" — a
/// station that does not know the identity of its management system addresses
/// it as `*` and relies on the networking nodes to route upstream.
pub const ANY_NODE: &str = "*";

/// Identity of a participant in the mesh. Stations, networking nodes and the
/// CSMS all carry one; it is the unit the network path is made of.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: &str) -> NodeId {
        NodeId(id.to_string())
    }

    pub fn any() -> NodeId {
        NodeId(ANY_NODE.to_string())
    }

    pub fn is_any(&self) -> bool {
        self.0 == ANY_NODE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> NodeId {
        NodeId(s.to_string())
    }
}

/// What a node is, for routing purposes. The CSMS is the final consumer of
/// broadcast-addressed traffic; networking nodes relay; stations originate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    ChargingStation,
    NetworkingNode,
    Csms,
}

impl NodeRole {
    /// Only the CSMS consumes messages addressed to the broadcast sentinel.
    pub fn is_final_consumer(&self) -> bool {
        matches!(self, NodeRole::Csms)
    }
}

/// The ordered hop history of a message. Append-only on the forward leg; the
/// response leg is this sequence reversed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkPath {
    hops: Vec<NodeId>,
}

impl NetworkPath {
    pub fn new() -> NetworkPath {
        NetworkPath { hops: vec![] }
    }

    pub fn from_hops(hops: Vec<NodeId>) -> NetworkPath {
        NetworkPath { hops }
    }

    pub fn hops(&self) -> &[NodeId] {
        &self.hops
    }

    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.hops.iter().any(|hop| hop == node)
    }

    /// First hop of the recorded path, i.e. the message's originator.
    pub fn origin(&self) -> Option<&NodeId> {
        self.hops.first()
    }

    /// Append a hop, rejecting the forwarding loop a repeated id implies.
    pub fn push_hop(&mut self, node: NodeId) -> crate::Result<()> {
        if self.contains(&node) {
            return Err(Error::RoutingLoop(node.0));
        }
        self.hops.push(node);
        Ok(())
    }

    /// The return path a response must travel.
    pub fn reversed(&self) -> NetworkPath {
        let mut hops = self.hops.clone();
        hops.reverse();
        NetworkPath { hops }
    }
}

impl std::fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<&str> = self.hops.iter().map(|h| h.as_str()).collect();
        f.write_str(&joined.join(">"))
    }
}

/// Outcome of routing one incoming envelope.
#[derive(Debug, PartialEq)]
pub enum RouteDecision {
    /// This node is the final destination; hand the envelope to the
    /// dispatcher or the pending-request table.
    Local(Envelope),
    /// Not ours; the envelope (with the local hop appended) must be written
    /// to the next hop's transport.
    Forward(Envelope),
}

/// Decide whether `envelope` terminates at this node or must be relayed.
///
/// A destination equal to the local id is always local. The broadcast
/// sentinel is local only when this node's role is the final consumer.
/// Anything else is forwarded with the local id appended to the network path;
/// a path that already contains the local id is a forwarding loop and the
/// message is rejected rather than relayed forever.
pub fn route_incoming(
    mut envelope: Envelope,
    local: &NodeId,
    role: NodeRole,
) -> crate::Result<RouteDecision> {
    let destination = match &envelope.destination {
        None => return Ok(RouteDecision::Local(envelope)),
        Some(dest) => dest.clone(),
    };

    if &destination == local {
        return Ok(RouteDecision::Local(envelope));
    }
    if destination.is_any() && role.is_final_consumer() {
        return Ok(RouteDecision::Local(envelope));
    }

    envelope.network_path.push_hop(local.clone())?;
    Ok(RouteDecision::Forward(envelope))
}
