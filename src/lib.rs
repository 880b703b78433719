/*!
# Gridmesh

Gridmesh is a routing core for **OCPP-style charge-point networks**. Charging
stations, networking nodes and management systems exchange action-typed
request/response messages over persistent websockets, and gridmesh provides the
engine in the middle: the wire envelope codec, multi-hop network-path routing,
the action dispatcher, the signature policy engine, the pending-request
correlation table and the Secure Data Transfer tunnel.

The catalog of concrete charging-domain payloads (BootNotification, Authorize,
and friends) is deliberately *not* part of this crate. Payloads cross the
boundary as opaque bytes and are interpreted through the narrow
[`catalog::ActionCatalog`] contract.

# Usage

```bash
gridmesh --config=config
```

See `src/networking/mod.rs` for the wire protocol documentation.

# Contact

The Gridmesh Team
dev@gridmesh.io

*/
pub mod catalog;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod keystore;
pub mod networking;
pub mod pending;
pub mod routing;
pub mod runtime;
pub mod secure_data;
pub mod signature;
pub mod time;

pub use error::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
