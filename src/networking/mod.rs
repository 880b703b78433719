/*!

# Networking Interfaces and Methods

## Introduction

Gridmesh nodes exchange envelopes over persistent full-duplex websockets.
A node accepts inbound connections on `ws://host:port/mesh/<peer-node-id>`
and dials the peers in its configuration, so an arbitrary-depth mesh of
stations, networking nodes and management systems can form.

## Wire envelopes

A websocket **text** frame carries the JSON codec, a **binary** frame the
fixed-width codec; both encode the same logical envelope (see
`src/envelope.rs`).

Base tuples:

```text
Request:       [2, requestId, action, payload]
Response:      [3, requestId, payload]
RequestError:  [4, requestId, errorCode, errorDescription, errorDetails]
ResponseError: [5, requestId, errorCode, errorDescription, errorDetails]
```

Multi-hop variants append one routing trailer object carrying `destination`,
`networkPath`, `timestamp` and `signatures` outside the base tuple:

```text
[2, "b3c9", "BootNotification", {...},
 {"destination": "CSMS", "networkPath": ["CS001", "NN1"]}]
```

## Routing

A node receiving a request whose destination is not itself appends its own id
to `networkPath` and writes the envelope to the next hop (a direct route to
the destination when one is connected, the upstream peer otherwise). It
remembers `requestId -> originating connection` so the correlated response can
be relayed back along the reverse path. A response no relay entry exists for
is dropped.

## Connection lifecycle

Each connection is served by its own worker; frames are processed in arrival
order. When a connection closes, every pending request last written to it is
resolved with `ConnectionLost` and its routes are withdrawn. Configured peers
are redialled by the reconnect loop.

*/

pub mod connection;
pub mod filters;
pub mod handlers;
pub mod network;
pub mod node;
pub mod peer;
