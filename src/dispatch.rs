//! The action dispatcher: maps an incoming request's action to its
//! registered handlers and resolves a single winning response.
//!
//! Handlers are wired by explicit registration calls at initialization; there
//! is no reflection or name scanning. Several handlers may observe the same
//! action. Dispatch awaits all of them and picks the winner per the
//! configured [`WinnerPolicy`]; a faulting handler is converted into an
//! `ExceptionOccurred` outcome for that invocation only and never hides the
//! other handlers' results.
//!
//! Every inbound request walks the pipeline
//! `Received → SignatureChecked → HandlersInvoked → ResponseComposed →
//! Signed → Sent`; a stage failure short-circuits to an error envelope that
//! still terminates at `Sent`.

use crate::catalog::ActionCatalog;
use crate::envelope::Envelope;
use crate::error::ErrorCode;
use crate::keystore::KeyStore;
use crate::pending::ConnectionId;
use crate::routing::{NetworkPath, NodeId, NodeRole};
use crate::signature::{Direction, SignaturePolicy};
use crate::time::create_timestamp;
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{event, Level};

/// A decoded inbound request as handlers see it.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub request_id: String,
    pub action: String,
    pub payload: Vec<u8>,
    /// Originating node, when the request carried a network path.
    pub origin: Option<NodeId>,
    pub network_path: NetworkPath,
    pub connection: ConnectionId,
    /// The directly connected peer the request arrived from, when known.
    pub peer_node: Option<NodeId>,
}

/// One registered handler for an action.
///
/// `Ok(Some(bytes))` is a candidate response payload, `Ok(None)` declines to
/// answer (observer-style handlers), `Err` is a handler fault.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, request: &IncomingRequest) -> crate::Result<Option<Vec<u8>>>;
}

/// How the winning response is chosen among several handlers' results.
/// All handlers are awaited either way, so observer side effects always run
/// to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinnerPolicy {
    /// First handler in registration order that produced a payload (default).
    FirstRegistered,
    /// First handler in completion order that produced a payload.
    FirstCompleted,
}

/// Pipeline stages, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchStage {
    Received,
    SignatureChecked,
    HandlersInvoked,
    ResponseComposed,
    Signed,
}

/// The shared dispatcher. Cheap to share behind an `Arc`; the handler
/// registry is write-rarely/read-often.
pub struct Dispatcher {
    role: NodeRole,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn ActionHandler>>>>,
    catalog: Arc<dyn ActionCatalog>,
    policy: SignaturePolicy,
    keys: Arc<KeyStore>,
    winner_policy: WinnerPolicy,
}

impl Dispatcher {
    pub fn new(
        role: NodeRole,
        catalog: Arc<dyn ActionCatalog>,
        policy: SignaturePolicy,
        keys: Arc<KeyStore>,
    ) -> Dispatcher {
        Dispatcher {
            role,
            handlers: RwLock::new(HashMap::new()),
            catalog,
            policy,
            keys,
            winner_policy: WinnerPolicy::FirstRegistered,
        }
    }

    pub fn with_winner_policy(mut self, winner_policy: WinnerPolicy) -> Dispatcher {
        self.winner_policy = winner_policy;
        self
    }

    pub fn signature_policy(&self) -> &SignaturePolicy {
        &self.policy
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Register an additional handler for `action`. Handlers are invoked in
    /// registration order.
    pub async fn register_handler(&self, action: &str, handler: Arc<dyn ActionHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(action.to_string())
            .or_insert_with(Vec::new)
            .push(handler);
    }

    /// Run one inbound request through the pipeline. Always returns the
    /// envelope to write back — a response or a protocol error, never a
    /// panic.
    pub async fn dispatch(&self, envelope: &Envelope, connection: ConnectionId, peer_node: Option<NodeId>) -> Envelope {
        debug_stage(&envelope.request_id, DispatchStage::Received);

        let action = match &envelope.action {
            Some(action) => action.clone(),
            None => {
                return self.compose_error(
                    envelope,
                    ErrorCode::FormationViolation,
                    "request without an action",
                );
            }
        };

        if let Err(err) = self
            .policy
            .verify(envelope, Direction::Inbound, self.role, &self.keys)
        {
            event!(
                Level::WARN,
                "signature check failed for {} request {}: {}",
                action,
                envelope.request_id,
                err
            );
            return self.compose_error(envelope, ErrorCode::SecurityError, &err.to_string());
        }
        debug_stage(&envelope.request_id, DispatchStage::SignatureChecked);

        if let Err(reason) = self.catalog.try_parse(&action, &envelope.payload) {
            return self.compose_error(envelope, ErrorCode::CouldNotParse, &reason);
        }

        let handlers: Vec<Arc<dyn ActionHandler>> = {
            let registry = self.handlers.read().await;
            registry.get(&action).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            event!(Level::INFO, "no handler registered for action {}", action);
            return self.compose_error(
                envelope,
                ErrorCode::NotImplemented,
                &format!("Failed: no handler for action {}", action),
            );
        }

        let request = IncomingRequest {
            request_id: envelope.request_id.clone(),
            action: action.clone(),
            payload: envelope.payload.clone(),
            origin: envelope.network_path.origin().cloned(),
            network_path: envelope.network_path.clone(),
            connection,
            peer_node,
        };

        let results = self.invoke_all(&handlers, &request).await;
        debug_stage(&envelope.request_id, DispatchStage::HandlersInvoked);

        let mut winner: Option<Vec<u8>> = None;
        let mut first_fault: Option<String> = None;
        for result in results {
            match result {
                Ok(Some(payload)) => {
                    if winner.is_none() {
                        winner = Some(payload);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    event!(
                        Level::ERROR,
                        "handler fault on {} request {}: {}",
                        action,
                        request.request_id,
                        err
                    );
                    if first_fault.is_none() {
                        first_fault = Some(err.to_string());
                    }
                }
            }
        }

        let mut reply = match (winner, first_fault) {
            (Some(payload), _) => {
                let mut reply = Envelope::new_response(&envelope.request_id, payload);
                self.address_reply(&mut reply, envelope);
                reply
            }
            (None, Some(fault)) => {
                return self.compose_error(envelope, ErrorCode::ExceptionOccurred, &fault);
            }
            (None, None) => {
                return self.compose_error(
                    envelope,
                    ErrorCode::NotImplemented,
                    &format!("Failed: no handler produced a result for {}", action),
                );
            }
        };
        debug_stage(&envelope.request_id, DispatchStage::ResponseComposed);

        self.sign_reply(&mut reply);
        debug_stage(&envelope.request_id, DispatchStage::Signed);
        reply
    }

    /// Invoke every handler concurrently and await them all, collecting the
    /// results in the order dictated by the winner policy.
    async fn invoke_all(
        &self,
        handlers: &[Arc<dyn ActionHandler>],
        request: &IncomingRequest,
    ) -> Vec<crate::Result<Option<Vec<u8>>>> {
        match self.winner_policy {
            WinnerPolicy::FirstRegistered => {
                join_all(handlers.iter().map(|h| h.handle(request))).await
            }
            WinnerPolicy::FirstCompleted => {
                let mut unordered: FuturesUnordered<_> =
                    handlers.iter().map(|h| h.handle(request)).collect();
                let mut results = Vec::with_capacity(handlers.len());
                while let Some(result) = unordered.next().await {
                    results.push(result);
                }
                results
            }
        }
    }

    /// Build, address and sign the protocol error for a failed stage. Error
    /// envelopes still terminate at `Sent`.
    fn compose_error(&self, request: &Envelope, code: ErrorCode, description: &str) -> Envelope {
        let mut reply = Envelope::new_request_error(&request.request_id, code, description);
        reply.timestamp = Some(create_timestamp());
        self.address_reply(&mut reply, request);
        self.sign_reply(&mut reply);
        reply
    }

    /// Route the reply back where the request came from: destination is the
    /// originating hop, the path is the request's path reversed.
    fn address_reply(&self, reply: &mut Envelope, request: &Envelope) {
        if let Some(origin) = request.network_path.origin() {
            reply.destination = Some(origin.clone());
            reply.network_path = request.network_path.reversed();
        }
    }

    fn sign_reply(&self, reply: &mut Envelope) {
        if let Err(err) = self
            .policy
            .sign(reply, Direction::Outbound, self.role, &self.keys)
        {
            // An unsignable reply still goes out; dropping it would strand
            // the caller until timeout.
            event!(
                Level::ERROR,
                "could not sign reply for request {}: {}",
                reply.request_id,
                err
            );
        }
    }
}

fn debug_stage(request_id: &str, stage: DispatchStage) {
    event!(Level::DEBUG, "request {} stage {:?}", request_id, stage);
}
