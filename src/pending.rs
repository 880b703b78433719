//! The pending-request table: every in-flight outgoing request awaiting a
//! correlated response, error, timeout or cancellation.
//!
//! At most one resolution succeeds per request id. Entries are removed from
//! the map before their sink fires, so a response racing the timeout sweep
//! (or a connection drop) can never double-resolve the caller: whichever
//! party removes the entry delivers the outcome, the loser's attempt is a
//! logged no-op.

use crate::envelope::Envelope;
use crate::time::create_timestamp;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;
use tracing::{event, Level};

/// Identifier of the transport connection a request was last written to.
pub type ConnectionId = [u8; 32];

/// What the OUT-side caller finally observes. Never an unhandled fault.
#[derive(Debug)]
pub enum RequestOutcome {
    /// A correlated `Response` envelope arrived.
    Response(Envelope),
    /// A correlated `RequestError`/`ResponseError` envelope arrived.
    ProtocolError(Envelope),
    TimedOut,
    Cancelled,
    ConnectionLost,
}

/// Caller's handle on an in-flight request. Resolves exactly once.
pub type ResultHandle = oneshot::Receiver<RequestOutcome>;

struct PendingEntry {
    action: String,
    sent_at: u64,
    timeout_ms: u64,
    connection: ConnectionId,
    sink: oneshot::Sender<RequestOutcome>,
}

/// Shared, thread-safe table of in-flight requests, keyed by request id.
#[derive(Default)]
pub struct PendingRequestTable {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequestTable {
    pub fn new() -> PendingRequestTable {
        PendingRequestTable::default()
    }

    /// Track a freshly sent request. The returned handle resolves with the
    /// request's one and only outcome.
    pub async fn register(
        &self,
        request_id: &str,
        action: &str,
        timeout: Duration,
        connection: ConnectionId,
    ) -> ResultHandle {
        let (sink, handle) = oneshot::channel();
        let entry = PendingEntry {
            action: action.to_string(),
            sent_at: create_timestamp(),
            timeout_ms: timeout.as_millis() as u64,
            connection,
            sink,
        };
        let mut entries = self.entries.lock().await;
        if entries.insert(request_id.to_string(), entry).is_some() {
            // The id invariant is the caller's; replacing silently would
            // orphan the earlier caller.
            event!(
                Level::WARN,
                "request id {} re-registered while still pending",
                request_id
            );
        }
        handle
    }

    /// Deliver `outcome` to the caller waiting on `request_id`. Returns
    /// false when no entry exists (already resolved, timed out or never
    /// ours) — a logged no-op, not an error.
    pub async fn resolve(&self, request_id: &str, outcome: RequestOutcome) -> bool {
        let entry = self.entries.lock().await.remove(request_id);
        match entry {
            Some(entry) => {
                if entry.sink.send(outcome).is_err() {
                    event!(
                        Level::DEBUG,
                        "caller dropped its handle for request {}",
                        request_id
                    );
                }
                true
            }
            None => {
                event!(
                    Level::INFO,
                    "late or unknown resolution for request {} dropped",
                    request_id
                );
                false
            }
        }
    }

    /// Cancel a pending request. In-flight network effects are not rolled
    /// back; downstream nodes may still process the request.
    pub async fn cancel(&self, request_id: &str) -> bool {
        self.resolve(request_id, RequestOutcome::Cancelled).await
    }

    /// Resolve every request last written to `connection` with
    /// `ConnectionLost`. Called from the transport's close path.
    pub async fn fail_connection(&self, connection: &ConnectionId) {
        let drained: Vec<(String, PendingEntry)> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| &e.connection == connection)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (id, entry) in drained {
            event!(
                Level::INFO,
                "connection lost, failing pending {} request {}",
                entry.action,
                id
            );
            let _ = entry.sink.send(RequestOutcome::ConnectionLost);
        }
    }

    /// Fire `TimedOut` for every entry past its deadline. Returns how many
    /// fired.
    pub async fn sweep(&self, now: u64) -> usize {
        let expired: Vec<(String, PendingEntry)> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| now >= e.sent_at + e.timeout_ms)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };
        let count = expired.len();
        for (id, entry) in expired {
            event!(
                Level::INFO,
                "request {} ({}) timed out after {}ms",
                id,
                entry.action,
                entry.timeout_ms
            );
            let _ = entry.sink.send(RequestOutcome::TimedOut);
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Launch the timeout sweep task. It runs for the life of the node,
    /// independent of any single connection, so a disconnect and a timeout
    /// cannot race past the at-most-one-resolution guard.
    pub fn spawn_sweeper(table: Arc<PendingRequestTable>, interval: Duration) {
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                table.sweep(create_timestamp()).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN_A: ConnectionId = [1u8; 32];
    const CONN_B: ConnectionId = [2u8; 32];

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = PendingRequestTable::new();
        let handle = table
            .register("r-1", "Authorize", Duration::from_secs(30), CONN_A)
            .await;
        assert_eq!(table.len().await, 1);

        let envelope = Envelope::new_response("r-1", br#"{"status":"Accepted"}"#.to_vec());
        assert!(table.resolve("r-1", RequestOutcome::Response(envelope)).await);
        assert_eq!(table.len().await, 0);

        match handle.await.unwrap() {
            RequestOutcome::Response(env) => assert_eq!(env.request_id, "r-1"),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_at_most_one_resolution() {
        let table = PendingRequestTable::new();
        let handle = table
            .register("r-2", "Heartbeat", Duration::from_millis(0), CONN_A)
            .await;

        // The sweep and a late response race; exactly one wins.
        let fired = table.sweep(create_timestamp() + 1).await;
        assert_eq!(fired, 1);
        let envelope = Envelope::new_response("r-2", b"{}".to_vec());
        assert!(!table.resolve("r-2", RequestOutcome::Response(envelope)).await);

        assert!(matches!(handle.await.unwrap(), RequestOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_cancel() {
        let table = PendingRequestTable::new();
        let handle = table
            .register("r-3", "Reset", Duration::from_secs(30), CONN_A)
            .await;
        assert!(table.cancel("r-3").await);
        assert!(matches!(handle.await.unwrap(), RequestOutcome::Cancelled));
        assert!(!table.cancel("r-3").await);
    }

    #[tokio::test]
    async fn test_fail_connection_scoped_to_one_transport() {
        let table = PendingRequestTable::new();
        let lost = table
            .register("r-4", "Authorize", Duration::from_secs(30), CONN_A)
            .await;
        let kept = table
            .register("r-5", "Authorize", Duration::from_secs(30), CONN_B)
            .await;

        table.fail_connection(&CONN_A).await;
        assert!(matches!(lost.await.unwrap(), RequestOutcome::ConnectionLost));
        assert_eq!(table.len().await, 1);
        drop(kept);
    }

    #[tokio::test]
    async fn test_sweep_respects_deadline() {
        let table = PendingRequestTable::new();
        let handle = table
            .register("r-6", "Heartbeat", Duration::from_millis(100), CONN_A)
            .await;

        // Not yet due.
        assert_eq!(table.sweep(create_timestamp() + 10).await, 0);
        assert_eq!(table.len().await, 1);

        // Past the deadline.
        assert_eq!(table.sweep(create_timestamp() + 150).await, 1);
        assert!(matches!(handle.await.unwrap(), RequestOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_sweeper_task_fires_timeout() {
        let table = Arc::new(PendingRequestTable::new());
        PendingRequestTable::spawn_sweeper(table.clone(), Duration::from_millis(10));
        let handle = table
            .register("r-7", "Heartbeat", Duration::from_millis(50), CONN_A)
            .await;

        let started = create_timestamp();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper never fired")
            .unwrap();
        let elapsed = create_timestamp() - started;
        assert!(matches!(outcome, RequestOutcome::TimedOut));
        assert!(elapsed >= 50, "timed out too early: {}ms", elapsed);
    }
}
