//! Request/Response Correlation
//!
//! Single responsibility: Match every response on the shared socket to the call that issued it.
//!
//! # The Pending Table
//!
//! One mutex guards both the pending calls and the outbound handle of the
//! current connection. That makes the following linearizable:
//!
//! - `issue` registers a call and queues its frame in one step, so a call
//!   can never be registered against a connection that is already gone
//! - `resolve`, `expire` and `fail_all` each remove an entry before
//!   fulfilling it; whichever removes it first wins, the others see nothing
//!
//! Every `PendingCall` is therefore resolved exactly once and evicted at the
//! moment it is resolved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::auth::{sign_request, timestamp_now, Credentials};
use super::protocol::{encode, normalize_params, Envelope};
use super::transport::{deadline_after, Outbound};
use crate::error::ClientError;

/// Single-fulfillment result slot.
pub type ResultSlot = oneshot::Sender<Result<Value, ClientError>>;

/// One in-flight request.
#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    pub method: String,
    pub created_at: Instant,
    pub deadline: Instant,
    slot: ResultSlot,
}

impl PendingCall {
    fn fulfill(self, outcome: Result<Value, ClientError>) {
        // The caller may have stopped listening; that is not an error here
        let _ = self.slot.send(outcome);
    }

    fn timeout_error(&self) -> ClientError {
        ClientError::Timeout(format!(
            "{} (id {}) got no response within {:?}",
            self.method,
            self.id,
            self.deadline.saturating_duration_since(self.created_at)
        ))
    }
}

#[derive(Default)]
struct Table {
    pending: HashMap<u64, PendingCall>,
    outbound: Option<Outbound>,
    generation: u64,
}

/// The caller's side of an issued request.
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Value, ClientError>>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the outcome, never past the deadline.
    ///
    /// When the local deadline fires first, the entry is expired through the
    /// correlator, so a response racing the timer is either delivered here or
    /// discarded, never both.
    pub async fn wait(self, correlator: &Correlator) -> Result<Value, ClientError> {
        let PendingResponse { id, deadline, mut rx } = self;

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                correlator.expire_id(id).await;
                rx.await.unwrap_or(Err(ClientError::ConnectionLost))
            }
        }
    }
}

/// Pending-call table for one client.
///
/// Ids come from a counter that lives as long as the client, so they never
/// repeat within a connection (or across connections).
pub struct Correlator {
    next_id: AtomicU64,
    table: Mutex<Table>,
    signer: Option<Arc<Credentials>>,
}

impl Correlator {
    /// `signer` stamps and signs every request when present.
    pub fn new(signer: Option<Arc<Credentials>>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(Table::default()),
            signer,
        }
    }

    /// Allocate a correlation id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Point the table at a freshly authenticated connection.
    ///
    /// Returns the connection generation.
    pub async fn attach(&self, outbound: Outbound) -> u64 {
        let mut table = self.table.lock().await;
        table.generation += 1;
        table.outbound = Some(outbound);
        debug!(generation = table.generation, "Correlator attached to connection");
        table.generation
    }

    /// Generation of the attached connection, `None` while detached.
    pub async fn generation(&self) -> Option<u64> {
        let table = self.table.lock().await;
        table.outbound.as_ref().map(|_| table.generation)
    }

    /// Detach from the connection and resolve every pending call with `error`.
    ///
    /// Returns how many calls were failed.
    pub async fn fail_all(&self, error: ClientError) -> usize {
        let drained: Vec<PendingCall> = {
            let mut table = self.table.lock().await;
            table.outbound = None;
            table.pending.drain().map(|(_, call)| call).collect()
        };

        let count = drained.len();
        for call in drained {
            debug!(id = call.id, method = %call.method, "Failing pending call");
            call.fulfill(Err(error.clone()));
        }
        if count > 0 {
            warn!(count = count, error = %error, "Failed all pending calls");
        }
        count
    }

    /// Register a request and queue it on the attached connection.
    pub async fn issue(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<PendingResponse, ClientError> {
        self.issue_on(None, method, params, timeout).await
    }

    /// Like [`issue`](Self::issue), but only on connection `generation`.
    ///
    /// Fails with `ConnectionLost` if a different connection (or none) is
    /// attached, so nothing is sent on a connection the caller never saw.
    pub async fn issue_on(
        &self,
        generation: Option<u64>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<PendingResponse, ClientError> {
        let params = normalize_params(params)?;
        let id = self.next_id();

        let mut envelope = Envelope::request(id, method, params);
        if let Some(credentials) = &self.signer {
            sign_request(&mut envelope, credentials, &timestamp_now())?;
        }
        let text = encode(&envelope)?;

        let created_at = Instant::now();
        let deadline = deadline_after(timeout);
        let (slot, rx) = oneshot::channel();

        let mut table = self.table.lock().await;
        let outbound = table.outbound.clone().ok_or(ClientError::ConnectionLost)?;
        if generation.is_some_and(|expected| expected != table.generation) {
            return Err(ClientError::ConnectionLost);
        }

        table.pending.insert(
            id,
            PendingCall {
                id,
                method: method.to_string(),
                created_at,
                deadline,
                slot,
            },
        );

        if let Err(e) = outbound.send(text) {
            table.pending.remove(&id);
            return Err(e);
        }

        debug!(id = id, method = %method, "Request issued");
        Ok(PendingResponse { id, deadline, rx })
    }

    /// Route an inbound envelope.
    ///
    /// A response for a pending id fulfills that call and returns `None`.
    /// Anything else is handed back to the caller as a push.
    pub async fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        if !envelope.is_response_shaped() {
            return Some(envelope);
        }
        let id = envelope.numeric_id()?;

        let call = self.table.lock().await.pending.remove(&id);
        match call {
            Some(call) => {
                debug!(
                    id = id,
                    method = %call.method,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "Response received"
                );
                call.fulfill(envelope.into_outcome());
                None
            }
            // Unknown id: a late response or a push that reuses ids
            None => Some(envelope),
        }
    }

    /// Resolve every call whose deadline is at or before `now` with `Timeout`.
    pub async fn expire(&self, now: Instant) -> usize {
        let expired: Vec<PendingCall> = {
            let mut table = self.table.lock().await;
            let ids: Vec<u64> = table
                .pending
                .values()
                .filter(|call| call.deadline <= now)
                .map(|call| call.id)
                .collect();
            ids.iter()
                .filter_map(|id| table.pending.remove(id))
                .collect()
        };

        let count = expired.len();
        for call in expired {
            debug!(id = call.id, method = %call.method, "Request expired");
            let error = call.timeout_error();
            call.fulfill(Err(error));
        }
        count
    }

    /// Expire one call if it is still pending. Returns whether it was.
    pub async fn expire_id(&self, id: u64) -> bool {
        let call = self.table.lock().await.pending.remove(&id);
        match call {
            Some(call) => {
                let error = call.timeout_error();
                call.fulfill(Err(error));
                true
            }
            None => false,
        }
    }

    /// Number of calls in flight.
    pub async fn pending_len(&self) -> usize {
        self.table.lock().await.pending.len()
    }
}
