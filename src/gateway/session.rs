//! Gateway Session
//!
//! Single responsibility: An authenticated, ready-to-use connection to the gateway.
//!
//! # The Key Abstraction
//!
//! A `Session` can ONLY be created via `Session::establish()`, which:
//! 1. Opens the WebSocket
//! 2. Performs the signed handshake
//! 3. Starts the reader/writer tasks
//! 4. Attaches the correlator to the new connection
//! 5. Only THEN returns a Session
//!
//! If you have a `Session`, calls can be sent on it. Steps 1-2 share one
//! deadline (`handshake_timeout_ms`).
//!
//! Sessions do NOT reconnect. When the socket dies the session is over; the
//! supervisor in `reconnect` replaces it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::auth::{build_handshake, check_handshake_response, timestamp_now};
use super::client::Core;
use super::correlator::Correlator;
use super::events::EventDispatcher;
use super::protocol::{decode, encode};
use super::reconnect::ConnectionState;
use super::transport::{
    deadline_after, is_auth_close, ActivityClock, FrameHandler, Inbound, Link, LinkEnd, Transport,
};
use crate::error::ClientError;

/// Snapshot of the live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Endpoint with the API key masked
    pub endpoint: String,
    /// Increments with every successful (re)connection
    pub generation: u64,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Successful reconnections since `open`
    pub reconnects: u32,
}

/// Routes every inbound frame: responses to the correlator, pushes to the dispatcher.
pub struct FrameRouter {
    correlator: Arc<Correlator>,
    dispatcher: Arc<EventDispatcher>,
}

impl FrameRouter {
    pub fn new(correlator: Arc<Correlator>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            correlator,
            dispatcher,
        }
    }
}

#[async_trait]
impl FrameHandler for FrameRouter {
    async fn on_frame(&self, text: String) {
        let envelope = match decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        if let Some(push) = self.correlator.resolve(envelope).await {
            self.dispatcher.dispatch(push).await;
        }
    }
}

/// An authenticated connection to the gateway.
pub struct Session {
    link: Link,
    generation: u64,
    connected_at: DateTime<Utc>,
}

impl Session {
    /// Establish a new authenticated session.
    ///
    /// Drives the connection state through `Connecting` and
    /// `Authenticating`; the caller decides when it becomes `Ready`.
    ///
    /// # Errors
    /// - `Network` if the socket cannot be opened or drops mid-handshake
    /// - `Timeout` if connect + handshake exceed the handshake deadline
    /// - `AuthRejected` if the gateway refuses the credentials
    pub(crate) async fn establish(core: &Arc<Core>) -> Result<Self, ClientError> {
        let config = &core.config;
        let deadline = deadline_after(config.handshake_timeout());

        info!(endpoint = %core.endpoint_label, "Establishing gateway session");

        core.state.transition(ConnectionState::Connecting);
        let mut transport = Transport::connect(&core.url, config.handshake_timeout()).await?;
        debug!("Socket open");

        core.state.transition(ConnectionState::Authenticating);
        if config.handshake {
            let outcome = tokio::time::timeout_at(deadline, authenticate(core, &mut transport))
                .await
                .unwrap_or_else(|_| {
                    Err(ClientError::Timeout(format!(
                        "Handshake exceeded {:?}",
                        config.handshake_timeout()
                    )))
                });
            if let Err(e) = outcome {
                transport.close().await;
                return Err(e);
            }
            debug!("Authenticated successfully");
        }

        let router = Arc::new(FrameRouter::new(
            Arc::clone(&core.correlator),
            Arc::clone(&core.dispatcher),
        ));
        let link = transport.into_link(router, config.send_queue_capacity, config.ping_interval());
        let generation = core.correlator.attach(link.outbound()).await;

        info!(generation = generation, "Gateway session established");

        Ok(Self {
            link,
            generation,
            connected_at: Utc::now(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.link.last_activity()
    }

    pub(crate) fn activity_clock(&self) -> Arc<ActivityClock> {
        self.link.activity_clock()
    }

    /// Wait for the connection to end.
    pub async fn ended(&mut self) -> LinkEnd {
        self.link.ended().await
    }

    /// Close the socket. Idempotent.
    pub async fn close(&mut self) {
        self.link.close().await;
        debug!(generation = self.generation, "Session closed");
    }
}

/// Send the signed handshake and wait for its answer.
///
/// Frames that are not the handshake response (early pushes) are skipped.
async fn authenticate(core: &Core, transport: &mut Transport) -> Result<(), ClientError> {
    let id = core.correlator.next_id();
    let handshake = build_handshake(
        id,
        &core.config.handshake_method,
        &core.credentials,
        &timestamp_now(),
    )?;
    transport.send_text(encode(&handshake)?).await?;

    loop {
        match transport.recv().await? {
            Inbound::Text(text) => {
                let envelope = match decode(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        debug!(error = %e, "Ignoring undecodable frame during handshake");
                        continue;
                    }
                };
                if envelope.is_response_shaped() && envelope.numeric_id() == Some(id) {
                    check_handshake_response(envelope)?;
                    return Ok(());
                }
                debug!("Ignoring unrelated frame during handshake");
            }
            Inbound::Closed(Some((code, reason))) if is_auth_close(code) => {
                return Err(ClientError::AuthRejected {
                    code: Some(i64::from(code)),
                    message: reason,
                });
            }
            Inbound::Closed(details) => {
                return Err(ClientError::Network(format!(
                    "Connection closed during handshake: {:?}",
                    details
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::SubscriptionFilter;
    use crate::gateway::transport::test_support::outbound_pair;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_router_resolves_responses_and_dispatches_pushes() {
        let correlator = Arc::new(Correlator::new(None));
        let dispatcher = Arc::new(EventDispatcher::new());
        let (outbound, _frames) = outbound_pair(8);
        correlator.attach(outbound).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher
            .register(
                SubscriptionFilter::new("monitorEvent", "WAN"),
                Arc::new(move |event| sink.lock().unwrap().push(format!("{:?}", event))),
            )
            .await;

        let pending = correlator
            .issue("getBlockNumber", Value::Null, Duration::from_secs(1))
            .await
            .unwrap();

        let router = FrameRouter::new(Arc::clone(&correlator), Arc::clone(&dispatcher));
        router
            .on_frame(r#"{"jsonrpc":"2.0","method":"monitorEvent","params":{"chainType":"WAN"}}"#.into())
            .await;
        router
            .on_frame(json!({"jsonrpc": "2.0", "id": pending.id(), "result": "42"}).to_string())
            .await;
        router.on_frame("garbage".into()).await;

        assert_eq!(pending.wait(&correlator).await.unwrap(), json!("42"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
