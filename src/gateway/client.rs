//! Gateway Client with Automatic Reconnection
//!
//! Single responsibility: The public surface that callers hold.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    GatewayClient                        │
//! │  - call() / call_as() / call_with_callback()            │
//! │  - subscribe() / unsubscribe()                          │
//! │  - close()                                              │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!        ┌───────────────────┼───────────────────┐
//!        ▼                   ▼                   ▼
//!   Correlator         EventDispatcher      supervisor task
//!   (pending calls)    (subscriptions)      (reconnect)
//!                                                │
//!                                                ▼
//!                                             Session
//!                                      (Transport + Auth)
//! ```
//!
//! # Background Tasks
//!
//! `open()` blocks until the first session is ready, then starts two tasks:
//! - the supervisor, which replaces dead sessions (see `reconnect`)
//! - the expiry sweep, which times out pending calls every `sweep_interval_ms`
//!
//! Each session adds its own reader and writer task. All of them stop on
//! `close()` or when the client is dropped.
//!
//! # Calls During Reconnection
//!
//! A call made while the client is reconnecting waits for the connection to
//! come back, bounded by its own timeout. It fails fast with `Closed` after
//! `close()` and with the terminal error once the client has given up.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use super::auth::Credentials;
use super::correlator::Correlator;
use super::events::{
    remote_id_from_result, EventDispatcher, SubscriptionEvent, SubscriptionFilter,
    SubscriptionHandle,
};
use super::reconnect::{
    shutdown_requested, state_change_before, supervise, ConnectionState, StateCell,
};
use super::session::{ConnectionInfo, Session};
use super::transport::{deadline_after, ActivityClock};
use crate::config::ClientConfig;
use crate::error::ClientError;

/// Bookkeeping for the session currently serving calls.
struct LiveSession {
    generation: u64,
    connected_at: chrono::DateTime<chrono::Utc>,
    activity: Arc<ActivityClock>,
}

/// State shared by the facade and the background tasks.
pub(crate) struct Core {
    pub(crate) config: ClientConfig,
    pub(crate) credentials: Arc<Credentials>,
    pub(crate) url: Url,
    pub(crate) endpoint_label: String,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) state: StateCell,
    fatal: Mutex<Option<ClientError>>,
    live: Mutex<Option<LiveSession>>,
    reconnects: AtomicU32,
    shutdown: watch::Sender<bool>,
}

impl Core {
    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Give up for good: record the error, fail waiters, tell subscribers.
    pub(crate) async fn fail(&self, error: ClientError) {
        error!(error = %error, "Gateway client failed");
        *self.fatal.lock().await = Some(error.clone());
        self.state.transition(ConnectionState::Failed);
        self.clear_session_info().await;
        self.correlator.fail_all(error.clone()).await;

        for handle in self.dispatcher.handles().await {
            self.dispatcher.arm_failed(handle, error.clone()).await;
        }
    }

    /// Mark `session` as the one serving calls and move to `Ready`.
    pub(crate) async fn session_ready(&self, session: &Session, reconnected: bool) {
        if reconnected {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
        *self.live.lock().await = Some(LiveSession {
            generation: session.generation(),
            connected_at: session.connected_at(),
            activity: session.activity_clock(),
        });
        self.state.transition(ConnectionState::Ready);
    }

    pub(crate) async fn clear_session_info(&self) {
        *self.live.lock().await = None;
    }

    async fn terminal_error(&self) -> ClientError {
        self.fatal
            .lock()
            .await
            .clone()
            .unwrap_or(ClientError::ConnectionLost)
    }

    /// Wait until the state is `Ready`, bounded by `deadline`.
    async fn wait_ready(&self, deadline: Instant) -> Result<(), ClientError> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(ClientError::Closed)
                }
                ConnectionState::Failed => return Err(self.terminal_error().await),
                _ => {}
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ClientError::Closed),
                Err(_) => {
                    return Err(ClientError::Timeout(format!(
                        "Connection not ready (state {:?})",
                        state
                    )))
                }
            }
        }
    }

    /// The one call pipeline every invocation style goes through.
    pub(crate) async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let deadline = deadline_after(timeout);

        loop {
            self.wait_ready(deadline).await?;
            let mut changes = self.state.subscribe();
            changes.borrow_and_update();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout(format!(
                    "{} timed out before it could be sent",
                    method
                )));
            }

            match self.correlator.issue(method, params.clone(), remaining).await {
                Ok(pending) => return pending.wait(&self.correlator).await,
                // The connection went away between the state check and the send.
                // Retry once the supervisor has moved the state, polling at the sweep rate.
                Err(ClientError::ConnectionLost) => {
                    let pause = deadline_after(self.config.sweep_interval()).min(deadline);
                    state_change_before(&mut changes, pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Arm one subscription on connection `generation`.
    ///
    /// Losing the connection mid-arm just releases the claim; the next
    /// session re-arms it.
    async fn arm(&self, handle: SubscriptionHandle, generation: u64) -> Result<(), ClientError> {
        let Some(filter) = self.dispatcher.claim(handle, generation).await else {
            return Ok(());
        };

        let issued = self
            .correlator
            .issue_on(
                Some(generation),
                &filter.method,
                filter.subscribe_params(),
                self.config.request_timeout(),
            )
            .await;
        let outcome = match issued {
            Ok(pending) => pending.wait(&self.correlator).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => {
                let remote_id = remote_id_from_result(&result);
                debug!(handle = handle.id(), remote_id = ?remote_id, "Subscription armed");
                self.dispatcher.armed(handle, remote_id).await;
                Ok(())
            }
            Err(ClientError::ConnectionLost) => {
                self.dispatcher.release_claim(handle).await;
                Err(ClientError::ConnectionLost)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-arm every subscription not yet armed on `generation`.
    pub(crate) async fn rearm_subscriptions(&self, generation: u64) {
        let handles = self.dispatcher.unarmed(generation).await;
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), generation = generation, "Re-arming subscriptions");

        for handle in handles {
            match self.arm(handle, generation).await {
                Ok(()) | Err(ClientError::ConnectionLost) => {}
                Err(e) => self.dispatcher.arm_failed(handle, e).await,
            }
        }
    }
}

/// Authenticated, reconnecting JSON-RPC client for the gateway.
///
/// # Guarantees
///
/// - `open()` only returns once a session is ready
/// - every call resolves exactly once: with its result, a remote error,
///   `Timeout`, `ConnectionLost` or `Closed`, never later than its timeout
/// - subscriptions survive reconnects without re-registration
///
/// Share it behind an `Arc`; dropping the last handle shuts everything down.
pub struct GatewayClient {
    core: Arc<Core>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayClient {
    /// Connect, authenticate and start supervision.
    ///
    /// # Errors
    /// - `Config` for invalid settings or credentials
    /// - `Network` / `Timeout` if the gateway cannot be reached in time
    /// - `AuthRejected` if the credentials are refused
    pub async fn open(credentials: Credentials, config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        credentials.validate()?;

        let url = config.endpoint.url_for(credentials.api_key())?;
        let endpoint_label = config.endpoint.redacted(credentials.api_key());
        let credentials = Arc::new(credentials);
        let signer = config.sign_requests.then(|| Arc::clone(&credentials));
        let (shutdown, _) = watch::channel(false);

        let core = Arc::new(Core {
            config,
            credentials,
            url,
            endpoint_label,
            correlator: Arc::new(Correlator::new(signer)),
            dispatcher: Arc::new(EventDispatcher::new()),
            state: StateCell::new(),
            fatal: Mutex::new(None),
            live: Mutex::new(None),
            reconnects: AtomicU32::new(0),
            shutdown,
        });

        let session = match Session::establish(&core).await {
            Ok(session) => session,
            Err(e) => {
                warn!(endpoint = %core.endpoint_label, error = %e, "Initial connection failed");
                *core.fatal.lock().await = Some(e.clone());
                core.state.transition(ConnectionState::Failed);
                return Err(e);
            }
        };
        core.session_ready(&session, false).await;

        let supervisor = tokio::spawn(supervise(Arc::clone(&core), session));
        let sweeper = tokio::spawn(sweep_expired(Arc::clone(&core)));

        info!(endpoint = %core.endpoint_label, "Gateway client connected");

        Ok(Self {
            core,
            tasks: Mutex::new(vec![supervisor, sweeper]),
        })
    }

    /// Call `method` with the configured default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.core
            .call(method, params, self.core.config.request_timeout())
            .await
    }

    /// Call `method`, giving up after `timeout`.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.core.call(method, params, timeout).await
    }

    /// Typed call: serialize `params`, deserialize the result.
    pub async fn call_as<P, R>(&self, method: &str, params: &P) -> Result<R, ClientError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Callback style: the outcome is handed to `on_done` from a spawned task.
    ///
    /// Same pipeline as [`call_with_timeout`](Self::call_with_timeout); the
    /// returned handle can be awaited or ignored.
    pub fn call_with_callback<F>(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
        on_done: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Value, ClientError>) + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let method = method.to_string();
        let timeout = timeout.unwrap_or_else(|| core.config.request_timeout());
        tokio::spawn(async move {
            let outcome = core.call(&method, params, timeout).await;
            on_done(outcome);
        })
    }

    /// Awaitable call that owns everything it needs, e.g. for `tokio::spawn`.
    pub fn call_owned(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<Value, ClientError>> + Send + 'static {
        let core = Arc::clone(&self.core);
        let method = method.into();
        let timeout = timeout.unwrap_or_else(|| core.config.request_timeout());
        async move { core.call(&method, params, timeout).await }
    }

    /// Register a push listener and arm it on the gateway.
    ///
    /// If the client is reconnecting the subscription is armed as soon as
    /// the connection is back. A gateway error while arming removes the
    /// subscription again and is returned.
    pub async fn subscribe<F>(
        &self,
        filter: SubscriptionFilter,
        on_event: F,
    ) -> Result<SubscriptionHandle, ClientError>
    where
        F: Fn(SubscriptionEvent) + Send + Sync + 'static,
    {
        match self.core.state.get() {
            ConnectionState::Closing | ConnectionState::Closed => return Err(ClientError::Closed),
            ConnectionState::Failed => return Err(self.core.terminal_error().await),
            _ => {}
        }

        let handle = self.core.dispatcher.register(filter, Arc::new(on_event)).await;

        if let Some(generation) = self.core.correlator.generation().await {
            match self.core.arm(handle, generation).await {
                Ok(()) | Err(ClientError::ConnectionLost) => {}
                Err(e) => {
                    self.core.dispatcher.deregister(handle).await;
                    return Err(e);
                }
            }
        }

        Ok(handle)
    }

    /// Remove a subscription. Returns whether it existed.
    ///
    /// When the filter names an unsubscribe method and the gateway gave the
    /// subscription an id, the gateway is told as well (best effort).
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let Some((filter, remote_id)) = self.core.dispatcher.deregister(handle).await else {
            return false;
        };

        if let (Some(method), Some(remote_id)) = (filter.unsubscribe_method, remote_id) {
            let params = json!({"chainType": filter.chain_type, "subscription": remote_id});
            if let Err(e) = self
                .core
                .call(&method, params, self.core.config.request_timeout())
                .await
            {
                warn!(handle = handle.id(), error = %e, "Gateway unsubscribe failed");
            }
        }
        true
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.core.state.get()
    }

    /// Watch connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Details of the live connection, `None` while disconnected.
    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        let live = self.core.live.lock().await;
        live.as_ref().map(|live| ConnectionInfo {
            endpoint: self.core.endpoint_label.clone(),
            generation: live.generation,
            connected_at: live.connected_at,
            last_activity: live.activity.get(),
            reconnects: self.core.reconnects.load(Ordering::SeqCst),
        })
    }

    /// Calls currently waiting for a response.
    pub async fn pending_calls(&self) -> usize {
        self.core.correlator.pending_len().await
    }

    /// Registered subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.core.dispatcher.len().await
    }

    /// Shut down: fail pending calls with `Closed`, drop subscriptions, close
    /// the socket and stop background tasks. Idempotent.
    pub async fn close(&self) {
        let mut tasks = self.tasks.lock().await;
        if self.core.state.get() == ConnectionState::Closed {
            return;
        }

        info!(endpoint = %self.core.endpoint_label, "Closing gateway client");
        self.core.state.transition(ConnectionState::Closing);
        self.core.shutdown.send_replace(true);

        let failed = self.core.correlator.fail_all(ClientError::Closed).await;
        let dropped = self.core.dispatcher.clear().await;

        // The supervisor closes its session when it sees the shutdown
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }

        self.core.clear_session_info().await;
        self.core.state.transition(ConnectionState::Closed);
        info!(
            failed_calls = failed,
            dropped_subscriptions = dropped,
            "Gateway client closed"
        );
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("endpoint", &self.core.endpoint_label)
            .field("state", &self.core.state.get())
            .finish_non_exhaustive()
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.core.state.transition(ConnectionState::Closing);
        self.core.shutdown.send_replace(true);
    }
}

/// Periodic expiry sweep over the pending table.
async fn sweep_expired(core: Arc<Core>) {
    let mut shutdown = core.shutdown_receiver();
    let mut interval = tokio::time::interval(core.config.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let expired = core.correlator.expire(Instant::now()).await;
                if expired > 0 {
                    debug!(expired = expired, "Expired pending calls");
                }
            }
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }
}
