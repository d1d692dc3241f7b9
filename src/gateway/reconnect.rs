//! Connection Supervision
//!
//! Single responsibility: Notice when the connection dies and bring it back.
//!
//! # State Machine
//!
//! ```text
//! Idle -> Connecting -> Authenticating -> Ready
//!                                          |
//!              +---------------------------+
//!              v                           v
//!          Degraded -> Connecting ...    Closing -> Closed
//!              |
//!              v
//!           Failed
//! ```
//!
//! `Closed` is terminal and reachable from every state. `Failed` means the
//! client gave up (retries exhausted, reconnect disabled, credentials
//! rejected) and only `close()` remains.
//!
//! # Recovery Order
//!
//! When a ready connection drops, the supervisor:
//! 1. moves to `Degraded`, so new calls wait instead of being sent
//! 2. fails every pending call with `ConnectionLost`
//! 3. sleeps a full-jitter backoff delay, then re-establishes the session
//! 4. moves to `Ready` and re-arms subscriptions in the background
//!
//! A rejected handshake is never retried with the same credentials.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::client::Core;
use super::session::Session;
use crate::config::ClientConfig;
use crate::error::ClientError;

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Ready,
    Degraded,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if self == Closed {
            return false;
        }
        if next == Closed {
            return true;
        }
        match self {
            Idle => matches!(next, Connecting | Closing),
            Connecting => matches!(next, Authenticating | Ready | Degraded | Failed | Closing),
            Authenticating => matches!(next, Ready | Degraded | Failed | Closing),
            Ready => matches!(next, Degraded | Closing),
            Degraded => matches!(next, Connecting | Failed | Closing),
            Failed => matches!(next, Closing),
            Closing | Closed => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

/// Shared, observable connection state with validated transitions.
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the machine allows it. Returns whether it moved.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut moved = false;
        self.tx.send_if_modified(|current| {
            if *current == next || !current.can_transition_to(next) {
                return false;
            }
            debug!(from = ?*current, to = ?next, "Connection state change");
            *current = next;
            moved = true;
            true
        });
        moved
    }
}

/// Wait until `seen` observes a state it has not seen yet, or until `until`.
///
/// Returns whether the state moved. A dropped state cell counts as moved.
pub(crate) async fn state_change_before(
    seen: &mut watch::Receiver<ConnectionState>,
    until: Instant,
) -> bool {
    tokio::time::timeout_at(until, seen.changed()).await.is_ok()
}

/// Full-jitter exponential backoff.
///
/// Attempt `n` (0-based) sleeps a uniform random delay in
/// `[0, min(cap, base * 2^n)]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_retries: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_retries: Option<u32>) -> Self {
        Self {
            base,
            cap,
            max_retries,
            attempt: 0,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            config.max_retries,
        )
    }

    /// Upper bound of the delay for attempt `attempt`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before the next attempt, or `None` once retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_retries {
            if self.attempt >= max {
                return None;
            }
        }
        let ceiling = self.ceiling(self.attempt);
        self.attempt += 1;

        let millis = ceiling.as_millis() as u64;
        let jittered = if millis == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=millis)
        };
        Some(Duration::from_millis(jittered))
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Resolve once shutdown has been requested.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Supervise `session` and every session that replaces it.
///
/// Runs until shutdown or until recovery is given up.
pub(crate) async fn supervise(core: Arc<Core>, mut session: Session) {
    let mut shutdown = core.shutdown_receiver();
    let mut backoff = Backoff::from_config(&core.config);

    loop {
        let end = tokio::select! {
            end = session.ended() => end,
            _ = shutdown_requested(&mut shutdown) => {
                core.correlator.fail_all(ClientError::Closed).await;
                session.close().await;
                debug!("Supervisor stopped by shutdown");
                return;
            }
        };

        if *shutdown.borrow() {
            session.close().await;
            return;
        }

        warn!(
            generation = session.generation(),
            last_activity = %session.last_activity(),
            end = ?end,
            "Connection lost"
        );
        core.state.transition(ConnectionState::Degraded);
        core.clear_session_info().await;
        core.correlator.fail_all(ClientError::ConnectionLost).await;
        session.close().await;

        if !core.config.reconnect {
            core.fail(ClientError::Network(format!(
                "Connection lost and reconnect is disabled ({:?})",
                end
            )))
            .await;
            return;
        }

        let mut last_error = ClientError::ConnectionLost;
        session = loop {
            let Some(delay) = backoff.next_delay() else {
                error!(attempts = backoff.attempts(), error = %last_error, "Giving up on reconnection");
                core.fail(ClientError::Network(format!(
                    "Reconnection failed after {} attempts: {}",
                    backoff.attempts(),
                    last_error
                )))
                .await;
                return;
            };

            info!(
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => return,
            }

            let attempt = tokio::select! {
                result = Session::establish(&core) => result,
                _ = shutdown_requested(&mut shutdown) => return,
            };

            match attempt {
                Ok(session) => break session,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Reconnection rejected");
                    core.fail(e).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        attempt = backoff.attempts(),
                        retryable = e.is_retryable(),
                        error = %e,
                        "Reconnection attempt failed"
                    );
                    core.state.transition(ConnectionState::Degraded);
                    last_error = e;
                }
            }
        };

        let attempts = backoff.attempts();
        backoff.reset();
        core.session_ready(&session, true).await;
        info!(
            generation = session.generation(),
            attempts = attempts,
            "Reconnected"
        );

        let rearm_core = Arc::clone(&core);
        let generation = session.generation();
        tokio::spawn(async move {
            rearm_core.rearm_subscriptions(generation).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_closed_is_terminal() {
        for next in [Idle, Connecting, Authenticating, Ready, Degraded, Closing, Failed, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
        assert!(Closed.is_terminal());
    }

    #[test]
    fn test_close_reachable_from_everywhere() {
        for from in [Idle, Connecting, Authenticating, Ready, Degraded, Closing, Failed] {
            assert!(from.can_transition_to(Closed), "{:?} -> Closed", from);
        }
    }

    #[test]
    fn test_ready_only_degrades_or_closes() {
        assert!(Ready.can_transition_to(Degraded));
        assert!(Ready.can_transition_to(Closing));
        assert!(!Ready.can_transition_to(Connecting));
        assert!(!Ready.can_transition_to(Failed));
    }

    #[test]
    fn test_state_cell_rejects_invalid_transitions() {
        let cell = StateCell::new();
        assert!(!cell.transition(Ready));
        assert!(cell.transition(Connecting));
        assert!(cell.transition(Authenticating));
        assert!(cell.transition(Ready));
        assert!(cell.transition(Closed));
        assert!(!cell.transition(Connecting));
        assert_eq!(cell.get(), Closed);
    }

    #[tokio::test]
    async fn test_state_cell_notifies_watchers() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.transition(Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);
    }

    #[tokio::test]
    async fn test_state_change_before_waits_out_a_quiet_state() {
        let cell = StateCell::new();
        let mut seen = cell.subscribe();
        seen.borrow_and_update();

        let started = Instant::now();
        let moved = state_change_before(&mut seen, started + Duration::from_millis(60)).await;
        assert!(!moved);
        assert!(started.elapsed() >= Duration::from_millis(55));
    }

    #[tokio::test]
    async fn test_state_change_before_wakes_on_transition() {
        let cell = std::sync::Arc::new(StateCell::new());
        let mut seen = cell.subscribe();
        seen.borrow_and_update();

        let mover = std::sync::Arc::clone(&cell);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            mover.transition(Connecting);
        });

        let started = Instant::now();
        let moved = state_change_before(&mut seen, started + Duration::from_secs(5)).await;
        assert!(moved);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*seen.borrow(), Connecting);
    }

    #[tokio::test]
    async fn test_state_change_before_sees_a_change_made_before_waiting() {
        let cell = StateCell::new();
        let mut seen = cell.subscribe();
        seen.borrow_and_update();
        cell.transition(Connecting);

        let started = Instant::now();
        assert!(state_change_before(&mut seen, started + Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_ceiling_doubles_then_caps() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), None);
        assert_eq!(backoff.ceiling(0), Duration::from_millis(500));
        assert_eq!(backoff.ceiling(1), Duration::from_millis(1000));
        assert_eq!(backoff.ceiling(3), Duration::from_millis(4000));
        assert_eq!(backoff.ceiling(10), Duration::from_secs(30));
        assert_eq!(backoff.ceiling(200), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_delay_within_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), None);
        for attempt in 0..20 {
            let ceiling = backoff.ceiling(attempt);
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= ceiling, "attempt {}: {:?} > {:?}", attempt, delay, ceiling);
        }
        assert_eq!(backoff.attempts(), 20);
    }

    #[test]
    fn test_backoff_respects_max_retries() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(10), Some(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        backoff.reset();
        assert!(backoff.next_delay().is_some());
    }

    #[tokio::test]
    async fn test_shutdown_requested_sees_earlier_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(100), shutdown_requested(&mut rx))
            .await
            .unwrap();
    }
}
