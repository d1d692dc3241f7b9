//! Event Dispatch
//!
//! Single responsibility: Deliver server pushes to the subscriptions that asked for them.
//!
//! Pushes are dispatched in the order the reader task hands them over. For one
//! push, matching callbacks run in registration order and all of them finish
//! before the next push is looked at. Callbacks run outside the table lock, so
//! a callback may subscribe or unsubscribe without deadlocking.
//!
//! # Matching
//!
//! 1. If the push carries `params.subscription` and a subscription holds that
//!    remote id, only those subscriptions match.
//! 2. Otherwise the push `method` must equal the filter's method, `chainType`
//!    (when the push names one) must match case-insensitively, and the
//!    filter's address and positional topics must all be present and match.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::protocol::Envelope;
use crate::error::ClientError;

/// What a subscription callback receives.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A matching push; the value is the push's `params`
    Event(Value),
    /// The subscription could not be (re-)armed on the gateway
    Failed(ClientError),
}

pub type EventCallback = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Opaque id of a registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What to subscribe to and how to recognise its pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// RPC method that arms the subscription (also the push method)
    pub method: String,
    /// Chain the subscription watches ("WAN", "ETH", ...)
    pub chain_type: String,
    /// Contract or account address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Positional topics; `None` matches anything in that position
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Option<String>>,
    /// Additional params sent with the subscribe call
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    /// RPC method that cancels the subscription on the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe_method: Option<String>,
}

impl SubscriptionFilter {
    pub fn new(method: impl Into<String>, chain_type: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            chain_type: chain_type.into(),
            address: None,
            topics: Vec::new(),
            extra: Map::new(),
            unsubscribe_method: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_topics(mut self, topics: Vec<Option<String>>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_unsubscribe_method(mut self, method: impl Into<String>) -> Self {
        self.unsubscribe_method = Some(method.into());
        self
    }

    /// Params of the call that arms this subscription.
    pub fn subscribe_params(&self) -> Value {
        let mut params = self.extra.clone();
        params.insert("chainType".into(), Value::String(self.chain_type.clone()));
        if let Some(address) = &self.address {
            params.insert("address".into(), Value::String(address.clone()));
        }
        if !self.topics.is_empty() {
            let topics = self
                .topics
                .iter()
                .map(|t| t.clone().map(Value::String).unwrap_or(Value::Null))
                .collect();
            params.insert("topics".into(), Value::Array(topics));
        }
        Value::Object(params)
    }

    /// Does `push` belong to this filter?
    pub fn matches(&self, push: &Envelope) -> bool {
        if push.method.as_deref() != Some(self.method.as_str()) {
            return false;
        }

        if let Some(chain) = push.param_str("chainType") {
            if !chain.eq_ignore_ascii_case(&self.chain_type) {
                return false;
            }
        }

        if let Some(address) = &self.address {
            match push.param_str("address") {
                Some(pushed) if pushed.eq_ignore_ascii_case(address) => {}
                _ => return false,
            }
        }

        if self.topics.iter().any(Option::is_some) {
            let pushed = push
                .params
                .as_ref()
                .and_then(|p| p.get("topics"))
                .and_then(Value::as_array);
            let Some(pushed) = pushed else {
                return false;
            };
            for (i, wanted) in self.topics.iter().enumerate() {
                let Some(wanted) = wanted else { continue };
                match pushed.get(i).and_then(Value::as_str) {
                    Some(topic) if topic.eq_ignore_ascii_case(wanted) => {}
                    _ => return false,
                }
            }
        }

        true
    }
}

struct Subscription {
    handle: SubscriptionHandle,
    filter: SubscriptionFilter,
    callback: EventCallback,
    /// Id the gateway returned when the subscription was armed
    remote_id: Option<String>,
    /// Connection generation the subscription is armed on
    armed_generation: Option<u64>,
}

/// Subscription table.
pub struct EventDispatcher {
    next_handle: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(
        &self,
        filter: SubscriptionFilter,
        callback: EventCallback,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        debug!(handle = handle.0, method = %filter.method, chain = %filter.chain_type, "Subscription registered");
        self.subscriptions.write().await.push(Subscription {
            handle,
            filter,
            callback,
            remote_id: None,
            armed_generation: None,
        });
        handle
    }

    /// Remove a subscription. Returns its filter and remote id if it existed.
    pub async fn deregister(
        &self,
        handle: SubscriptionHandle,
    ) -> Option<(SubscriptionFilter, Option<String>)> {
        let mut subs = self.subscriptions.write().await;
        let index = subs.iter().position(|s| s.handle == handle)?;
        let sub = subs.remove(index);
        debug!(handle = handle.0, "Subscription deregistered");
        Some((sub.filter, sub.remote_id))
    }

    /// Drop every subscription. Returns how many there were.
    pub async fn clear(&self) -> usize {
        let mut subs = self.subscriptions.write().await;
        let count = subs.len();
        subs.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Deliver a push to every matching subscription.
    ///
    /// Returns the number of callbacks invoked; unmatched pushes are dropped.
    pub async fn dispatch(&self, push: Envelope) -> usize {
        let targets: Vec<EventCallback> = {
            let subs = self.subscriptions.read().await;
            let by_remote_id: Vec<EventCallback> = push_subscription_id(&push)
                .map(|remote| {
                    subs.iter()
                        .filter(|s| s.remote_id.as_deref() == Some(remote.as_str()))
                        .map(|s| Arc::clone(&s.callback))
                        .collect()
                })
                .unwrap_or_default();

            if by_remote_id.is_empty() {
                subs.iter()
                    .filter(|s| s.filter.matches(&push))
                    .map(|s| Arc::clone(&s.callback))
                    .collect()
            } else {
                by_remote_id
            }
        };

        if targets.is_empty() {
            warn!(
                method = ?push.method,
                id = ?push.id,
                "Dropping push with no matching subscription"
            );
            return 0;
        }

        let payload = push.params.unwrap_or(Value::Null);
        for callback in &targets {
            callback(SubscriptionEvent::Event(payload.clone()));
        }
        targets.len()
    }

    /// Subscriptions not yet armed on `generation`, in registration order.
    pub async fn unarmed(&self, generation: u64) -> Vec<SubscriptionHandle> {
        self.subscriptions
            .read()
            .await
            .iter()
            .filter(|s| s.armed_generation != Some(generation))
            .map(|s| s.handle)
            .collect()
    }

    /// Claim a subscription for arming on `generation`.
    ///
    /// Returns its filter if the caller won the claim; `None` if it is gone
    /// or already armed on this generation.
    pub async fn claim(
        &self,
        handle: SubscriptionHandle,
        generation: u64,
    ) -> Option<SubscriptionFilter> {
        let mut subs = self.subscriptions.write().await;
        let sub = subs.iter_mut().find(|s| s.handle == handle)?;
        if sub.armed_generation == Some(generation) {
            return None;
        }
        sub.armed_generation = Some(generation);
        Some(sub.filter.clone())
    }

    /// Every registered subscription, in registration order.
    pub async fn handles(&self) -> Vec<SubscriptionHandle> {
        self.subscriptions
            .read()
            .await
            .iter()
            .map(|s| s.handle)
            .collect()
    }

    /// Give up a claim without notifying anyone; the next connection re-arms it.
    pub async fn release_claim(&self, handle: SubscriptionHandle) {
        let mut subs = self.subscriptions.write().await;
        if let Some(sub) = subs.iter_mut().find(|s| s.handle == handle) {
            sub.armed_generation = None;
            sub.remote_id = None;
        }
    }

    /// Record the outcome of arming a claimed subscription.
    pub async fn armed(&self, handle: SubscriptionHandle, remote_id: Option<String>) {
        let mut subs = self.subscriptions.write().await;
        if let Some(sub) = subs.iter_mut().find(|s| s.handle == handle) {
            sub.remote_id = remote_id;
        }
    }

    /// Release a failed claim and tell the owner.
    pub async fn arm_failed(&self, handle: SubscriptionHandle, error: ClientError) {
        let callback = {
            let mut subs = self.subscriptions.write().await;
            let Some(sub) = subs.iter_mut().find(|s| s.handle == handle) else {
                return;
            };
            sub.armed_generation = None;
            sub.remote_id = None;
            Arc::clone(&sub.callback)
        };
        warn!(handle = handle.0, error = %error, "Subscription could not be armed");
        callback(SubscriptionEvent::Failed(error));
    }
}

/// The remote subscription id a push is addressed to, if any.
fn push_subscription_id(push: &Envelope) -> Option<String> {
    match push.params.as_ref()?.get("subscription")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Remote id from the result of an arming call.
pub fn remote_id_from_result(result: &Value) -> Option<String> {
    match result {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
