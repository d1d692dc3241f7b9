//! iWan Gateway Connection Module
//!
//! This module provides a persistent, authenticated JSON-RPC connection to the
//! iWan gateway. Every documented gateway method (`getBalance`,
//! `sendRawTransaction`, `monitorEvent`, ...) is dispatched through it.
//!
//! # Architecture
//!
//! The module is organized by concern, with each submodule having a single responsibility:
//!
//! | Module       | Responsibility                                         |
//! |--------------|--------------------------------------------------------|
//! | `transport`  | WebSocket connect, reader/writer tasks                 |
//! | `protocol`   | JSON-RPC 2.0 envelopes, params policy                  |
//! | `auth`       | Credentials, HMAC signatures, handshake                |
//! | `correlator` | Pending calls: ids, deadlines, exactly-once resolution |
//! | `events`     | Subscription table and push dispatch                   |
//! | `session`    | An authenticated, ready-to-use connection              |
//! | `reconnect`  | State machine, backoff, supervision                    |
//! | `client`     | Public facade                                          |
//!
//! # Key Design Principles
//!
//! ## 1. Make Invalid States Unrepresentable
//!
//! - `Session` can only be created via `Session::establish()`
//! - `GatewayClient::open()` returns only once a session is ready
//! - A pending call has one result slot; whoever removes it from the table
//!   (response, timeout, connection loss, close) is the one who fills it
//!
//! ## 2. One Writer, One Reader
//!
//! - All outbound frames go through a single writer task
//! - All inbound frames are handled by a single reader task, in order
//! - Responses and pushes are told apart by the reader, never guessed later
//!
//! ## 3. Observable State
//!
//! Connection state lives in a watch channel. Calls wait on it rather than
//! polling a flag, and callers can watch it too.
//!
//! # Usage
//!
//! ```ignore
//! use iwan_client::{ClientConfig, Credentials, GatewayClient, SubscriptionFilter};
//! use serde_json::json;
//!
//! let client = GatewayClient::open(
//!     Credentials::new(api_key, api_secret),
//!     ClientConfig::default(),
//! ).await?;
//!
//! let height = client.call("getBlockNumber", json!({"chainType": "WAN"})).await?;
//!
//! let handle = client.subscribe(
//!     SubscriptionFilter::new("monitorEvent", "WAN").with_address(contract),
//!     |event| println!("{:?}", event),
//! ).await?;
//!
//! client.close().await;
//! ```

// Internal modules
mod auth;
mod correlator;
mod events;
mod protocol;
mod reconnect;
mod session;
mod transport;

// Public facade
mod client;

// Re-export the public API
pub use auth::{compute_signature, Credentials};
pub use client::GatewayClient;
pub use events::{EventCallback, SubscriptionEvent, SubscriptionFilter, SubscriptionHandle};
pub use protocol::{Envelope, RpcError, INTERNAL_ERROR_CODE, JSONRPC_VERSION, RESERVED_PARAM_KEYS};
pub use reconnect::{Backoff, ConnectionState};
pub use session::ConnectionInfo;
pub use transport::LinkEnd;
