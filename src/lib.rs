//! iWan Client - WebSocket JSON-RPC client core for the iWan blockchain gateway
//!
//! Keeps one authenticated WebSocket open to the gateway and multiplexes
//! every RPC call and subscription over it.
//!
//! ## Features
//!
//! - **Signed handshake**: HMAC-SHA256 over the API key and a timestamp
//! - **Request correlation**: concurrent calls, out-of-order responses,
//!   per-call timeouts, exactly-once resolution
//! - **Reconnection**: full-jitter exponential backoff, calls wait while
//!   the connection is restored
//! - **Subscriptions**: push delivery in arrival order, re-armed after
//!   every reconnect
//!
//! ## Layout
//!
//! | Module    | Contents                                   |
//! |-----------|--------------------------------------------|
//! | `config`  | `ClientConfig`, `GatewayEndpoint` (TOML)   |
//! | `error`   | `ClientError`                              |
//! | `gateway` | Connection, calls, subscriptions           |
//!
//! Logging goes through `tracing`; install a subscriber in the application
//! to see it.

pub mod config;
pub mod error;
pub mod gateway;

pub use config::{ClientConfig, GatewayEndpoint};
pub use error::ClientError;
pub use gateway::{
    ConnectionInfo, ConnectionState, Credentials, GatewayClient, SubscriptionEvent,
    SubscriptionFilter, SubscriptionHandle,
};
