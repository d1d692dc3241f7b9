//! Gateway Authentication
//!
//! Single responsibility: Hold credentials, compute signatures, and build the handshake.
//!
//! # Authentication Flow
//!
//! The API key travels in the endpoint path. The API secret never leaves the
//! process; it only keys an HMAC-SHA256 over material the gateway can
//! recompute:
//!
//! 1. **Handshake** (once per connection)
//!    - Send `{method: <handshake_method>, params: {apiKey, timestamp, signature}}`
//!    - `signature = base64(HMAC(secret, apiKey + timestamp))`
//!    - A `result` accepts the connection, an `error` rejects it
//!
//! 2. **Request signing** (every call, when enabled)
//!    - `params.timestamp` is added
//!    - `params.signature = base64(HMAC(secret, json(request)))`, computed
//!      before the signature field is inserted
//!
//! A rejected handshake is fatal for the connection. The timestamp is the
//! nonce, so every attempt signs fresh material.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

use super::protocol::{encode, Envelope};
use crate::error::ClientError;

type HmacSha256 = Hmac<Sha256>;

/// API key/secret pair.
///
/// Immutable once built. The secret is zeroed when the last copy is dropped
/// and never shows up in `Debug` output.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: Zeroizing<Vec<u8>>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        let secret: String = api_secret.into();
        Self {
            api_key: api_key.into(),
            api_secret: Zeroizing::new(secret.into_bytes()),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.api_secret
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.api_key.is_empty() {
            return Err(ClientError::Config("API key must not be empty".into()));
        }
        if self.api_secret.is_empty() {
            return Err(ClientError::Config("API secret must not be empty".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Keyed hash of `message` under `secret`, base64 encoded.
///
/// Pure and deterministic.
pub fn compute_signature(secret: &[u8], message: &[u8]) -> Result<String, ClientError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| ClientError::Config(format!("Unusable API secret: {}", e)))?;
    mac.update(message);
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Current time in the format the gateway expects.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build the first request sent on a fresh connection.
pub fn build_handshake(
    id: u64,
    method: &str,
    credentials: &Credentials,
    timestamp: &str,
) -> Result<Envelope, ClientError> {
    let material = format!("{}{}", credentials.api_key(), timestamp);
    let signature = compute_signature(credentials.secret(), material.as_bytes())?;

    let mut params = Map::new();
    params.insert("apiKey".into(), Value::String(credentials.api_key().to_string()));
    params.insert("timestamp".into(), Value::String(timestamp.to_string()));
    params.insert("signature".into(), Value::String(signature));

    Ok(Envelope::request(id, method, params))
}

/// Interpret the gateway's answer to the handshake.
pub fn check_handshake_response(response: Envelope) -> Result<Value, ClientError> {
    match response.into_outcome() {
        Ok(value) => Ok(value),
        Err(ClientError::Remote { code, message, .. }) => Err(ClientError::AuthRejected {
            code: Some(code),
            message,
        }),
        Err(other) => Err(other),
    }
}

/// Stamp and sign an outgoing request in place.
///
/// The signature covers the serialized request including the timestamp,
/// then gets inserted into params.
pub fn sign_request(
    envelope: &mut Envelope,
    credentials: &Credentials,
    timestamp: &str,
) -> Result<(), ClientError> {
    envelope
        .params_object_mut()
        .ok_or_else(|| ClientError::InvalidParams("params must be a JSON object".into()))?
        .insert("timestamp".into(), Value::String(timestamp.to_string()));

    let unsigned = encode(envelope)?;
    let signature = compute_signature(credentials.secret(), unsigned.as_bytes())?;

    if let Some(params) = envelope.params_object_mut() {
        params.insert("signature".into(), Value::String(signature));
    }
    Ok(())
}
