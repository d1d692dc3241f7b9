//! JSON-RPC Wire Protocol
//!
//! Single responsibility: Encode and decode messages in the gateway's JSON-RPC 2.0 format.
//!
//! # Wire Format
//!
//! ## Request
//! ```text
//! {"jsonrpc": "2.0", "method": <string>, "params": <object>, "id": <u64>}
//! ```
//!
//! ## Response
//! ```text
//! {"jsonrpc": "2.0", "result": <any>, "id": <u64>}
//! {"jsonrpc": "2.0", "error": {"code": <i64>, "message": <string>}, "id": <u64>}
//! ```
//!
//! Decoding is lenient past the top-level object: a response whose `error`
//! strays from that shape still resolves its call, with a best-effort code
//! and message.
//!
//! ## Push
//! Anything whose `id` does not belong to an outstanding request. A push
//! usually carries `method` + `params` and may carry an unrelated `id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClientError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Param keys owned by the request signer.
pub const RESERVED_PARAM_KEYS: [&str; 2] = ["timestamp", "signature"];

/// Code given to an `error` member that carries no usable code.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Read an `error` member of any shape.
    ///
    /// Integer, float and numeric-string codes are accepted. A bare string is
    /// taken as the message. Anything else keeps its JSON text as the message.
    pub fn from_value(value: Value) -> Self {
        let mut map = match value {
            Value::Object(map) => map,
            Value::String(message) => return Self::internal(message),
            other => return Self::internal(other.to_string()),
        };

        let code = map.get("code").and_then(loose_code).unwrap_or(INTERNAL_ERROR_CODE);
        let data = map.remove("data").filter(|d| !d.is_null());
        let message = match map.remove("message") {
            Some(Value::String(message)) => message,
            Some(Value::Null) | None => Value::Object(map).to_string(),
            Some(other) => other.to_string(),
        };
        Self { code, message, data }
    }

    fn internal(message: String) -> Self {
        Self {
            code: INTERNAL_ERROR_CODE,
            message,
            data: None,
        }
    }
}

fn loose_code(code: &Value) -> Option<i64> {
    match code {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl From<RpcError> for ClientError {
    fn from(e: RpcError) -> Self {
        ClientError::Remote {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

/// One wire message: request, response or push.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Envelope {
    /// A request envelope with a numeric id.
    pub fn request(id: u64, method: &str, params: Map<String, Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: Some(Value::from(id)),
            method: Some(method.to_string()),
            params: Some(Value::Object(params)),
            ..Default::default()
        }
    }

    /// The id as a correlation number, if it is one.
    ///
    /// Gateways occasionally echo numeric ids back as strings, so `"7"` is
    /// accepted as well as `7`.
    pub fn numeric_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Could this envelope answer a request? (id present, no method)
    pub fn is_response_shaped(&self) -> bool {
        self.method.is_none() && self.numeric_id().is_some()
    }

    /// Consume a response into the caller-facing outcome.
    ///
    /// `error` wins over `result`; a response with neither resolves to `null`.
    pub fn into_outcome(self) -> Result<Value, ClientError> {
        if let Some(err) = self.error {
            return Err(err.into());
        }
        Ok(self.result.unwrap_or(Value::Null))
    }

    /// Mutable access to the params object, if params is an object.
    pub fn params_object_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.params.as_mut().and_then(Value::as_object_mut)
    }

    /// Look up a string field inside params.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

/// Serialize an envelope for the wire.
pub fn encode(envelope: &Envelope) -> Result<String, ClientError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode one inbound text frame.
///
/// Only malformed JSON and non-object frames fail. Member types are read
/// loosely so that a response with an odd payload still reaches its caller.
pub fn decode(text: &str) -> Result<Envelope, ClientError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(mut map) = value else {
        return Err(ClientError::Protocol(format!(
            "Expected a JSON object, got: {}",
            truncate(text, 120)
        )));
    };

    let present = |v: Value| if v.is_null() { None } else { Some(v) };
    Ok(Envelope {
        jsonrpc: map.remove("jsonrpc").and_then(present).map(string_or_json),
        id: map.remove("id").and_then(present),
        // A non-string method still marks the frame as a push
        method: map.remove("method").and_then(present).map(string_or_json),
        params: map.remove("params").and_then(present),
        result: map.remove("result").and_then(present),
        error: map.remove("error").and_then(present).map(RpcError::from_value),
    })
}

fn string_or_json(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Normalize caller params into the object that goes on the wire.
///
/// `null` becomes `{}`; anything else that is not an object is rejected, as
/// are keys reserved for request signing.
pub fn normalize_params(params: Value) -> Result<Map<String, Value>, ClientError> {
    let map = match params {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => {
            return Err(ClientError::InvalidParams(format!(
                "params must be a JSON object, got {}",
                type_name(&other)
            )))
        }
    };

    if let Some(key) = RESERVED_PARAM_KEYS.iter().find(|k| map.contains_key(**k)) {
        return Err(ClientError::InvalidParams(format!(
            "'{}' is set by the client and cannot be supplied",
            key
        )));
    }

    Ok(map)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
