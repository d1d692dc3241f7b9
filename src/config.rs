//! Configuration for iwan-client

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::ClientError;

/// Where the gateway lives.
///
/// The final URL is `<scheme>://<host>:<port>/<flag>/<version>/<API-KEY>`;
/// empty `flag`/`version` segments are left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayEndpoint {
    /// Gateway host name
    #[serde(default = "default_host")]
    pub host: String,

    /// Gateway port
    #[serde(default = "default_port")]
    pub port: u16,

    /// First path segment (the socket flavour, "ws")
    #[serde(default = "default_flag")]
    pub flag: String,

    /// API version path segment
    #[serde(default = "default_version")]
    pub version: String,

    /// Use TLS (wss://)
    #[serde(default = "default_true")]
    pub secure: bool,
}

fn default_host() -> String {
    "api.wanchain.org".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_flag() -> String {
    "ws".to_string()
}

fn default_version() -> String {
    "v3".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for GatewayEndpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            flag: default_flag(),
            version: default_version(),
            secure: true,
        }
    }
}

impl GatewayEndpoint {
    /// The public testnet gateway.
    pub fn testnet() -> Self {
        Self {
            host: "apitest.wanchain.org".to_string(),
            ..Self::default()
        }
    }

    /// Build an endpoint from a base URL such as `ws://127.0.0.1:9000/ws/v3`.
    ///
    /// The API key is appended later, so the URL must not already carry it.
    pub fn from_url(base: &str) -> Result<Self, ClientError> {
        let url = Url::parse(base)
            .map_err(|e| ClientError::Config(format!("Invalid endpoint URL '{}': {}", base, e)))?;

        let secure = match url.scheme() {
            "wss" => true,
            "ws" => false,
            other => {
                return Err(ClientError::Config(format!(
                    "Unsupported endpoint scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ClientError::Config(format!("Endpoint URL '{}' has no host", base)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        if segments.len() > 2 {
            return Err(ClientError::Config(format!(
                "Endpoint URL '{}' has too many path segments",
                base
            )));
        }

        Ok(Self {
            host,
            port,
            flag: segments.first().map(|s| s.to_string()).unwrap_or_default(),
            version: segments.get(1).map(|s| s.to_string()).unwrap_or_default(),
            secure,
        })
    }

    /// Full connection URL with the API key embedded in the path.
    pub fn url_for(&self, api_key: &str) -> Result<Url, ClientError> {
        if api_key.is_empty() {
            return Err(ClientError::Config("API key must not be empty".into()));
        }

        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{}://{}:{}/", scheme, self.host, self.port))
            .map_err(|e| ClientError::Config(format!("Invalid endpoint: {}", e)))?;

        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ClientError::Config("Endpoint cannot carry a path".into()))?;
            path.clear();
            for segment in [self.flag.as_str(), self.version.as_str()] {
                if !segment.is_empty() {
                    path.push(segment);
                }
            }
            path.push(api_key);
        }

        Ok(url)
    }

    /// Same as [`url_for`](Self::url_for) but with the key masked, for logs.
    pub fn redacted(&self, api_key: &str) -> String {
        let visible: String = api_key.chars().take(4).collect();
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut out = format!("{}://{}:{}", scheme, self.host, self.port);
        for segment in [self.flag.as_str(), self.version.as_str()] {
            if !segment.is_empty() {
                out.push('/');
                out.push_str(segment);
            }
        }
        out.push('/');
        out.push_str(&visible);
        out.push_str("***");
        out
    }
}

/// Client configuration.
///
/// Every field has a default, so an empty TOML document is a valid config.
/// Unrecognized fields are rejected rather than ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Gateway location
    #[serde(default)]
    pub endpoint: GatewayEndpoint,

    /// Reconnect automatically after an unexpected disconnect
    #[serde(default = "default_true")]
    pub reconnect: bool,

    /// Reconnect attempts before giving up (absent = retry until closed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// First backoff delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Default per-call timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Deadline for socket open plus authentication handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Period of the pending-call expiry sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Keepalive ping period (0 = no pings)
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Outbound frames that may be queued before sends fail
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Attach timestamp + HMAC signature to every request
    #[serde(default = "default_true")]
    pub sign_requests: bool,

    /// Perform the authentication handshake after connecting
    #[serde(default = "default_true")]
    pub handshake: bool,

    /// JSON-RPC method used for the handshake
    #[serde(default = "default_handshake_method")]
    pub handshake_method: String,
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    100
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_send_queue_capacity() -> usize {
    1024
}

fn default_handshake_method() -> String {
    "authenticate".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: GatewayEndpoint::default(),
            reconnect: true,
            max_retries: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            send_queue_capacity: default_send_queue_capacity(),
            sign_requests: true,
            handshake: true,
            handshake_method: default_handshake_method(),
        }
    }
}

impl ClientConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ClientError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.request_timeout_ms == 0 {
            return Err(ClientError::Config("request_timeout_ms must be > 0".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ClientError::Config("handshake_timeout_ms must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(ClientError::Config("sweep_interval_ms must be > 0".into()));
        }
        if self.send_queue_capacity == 0 {
            return Err(ClientError::Config("send_queue_capacity must be > 0".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(ClientError::Config("backoff_base_ms must be > 0".into()));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ClientError::Config(format!(
                "backoff_base_ms ({}) exceeds backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        if self.handshake && self.handshake_method.trim().is_empty() {
            return Err(ClientError::Config(
                "handshake_method must be set when handshake is enabled".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// `None` when keepalive pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert!(config.reconnect);
        assert_eq!(config.max_retries, None);
        assert_eq!(config.backoff_base_ms, 500);
        assert_eq!(config.backoff_cap_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_endpoint_url() {
        let url = GatewayEndpoint::default().url_for("my-key").unwrap();
        assert_eq!(url.as_str(), "wss://api.wanchain.org:8443/ws/v3/my-key");
    }

    #[test]
    fn test_endpoint_from_url() {
        let endpoint = GatewayEndpoint::from_url("ws://127.0.0.1:9000/ws/v3").unwrap();
        assert!(!endpoint.secure);
        assert_eq!(endpoint.port, 9000);
        assert_eq!(
            endpoint.url_for("abc").unwrap().as_str(),
            "ws://127.0.0.1:9000/ws/v3/abc"
        );

        let bare = GatewayEndpoint::from_url("ws://localhost:4000").unwrap();
        assert_eq!(bare.url_for("abc").unwrap().as_str(), "ws://localhost:4000/abc");
    }

    #[test]
    fn test_endpoint_rejects_http_scheme() {
        assert!(matches!(
            GatewayEndpoint::from_url("http://example.com/ws/v3"),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_redacted_hides_key() {
        let shown = GatewayEndpoint::testnet().redacted("abcdef123456");
        assert_eq!(shown, "wss://apitest.wanchain.org:8443/ws/v3/abcd***");
        assert!(!shown.contains("123456"));
    }

    #[test]
    fn test_validate_backoff_order() {
        let config = ClientConfig {
            backoff_base_ms: 5_000,
            backoff_cap_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_ping_interval_disabled() {
        let config = ClientConfig {
            ping_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.ping_interval(), None);
    }
}
