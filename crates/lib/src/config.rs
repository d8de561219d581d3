//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.pushgate/config.json`) and environment.
//! A missing file means defaults: loopback gateway, legacy backend endpoints, no apps.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// RPC front end settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Backend endpoints, limits, and timeouts.
    #[serde(default)]
    pub push: PushConfig,

    /// Trust roots for backend server certificates.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Applications provisioned when the gateway starts.
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 7077).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect.auth.token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by PUSHGATE_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    7077
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Backend-facing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    /// Ceiling for the serialized notification payload (legacy frame format: 256).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Bound on waiting for the write path, a connect attempt, and each frame write during notify.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Bound on reading the feedback stream to completion.
    #[serde(default = "default_feedback_timeout_secs")]
    pub feedback_timeout_secs: u64,

    /// Connect timeout used when provision does not pass one.
    #[serde(default = "default_connect_timeout_secs")]
    pub default_connect_timeout_secs: u64,

    /// When set, frames carry expiry = now + ttl; otherwise 0 (no expiry).
    #[serde(default)]
    pub notification_ttl_secs: Option<u32>,

    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

fn default_max_payload_bytes() -> usize {
    crate::codec::DEFAULT_MAX_PAYLOAD
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_feedback_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    15
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            call_timeout_secs: default_call_timeout_secs(),
            feedback_timeout_secs: default_feedback_timeout_secs(),
            default_connect_timeout_secs: default_connect_timeout_secs(),
            notification_ttl_secs: None,
            endpoints: EndpointsConfig::default(),
        }
    }
}

impl PushConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_secs(self.feedback_timeout_secs)
    }
}

/// `host:port` pairs per environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointsConfig {
    #[serde(default = "default_sandbox_endpoints")]
    pub sandbox: EnvironmentEndpoints,
    #[serde(default = "default_production_endpoints")]
    pub production: EnvironmentEndpoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentEndpoints {
    pub gateway: String,
    pub feedback: String,
}

fn default_sandbox_endpoints() -> EnvironmentEndpoints {
    EnvironmentEndpoints {
        gateway: "gateway.sandbox.push.apple.com:2195".to_string(),
        feedback: "feedback.sandbox.push.apple.com:2196".to_string(),
    }
}

fn default_production_endpoints() -> EnvironmentEndpoints {
    EnvironmentEndpoints {
        gateway: "gateway.push.apple.com:2195".to_string(),
        feedback: "feedback.push.apple.com:2196".to_string(),
    }
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            sandbox: default_sandbox_endpoints(),
            production: default_production_endpoints(),
        }
    }
}

/// Where backend server certificates are verified against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Load the platform's trust store (default true).
    #[serde(default = "default_native_roots")]
    pub native_roots: bool,

    /// Extra PEM bundle of CA certificates.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn default_native_roots() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            native_roots: default_native_roots(),
            ca_file: None,
        }
    }
}

/// One application to provision at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub app_id: String,
    /// Path to a PEM file, or the PEM text itself.
    pub cert: String,
    /// "sandbox" or "production".
    pub environment: String,
    /// Connect timeout in seconds (default push.defaultConnectTimeoutSecs).
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Resolve the gateway token: env PUSHGATE_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("PUSHGATE_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .gateway
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PUSHGATE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".pushgate").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or PUSHGATE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    if config.push.max_payload_bytes > u16::MAX as usize {
        anyhow::bail!(
            "push.maxPayloadBytes is {} in {}; frames carry a 16-bit payload length (max {})",
            config.push.max_payload_bytes,
            path.display(),
            u16::MAX
        );
    }
    Ok((config, path))
}
