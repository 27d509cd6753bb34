//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file given on the command line
//! - `huddle.toml`, `/etc/huddle/huddle.toml` or `~/.config/huddle/huddle.toml`
//! - Environment variables (`HUDDLE_*`) filling in defaults

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identity this service runs as.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Token and bearer verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Service identity, as published in `/.well-known/did.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// DID of the deployed service. Required.
    #[serde(default = "default_did")]
    pub did: String,

    /// Public base URL. Derived from the request when unset.
    #[serde(default = "default_public_url")]
    pub public_url: Option<String>,

    /// Fragment id of the service entry.
    #[serde(default = "default_service_fragment")]
    pub service_fragment: String,

    /// Type of the service entry.
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Lifetime of upgrade tokens in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Token accepted for any identity. Development only.
    #[serde(default = "default_unsafe_dev_token")]
    pub unsafe_dev_token: Option<String>,

    /// HS256 secret used to verify bearer JWTs.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: Option<String>,

    /// XRPC method that mints upgrade tokens.
    #[serde(default = "default_token_method")]
    pub token_method: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

// Default value functions
fn default_host() -> String {
    env("HUDDLE_HOST").unwrap_or_else(|| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    env("HUDDLE_PORT")
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_did() -> String {
    env("HUDDLE_DID").unwrap_or_default()
}

fn default_public_url() -> Option<String> {
    env("HUDDLE_PUBLIC_URL")
}

fn default_service_fragment() -> String {
    "#huddle_router".to_string()
}

fn default_service_type() -> String {
    "HuddleRouter".to_string()
}

fn default_token_ttl() -> u64 {
    30
}

fn default_unsafe_dev_token() -> Option<String> {
    env("HUDDLE_UNSAFE_DEV_TOKEN")
}

fn default_jwt_secret() -> Option<String> {
    env("HUDDLE_JWT_SECRET")
}

fn default_token_method() -> String {
    "chat.roomy.v0.router.token".to_string()
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MB
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            service: ServiceConfig::default(),
            auth: AuthConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            did: default_did(),
            public_url: default_public_url(),
            service_fragment: default_service_fragment(),
            service_type: default_service_type(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl(),
            unsafe_dev_token: default_unsafe_dev_token(),
            jwt_secret: default_jwt_secret(),
            token_method: default_token_method(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, the default paths, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }

        let config_paths = [
            "huddle.toml",
            "/etc/huddle/huddle.toml",
            "~/.config/huddle/huddle.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check the settings the server cannot start without.
    ///
    /// # Errors
    ///
    /// Returns an error if the service DID is missing or malformed.
    pub fn validate(&self) -> Result<()> {
        if self.service.did.is_empty() {
            bail!("service.did must be set (or HUDDLE_DID) to the DID of this deployed service");
        }
        if !self.service.did.starts_with("did:") {
            bail!("service.did is not a DID: {}", self.service.did);
        }
        if self.auth.token_ttl_secs == 0 {
            bail!("auth.token_ttl_secs must be greater than zero");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Lifetime of upgrade tokens.
    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.token_ttl_secs)
    }
}
