// Configuration module for the LinkGuard node
//
// Configuration is read from an optional TOML file and then overridden by
// `LINKGUARD__SECTION__KEY` environment variables, which is how secrets are
// expected to arrive in production.

use crate::error::{LinkGuardError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LINKGUARD";

/// Keys whose environment values are taken byte-for-byte
const VERBATIM_KEYS: [&str; 4] = [
    "secrets.server_secret",
    "secrets.private_key_pem",
    "secrets.private_key_path",
    "operator.token",
];

/// `secrets.server_secret` -> `LINKGUARD__SECRETS__SERVER_SECRET`
fn env_var_name(key: &str) -> String {
    format!("{}__{}", ENV_PREFIX, key.replace('.', "__").to_uppercase())
}

/// LinkGuard node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Public ingest listener
    pub api: ApiConfig,
    /// Per-IP admission control
    pub rate_limit: RateLimitConfig,
    /// Cluster storage
    pub storage: StorageConfig,
    /// Key material and shared secrets
    pub secrets: SecretsConfig,
    /// Operator read listener
    pub operator: OperatorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Text encoding of the ingest ciphertext body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiphertextEncoding {
    Base64,
    Hex,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Ingest bind address
    pub bind_address: String,
    /// Origins allowed to submit signals and fetch the public key
    pub allowed_origins: Vec<String>,
    /// Headers consulted for the source IP, highest priority first
    pub source_ip_headers: Vec<String>,
    /// Encoding of the ciphertext body
    pub ciphertext_encoding: CiphertextEncoding,
    /// Maximum request body size in bytes
    pub max_body_bytes: usize,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests admitted per IP within one window
    pub limit: u32,
    /// Sliding window length in seconds
    pub window_secs: u64,
    /// How often idle per-IP windows are dropped, in seconds
    pub cleanup_interval_secs: u64,
    /// Tracked IP count past which a new IP triggers an immediate cleanup
    pub max_tracked_ips: usize,
}

/// Storage engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngineKind {
    /// SQLite database file
    Sqlite,
    /// Volatile, for development and tests
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage engine type
    pub engine: StorageEngineKind,
    /// Path to the database file (for the sqlite engine)
    pub database_path: PathBuf,
}

/// Secrets. Never logged; `Debug` redacts them.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// HMAC key shared with the trusted backend
    pub server_secret: String,
    /// Path to the PEM private key
    pub private_key_path: Option<PathBuf>,
    /// Inline PEM private key, takes precedence over the path
    pub private_key_pem: Option<String>,
}

/// Operator read API configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorConfig {
    /// Internal bind address
    pub bind_address: String,
    /// Bearer token for operator tooling
    pub token: String,
    /// Largest page a caller may request
    pub max_page_size: usize,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error), `RUST_LOG` wins if set
    pub level: String,
    /// Log format (json, text)
    pub format: LogFormat,
}

fn default_source_ip_headers() -> Vec<String> {
    vec![
        "forwarded".to_string(),
        "x-forwarded-for".to_string(),
        "x-real-ip".to_string(),
        "cf-connecting-ip".to_string(),
        "true-client-ip".to_string(),
    ]
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            allowed_origins: vec![],
            source_ip_headers: default_source_ip_headers(),
            ciphertext_encoding: CiphertextEncoding::Base64,
            max_body_bytes: 4096,
            request_timeout_secs: 10,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 5,
            window_secs: 60,
            cleanup_interval_secs: 300,
            max_tracked_ips: 100_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: StorageEngineKind::Sqlite,
            database_path: PathBuf::from("data/clusters.db"),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8081".to_string(),
            token: String::new(),
            max_page_size: 500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("server_secret", &"<redacted>")
            .field("private_key_path", &self.private_key_path)
            .field(
                "private_key_pem",
                &self.private_key_pem.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl fmt::Debug for OperatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorConfig")
            .field("bind_address", &self.bind_address)
            .field("token", &"<redacted>")
            .field("max_page_size", &self.max_page_size)
            .finish()
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Load configuration from an optional TOML file layered under
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.as_ref()).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("api.allowed_origins")
                .with_list_parse_key("api.source_ip_headers"),
        );

        // Secrets are opaque strings; `try_parsing` would turn "007123" into 7123
        for key in VERBATIM_KEYS {
            if let Ok(value) = std::env::var(env_var_name(key)) {
                builder = builder.set_override(key, value)?;
            }
        }

        Ok(builder.build()?.try_deserialize::<Config>()?)
    }

    /// Load configuration from a TOML file only
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .map_err(|e| LinkGuardError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&config_str)
            .map_err(|e| LinkGuardError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        fs::write(path, config_str)
            .map_err(|e| LinkGuardError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Check everything `serve` needs before any listener is bound.
    pub fn validate(&self) -> Result<()> {
        if self.secrets.server_secret.is_empty() {
            return Err(LinkGuardError::Config(
                "secrets.server_secret must be set".to_string(),
            ));
        }

        if self.secrets.private_key_pem.is_none() && self.secrets.private_key_path.is_none() {
            return Err(LinkGuardError::Config(
                "one of secrets.private_key_pem or secrets.private_key_path must be set"
                    .to_string(),
            ));
        }

        if self.operator.token.is_empty() {
            return Err(LinkGuardError::Config(
                "operator.token must be set".to_string(),
            ));
        }

        if self.operator.token == self.secrets.server_secret {
            return Err(LinkGuardError::Config(
                "operator.token must differ from the ingest secret".to_string(),
            ));
        }

        if self.rate_limit.limit == 0
            || self.rate_limit.window_secs == 0
            || self.rate_limit.cleanup_interval_secs == 0
            || self.rate_limit.max_tracked_ips == 0
        {
            return Err(LinkGuardError::Config(
                "rate_limit.limit, window_secs, cleanup_interval_secs and max_tracked_ips \
                 must be non-zero"
                    .to_string(),
            ));
        }

        if self.api.allowed_origins.is_empty() {
            return Err(LinkGuardError::Config(
                "api.allowed_origins cannot be empty".to_string(),
            ));
        }

        if self.api.source_ip_headers.is_empty() {
            return Err(LinkGuardError::Config(
                "api.source_ip_headers cannot be empty".to_string(),
            ));
        }

        if self.operator.max_page_size == 0 {
            return Err(LinkGuardError::Config(
                "operator.max_page_size must be non-zero".to_string(),
            ));
        }

        for (name, addr) in [
            ("api.bind_address", &self.api.bind_address),
            ("operator.bind_address", &self.operator.bind_address),
        ] {
            addr.parse::<SocketAddr>().map_err(|e| {
                LinkGuardError::Config(format!("Invalid {} {:?}: {}", name, addr, e))
            })?;
        }

        Ok(())
    }
}
