//! Configuration for gateway-rs
//!
//! Loaded from a TOML file layered with `GATEWAY__SECTION__KEY` environment
//! overrides (for example `GATEWAY__API__TOKEN`).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Directory holding issued certificates, one sub-directory per host
    #[serde(default = "default_cert_directory")]
    pub cert_directory: String,
    /// Maximum proxied request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Maximum request header size in bytes
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Admin API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Certificate authority configuration
    #[serde(default)]
    pub acme: AcmeConfig,
    /// Routing store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Plaintext redirect listener (e.g., "0.0.0.0:80")
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// TLS proxy listener (e.g., "0.0.0.0:443")
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// Reject requests whose host differs from the TLS server name
    #[serde(default)]
    pub strict_identity: bool,
    /// Time allowed for the TLS handshake and request headers
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Time allowed to produce a response head
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// Keep-alive window for idle HTTP/2 connections
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Listen address (e.g., "0.0.0.0:8443")
    #[serde(default = "default_api_addr")]
    pub addr: String,
    /// Serve the admin API over TLS
    #[serde(default)]
    pub use_ssl: bool,
    /// Static bearer token; an empty token rejects every request
    #[serde(default)]
    pub token: String,
    /// Caller addresses allowed to use the API
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Static certificate for the admin listener (otherwise on-demand)
    pub cert_path: Option<String>,
    /// Static private key for the admin listener
    pub key_path: Option<String>,
}

/// Certificate authority configuration
///
/// Loaded and logged only. Certificates come from the self-signed issuer
/// until an ACME [`CertIssuer`](crate::certs::CertIssuer) is plugged in, so
/// these settings have no effect on issuance yet.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcmeConfig {
    /// Contact email registered with the certificate authority
    #[serde(default)]
    pub email: String,
    /// ACME directory URL
    #[serde(default = "default_acme_directory")]
    pub directory_url: String,
}

/// Routing store backend
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map
    Memory,
    /// Shared Redis server
    Redis,
}

/// Routing store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Upper bound for the certificate gate's lookup
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisConfig,
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Key prefix
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
    /// Server host
    #[serde(default = "default_redis_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Optional password
    pub password: Option<String>,
    /// Upper bound for a single store operation
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_cert_directory() -> String {
    "/var/lib/gateway-rs/certs".to_string()
}

fn default_max_body_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_max_header_bytes() -> usize {
    1024 * 1024
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_read_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_api_addr() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}

fn default_lookup_timeout() -> u64 {
    2000
}

fn default_redis_prefix() -> String {
    "gateway".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_timeout() -> u64 {
    1000
}

fn default_log_level() -> String {
    "gateway_rs=info,tower_http=info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            strict_identity: false,
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
            use_ssl: false,
            token: String::new(),
            allowed_ips: Vec::new(),
            cert_path: None,
            key_path: None,
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            directory_url: default_acme_directory(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            lookup_timeout_ms: default_lookup_timeout(),
            redis: RedisConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            prefix: default_redis_prefix(),
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            timeout_ms: default_redis_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl StoreConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file plus environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("api.allowed_ips")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to read config: {}", e)))?;

        config
            .try_deserialize()
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        Self {
            cert_directory: std::env::temp_dir()
                .join("gateway-rs-certs")
                .to_string_lossy()
                .into_owned(),
            max_body_bytes: default_max_body_bytes(),
            max_header_bytes: default_max_header_bytes(),
            server: ServerConfig {
                http_addr: "127.0.0.1:8080".to_string(),
                https_addr: "127.0.0.1:8443".to_string(),
                ..ServerConfig::default()
            },
            api: ApiConfig {
                addr: "127.0.0.1:9443".to_string(),
                token: "development-token".to_string(),
                allowed_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
                ..ApiConfig::default()
            },
            acme: AcmeConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig {
                level: "gateway_rs=debug,tower_http=debug".to_string(),
                ..LoggingConfig::default()
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cert_directory.is_empty() {
            return Err(GatewayError::Config("cert_directory must be set".to_string()));
        }

        if self.max_body_bytes == 0 {
            return Err(GatewayError::Config(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }

        for (name, addr) in [
            ("server.http_addr", &self.server.http_addr),
            ("server.https_addr", &self.server.https_addr),
            ("api.addr", &self.api.addr),
        ] {
            addr.parse::<std::net::SocketAddr>().map_err(|e| {
                GatewayError::Config(format!("Invalid {} '{}': {}", name, addr, e))
            })?;
        }

        for ip in &self.api.allowed_ips {
            ip.parse::<std::net::IpAddr>().map_err(|e| {
                GatewayError::Config(format!("Invalid api.allowed_ips entry '{}': {}", ip, e))
            })?;
        }

        if self.api.cert_path.is_some() != self.api.key_path.is_some() {
            return Err(GatewayError::Config(
                "api.cert_path and api.key_path must be set together".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(GatewayError::Config(format!(
                "Unknown logging.format '{}'",
                self.logging.format
            )));
        }

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
cert_directory = "/tmp/certs"
max_body_bytes = 1024

[server]
strict_identity = true

[api]
use_ssl = true
token = "secret"
allowed_ips = ["10.0.0.1"]

[acme]
email = "ops@example.com"

[store]
backend = "redis"

[store.redis]
host = "redis.internal"
password = "hunter2"
"#;
        let config = GatewayConfig::from_toml(toml).unwrap();
        assert_eq!(config.max_body_bytes, 1024);
        assert_eq!(config.max_header_bytes, default_max_header_bytes());
        assert!(config.server.strict_identity);
        assert_eq!(config.server.read_timeout(), Duration::from_secs(10));
        assert_eq!(config.server.write_timeout(), Duration::from_secs(15));
        assert_eq!(config.server.idle_timeout(), Duration::from_secs(120));
        assert_eq!(config.api.allowed_ips, vec!["10.0.0.1".to_string()]);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis.port, 6379);
        assert_eq!(config.store.redis.prefix, "gateway");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
cert_directory = "/tmp/certs"

[api]
addr = "127.0.0.1:7000"
token = "from-file"
"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.api.addr, "127.0.0.1:7000");
        assert_eq!(config.api.token, "from-file");
        assert_eq!(config.server.https_addr, "0.0.0.0:443");
    }

    #[test]
    fn test_validate_rejects_bad_allowed_ip() {
        let mut config = GatewayConfig::development();
        config.api.allowed_ips.push("not-an-ip".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_cert_and_key_together() {
        let mut config = GatewayConfig::development();
        config.api.cert_path = Some("/etc/gateway/admin.pem".to_string());
        assert!(config.validate().is_err());
    }
}
