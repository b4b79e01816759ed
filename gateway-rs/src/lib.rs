//! gateway-rs: host-routed TLS reverse proxy
//!
//! Terminates TLS for any hostname that has an entry in the routing store,
//! obtaining certificates on demand, and forwards each request to the
//! backend target stored for its host.
//!
//! # Features
//!
//! - On-demand certificates, only for hosts the routing store knows
//! - Routing store in memory or in Redis
//! - Authenticated admin API to create, read and delete routing entries
//! - Plaintext listener redirecting to HTTPS
//!
//! # Example Configuration
//!
//! ```toml
//! cert_directory = "/var/lib/gateway-rs/certs"
//! max_body_bytes = 104857600
//!
//! [server]
//! http_addr = "0.0.0.0:80"
//! https_addr = "0.0.0.0:443"
//! strict_identity = true
//!
//! [api]
//! addr = "0.0.0.0:8443"
//! use_ssl = true
//! token = "change-me"
//! allowed_ips = ["10.0.0.5"]
//!
//! [acme]
//! email = "admin@example.com"
//!
//! [store]
//! backend = "redis"
//!
//! [store.redis]
//! host = "127.0.0.1"
//! port = 6379
//! prefix = "gateway"
//! ```

pub mod admin;
pub mod certs;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod policy;
pub mod redirect;
pub mod response;
pub mod server;
pub mod store;
pub mod tls;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use server::Gateway;
