//! TLS configuration and handshakes
//!
//! Supports both static certificates and per-handshake certificate lookup
//! through the client's server name indication.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor};
use tracing::{debug, info};

use crate::certs::CertManager;
use crate::error::{GatewayError, Result};

/// Parse a PEM certificate chain and private key
pub fn parse_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<(Vec<Certificate>, PrivateKey)> {
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .map_err(|e| GatewayError::Tls(format!("Failed to read certificates: {}", e)))?
        .into_iter()
        .map(Certificate)
        .collect();

    if certs.is_empty() {
        return Err(GatewayError::Tls("No certificates found".to_string()));
    }

    // PKCS8 first, then RSA and SEC1
    let key = rustls_pemfile::read_all(&mut BufReader::new(key_pem))
        .map_err(|e| GatewayError::Tls(format!("Failed to read private key: {}", e)))?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| GatewayError::Tls("No private key found".to_string()))?;

    Ok((certs, key))
}

/// Build a signing-ready certificate from PEM data
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey> {
    let (certs, key) = parse_pem(cert_pem, key_pem)?;
    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| GatewayError::Tls(format!("Unsupported private key: {}", e)))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Load a static certificate and key from files
pub fn load_static_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    info!(
        "Loading TLS certificate from {} and {}",
        cert_path.display(),
        key_path.display()
    );

    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| GatewayError::Tls(format!("Failed to open certificate file: {}", e)))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| GatewayError::Tls(format!("Failed to open key file: {}", e)))?;
    let (certs, key) = parse_pem(&cert_pem, &key_pem)?;

    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::Tls(format!("TLS config error: {}", e)))?;
    config.alpn_protocols = alpn_protocols();

    Ok(Arc::new(config))
}

fn alpn_protocols() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

/// Resolver that always presents one certificate
struct Resolved(Arc<CertifiedKey>);

impl ResolvesServerCert for Resolved {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn config_for(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(Resolved(key)));
    config.alpn_protocols = alpn_protocols();
    Arc::new(config)
}

/// How a listener terminates TLS
#[derive(Clone)]
pub enum Acceptor {
    /// Certificate chosen per handshake from the server name
    OnDemand(Arc<CertManager>),
    /// One fixed certificate
    Static(Arc<ServerConfig>),
}

impl Acceptor {
    /// Complete a handshake, returning the stream and the client's server name
    pub async fn accept(&self, stream: TcpStream) -> Result<(TlsStream<TcpStream>, Option<String>)> {
        match self {
            Acceptor::Static(config) => {
                let tls = TlsAcceptor::from(config.clone()).accept(stream).await?;
                let server_name = tls.get_ref().1.server_name().map(str::to_string);
                Ok((tls, server_name))
            }
            Acceptor::OnDemand(certs) => {
                let start =
                    LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;

                let server_name = start
                    .client_hello()
                    .server_name()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        GatewayError::Tls("client did not send a server name".to_string())
                    })?;
                debug!("TLS client hello for {}", server_name);

                let key = certs.certificate(&server_name).await?;
                let tls = start.into_stream(config_for(key)).await?;
                Ok((tls, Some(server_name)))
            }
        }
    }
}
