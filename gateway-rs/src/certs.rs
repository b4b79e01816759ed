//! On-demand certificate management
//!
//! Certificates are looked up per TLS handshake by server name. A host that
//! has no certificate yet is checked against the [`HostPolicy`] and, when
//! allowed, issued one through a [`CertIssuer`]. Issued certificates are kept
//! in memory and in a directory cache so restarts do not re-issue.

use async_trait::async_trait;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::policy::HostPolicy;
use crate::tls::certified_key_from_pem;

/// PEM encoded certificate chain and private key
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Produces a certificate for a host that passed the host policy
#[async_trait]
pub trait CertIssuer: Send + Sync {
    /// Issue a certificate for `host`
    async fn issue(&self, host: &str) -> Result<IssuedCert>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Issues self-signed certificates
///
/// Used in development and tests; clients must be told to trust them.
pub struct SelfSignedIssuer;

#[async_trait]
impl CertIssuer for SelfSignedIssuer {
    async fn issue(&self, host: &str) -> Result<IssuedCert> {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()])
            .map_err(|e| GatewayError::Issuance(format!("Failed to generate certificate: {}", e)))?;

        Ok(IssuedCert {
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
        })
    }

    fn name(&self) -> &'static str {
        "self-signed"
    }
}

/// Certificate storage paths
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    /// Directory holding the host's files
    pub cert_dir: PathBuf,
    /// Certificate file path
    pub cert_path: PathBuf,
    /// Private key file path
    pub key_path: PathBuf,
}

impl CertificatePaths {
    /// Create certificate paths for a host
    pub fn for_host(base_dir: &Path, host: &str) -> Self {
        let cert_dir = base_dir.join(host);
        Self {
            cert_path: cert_dir.join("cert.pem"),
            key_path: cert_dir.join("key.pem"),
            cert_dir,
        }
    }

    async fn load(&self) -> Option<IssuedCert> {
        let cert_pem = tokio::fs::read_to_string(&self.cert_path).await.ok()?;
        let key_pem = tokio::fs::read_to_string(&self.key_path).await.ok()?;
        Some(IssuedCert { cert_pem, key_pem })
    }

    async fn store(&self, issued: &IssuedCert) -> Result<()> {
        tokio::fs::create_dir_all(&self.cert_dir).await?;
        tokio::fs::write(&self.key_path, &issued.key_pem).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.key_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        tokio::fs::write(&self.cert_path, &issued.cert_pem).await?;
        Ok(())
    }
}

/// Whether `host` is a plain DNS name safe to use as a cache directory
pub fn is_valid_host(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('.')
        && !host.contains("..")
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

/// Certificate capability used by TLS listeners
pub struct CertManager {
    policy: HostPolicy,
    issuer: Arc<dyn CertIssuer>,
    cache_dir: PathBuf,
    /// Certificates already loaded or issued, by host
    loaded: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// One issuance at a time per host
    issuing: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CertManager {
    /// Create a manager issuing through `issuer` for hosts `policy` allows
    pub fn new(policy: HostPolicy, issuer: Arc<dyn CertIssuer>, cache_dir: PathBuf) -> Self {
        info!(
            "Certificate manager using {} issuer, cache at {}",
            issuer.name(),
            cache_dir.display()
        );
        Self {
            policy,
            issuer,
            cache_dir,
            loaded: RwLock::new(HashMap::new()),
            issuing: Mutex::new(HashMap::new()),
        }
    }

    /// Get paths for a host's cached certificate
    pub fn cert_paths(&self, host: &str) -> CertificatePaths {
        CertificatePaths::for_host(&self.cache_dir, host)
    }

    /// Return the certificate for `host`, issuing one if the policy allows
    pub async fn certificate(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        if !is_valid_host(host) {
            return Err(GatewayError::Tls(format!("Invalid server name {:?}", host)));
        }

        if let Some(key) = self.cached(host).await {
            return Ok(key);
        }

        let lock = self.issuing_lock(host);
        let result = {
            let _guard = lock.lock().await;
            match self.cached(host).await {
                Some(key) => Ok(key),
                None => self.authorize_and_issue(host).await,
            }
        };
        self.release_issuing_lock(host, &lock);

        result
    }

    async fn cached(&self, host: &str) -> Option<Arc<CertifiedKey>> {
        if let Some(key) = self.loaded.read().await.get(host) {
            return Some(key.clone());
        }

        let issued = self.cert_paths(host).load().await?;
        match certified_key_from_pem(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes()) {
            Ok(key) => {
                debug!("Loaded cached certificate for {}", host);
                let key = Arc::new(key);
                self.loaded.write().await.insert(host.to_string(), key.clone());
                Some(key)
            }
            Err(e) => {
                warn!("Ignoring unreadable cached certificate for {}: {}", host, e);
                None
            }
        }
    }

    async fn authorize_and_issue(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        (self.policy)(host)
            .await
            .map_err(|reason| GatewayError::HostDenied {
                host: host.to_string(),
                reason,
            })?;

        info!("Issuing certificate for {}", host);
        let issued = self.issuer.issue(host).await?;
        let key = Arc::new(certified_key_from_pem(
            issued.cert_pem.as_bytes(),
            issued.key_pem.as_bytes(),
        )?);

        if let Err(e) = self.cert_paths(host).store(&issued).await {
            warn!("Could not cache certificate for {}: {}", host, e);
        }
        self.loaded.write().await.insert(host.to_string(), key.clone());

        Ok(key)
    }

    fn issuing_lock(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut issuing = self.issuing.lock().unwrap_or_else(|e| e.into_inner());
        issuing.entry(host.to_string()).or_default().clone()
    }

    fn release_issuing_lock(&self, host: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut issuing = self.issuing.lock().unwrap_or_else(|e| e.into_inner());
        // the map and this caller hold the only references
        if Arc::strong_count(lock) <= 2 {
            issuing.remove(host);
        }
    }
}
