//! Certificate host policy
//!
//! Decides whether a hostname may obtain a certificate. A host is allowed
//! exactly when the routing store has an entry for it, so certificates are
//! never issued for names the gateway would not route. Lookups that fail or
//! run out of time deny.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::store::{SharedStore, StoreError};

/// Why a host was refused a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// No routing entry exists for the host
    NotFound,
    /// The routing store failed to answer
    Backend(String),
    /// The routing store did not answer in time
    Timeout,
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::NotFound => write!(f, "no routing entry for host"),
            Denial::Backend(e) => write!(f, "routing store unavailable: {}", e),
            Denial::Timeout => write!(f, "routing store lookup timed out"),
        }
    }
}

impl From<StoreError> for Denial {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Denial::NotFound,
            StoreError::Backend(e) => Denial::Backend(e),
        }
    }
}

/// Host authorization callback handed to the certificate manager
pub type HostPolicy = Arc<dyn Fn(&str) -> BoxFuture<'static, Result<(), Denial>> + Send + Sync>;

/// Allow a host iff the routing store resolves it within `timeout`
///
/// The returned policy only reads from the store and may be called from any
/// number of handshakes at once.
pub fn seed_policy(store: SharedStore, timeout: Duration) -> HostPolicy {
    Arc::new(move |host: &str| {
        let store = store.clone();
        let host = host.to_string();
        async move {
            let decision = match tokio::time::timeout(timeout, store.seed(&host)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(Denial::from(e)),
                Err(_) => Err(Denial::Timeout),
            };

            match &decision {
                Ok(()) => debug!("Certificate allowed for {}", host),
                Err(reason) => warn!("Certificate denied for {}: {}", host, reason),
            }
            decision
        }
        .boxed()
    })
}

/// Policy that allows every host, for static test setups
pub fn allow_all() -> HostPolicy {
    Arc::new(|_host: &str| async { Ok::<(), Denial>(()) }.boxed())
}
