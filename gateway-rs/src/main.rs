//! gateway-rs: host-routed TLS reverse proxy
//!
//! Serves HTTPS for every hostname in the routing store, issuing
//! certificates on demand, with an admin API to manage the routes.

use clap::Parser;
use gateway_rs::certs::{CertManager, SelfSignedIssuer};
use gateway_rs::policy::seed_policy;
use gateway_rs::{store, Gateway, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gateway-rs", version, about = "Host-routed TLS reverse proxy")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(config: &GatewayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::development(),
    };
    config.validate()?;

    init_logging(&config);
    info!("Starting gateway-rs v{}", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No config file specified, using development defaults"),
    }

    if !config.acme.email.is_empty() {
        info!(
            "ACME account {} at {}",
            config.acme.email, config.acme.directory_url
        );
        warn!("ACME issuance is not available in this build, issuing self-signed certificates");
    }

    let store = store::connect(&config.store).await?;

    let policy = seed_policy(store.clone(), config.store.lookup_timeout());
    let certs = Arc::new(CertManager::new(
        policy,
        Arc::new(SelfSignedIssuer),
        PathBuf::from(&config.cert_directory),
    ));

    let gateway = Gateway::bind(&config, store, certs).await?;
    info!(
        "Listening: redirect {}, proxy {}, admin {}",
        gateway.http_addr(),
        gateway.https_addr(),
        gateway.admin_addr()
    );

    gateway.run().await?;

    Ok(())
}
