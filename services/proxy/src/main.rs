//! flow proxy
//!
//! Service-discovery-driven TCP reverse proxy.
//!
//! This service:
//! - Watches a desired-state file for services and their endpoints
//! - Leases a local port per service port and listens on it
//! - Proxies each accepted connection to the next endpoint, round robin
//! - Tears every proxy down on shutdown

use std::sync::Arc;

use anyhow::Result;
use flow_networking::PortAllocator;
use flow_proxy::config::Config;
use flow_proxy::proxy::{Proxier, ServiceBalancer};
use flow_proxy::sync;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLOW_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting flow proxy");
    info!(
        port_range = %config.port_range,
        bind_host = %config.bind_host,
        dial_timeout_ms = config.dial_timeout.as_millis() as u64,
        state_file = %config.state_file.display(),
        once = config.once,
        "Configuration loaded"
    );

    let balancer = Arc::new(ServiceBalancer::new());
    let proxier = Arc::new(Proxier::new(
        balancer.clone(),
        PortAllocator::new(config.port_range),
        config.proxier_config(),
    ));

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!(error = %e, "Failed to listen for ctrl-c, shutting down"),
        }
    };

    match sync::run_until(&config, balancer, proxier, shutdown).await {
        Ok(_) => {
            info!("flow proxy stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "State sync loop failed");
            Err(e)
        }
    }
}
