//! Proxy configuration.
//!
//! Everything is env-driven; unset variables fall back to defaults usable on
//! a developer machine.

use std::{net::IpAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use flow_networking::PortRange;

use crate::proxy::ProxierConfig;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Range proxy ports are leased from.
    pub port_range: PortRange,

    /// Host proxy sockets bind to.
    pub bind_host: IpAddr,

    /// Timeout for dialing a backend.
    pub dial_timeout: Duration,

    /// Desired-state file to watch.
    pub state_file: PathBuf,

    /// Interval between state file polls.
    pub poll_interval: Duration,

    /// Apply the state file once, then serve without polling.
    pub once: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        let proxier = ProxierConfig::default();
        Self {
            port_range: PortRange::DEFAULT,
            bind_host: proxier.bind_host,
            dial_timeout: proxier.dial_timeout,
            state_file: PathBuf::from("flow-state.json"),
            poll_interval: Duration::from_millis(1000),
            once: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let port_range = var("FLOW_PORT_RANGE")
            .map(|v| v.parse::<PortRange>())
            .transpose()
            .context("FLOW_PORT_RANGE must look like 2000-3000.")?
            .unwrap_or(defaults.port_range);

        let bind_host = var("FLOW_BIND_HOST")
            .map(|v| v.parse::<IpAddr>())
            .transpose()
            .context("FLOW_BIND_HOST must be an IP address.")?
            .unwrap_or(defaults.bind_host);

        let dial_timeout = var("FLOW_DIAL_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("FLOW_DIAL_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.dial_timeout);

        let state_file = var("FLOW_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.state_file);

        let poll_interval_ms: u64 = var("FLOW_SYNC_POLL_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("FLOW_SYNC_POLL_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let poll_interval = Duration::from_millis(poll_interval_ms.max(50));

        let once = var("FLOW_SYNC_ONCE")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let log_level = var("FLOW_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            port_range,
            bind_host,
            dial_timeout,
            state_file,
            poll_interval,
            once,
            log_level,
        })
    }

    /// Settings for the proxier.
    pub fn proxier_config(&self) -> ProxierConfig {
        ProxierConfig {
            bind_host: self.bind_host,
            dial_timeout: self.dial_timeout,
        }
    }
}
