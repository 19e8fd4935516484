//! Desired-state synchronization.
//!
//! Polls a JSON [`DesiredState`] file and pushes changes into the balancer
//! (endpoints) and the proxier (services). Endpoints are applied first so a
//! newly started proxy already has backends.

use std::{fs, future::Future, io, path::Path, sync::Arc};

use anyhow::{Context, Result};
use flow_api::DesiredState;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::proxy::{Proxier, ServiceBalancer, UpdateSummary};

/// Read the state file. A missing or blank file is an empty state.
pub fn read_state(path: &Path) -> Result<DesiredState> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DesiredState::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read state file {}", path.display()))
        }
    };
    if raw.trim().is_empty() {
        return Ok(DesiredState::default());
    }

    DesiredState::from_json(&raw)
        .with_context(|| format!("Invalid state file {}", path.display()))
}

/// What has been pushed downstream so far.
#[derive(Debug, Default)]
pub struct SyncState {
    applied: DesiredState,
    /// Last services pass had failures and must run again.
    retry_services: bool,
}

impl SyncState {
    pub fn applied(&self) -> &DesiredState {
        &self.applied
    }
}

/// Push the parts of `next` that differ from what was applied.
///
/// Returns the proxier summary when services were reconciled.
pub async fn apply_state(
    state: &mut SyncState,
    next: DesiredState,
    balancer: &ServiceBalancer,
    proxier: &Arc<Proxier>,
) -> Option<UpdateSummary> {
    if next.endpoints != state.applied.endpoints {
        balancer.update(&next.endpoints).await;
        info!(
            endpoint_count = next.endpoints.len(),
            "Endpoints updated"
        );
    }

    let services_changed = next.services != state.applied.services;
    let summary = if services_changed || state.retry_services {
        let summary = proxier.update(&next.services).await;
        info!(
            started = summary.started.len(),
            replaced = summary.replaced.len(),
            stopped = summary.stopped.len(),
            unchanged = summary.unchanged.len(),
            failed = summary.failed.len(),
            "Services reconciled"
        );
        state.retry_services = !summary.failed.is_empty();
        Some(summary)
    } else {
        None
    };

    state.applied = next;
    summary
}

/// Poll the state file and keep balancer and proxier in line with it.
///
/// Read or parse failures are logged and the previous state stays in force.
pub async fn run_state_sync_loop(
    config: &Config,
    balancer: Arc<ServiceBalancer>,
    proxier: Arc<Proxier>,
) -> Result<()> {
    let mut state = SyncState::default();

    loop {
        match read_state(&config.state_file) {
            Ok(next) => {
                apply_state(&mut state, next, &balancer, &proxier).await;
            }
            Err(e) => {
                warn!(
                    state_file = %config.state_file.display(),
                    error = %format!("{e:#}"),
                    "Failed to load desired state; keeping previous"
                );
            }
        }

        if config.once {
            info!(
                service_count = state.applied.services.len(),
                "sync complete"
            );
            return Ok(());
        }

        debug!("Waiting for next state poll");
        tokio::time::sleep(config.poll_interval).await;
    }
}

/// Sync state until `shutdown` resolves, then stop every proxy.
///
/// In once mode the file is applied a single time and the proxies keep
/// serving until shutdown.
pub async fn run_until<F>(
    config: &Config,
    balancer: Arc<ServiceBalancer>,
    proxier: Arc<Proxier>,
    shutdown: F,
) -> Result<UpdateSummary>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let synced = tokio::select! {
        result = run_state_sync_loop(config, balancer, Arc::clone(&proxier)) => Some(result),
        _ = &mut shutdown => None,
    };
    let result = match synced {
        Some(Ok(())) => {
            info!("State applied once, serving until shutdown");
            shutdown.await;
            Ok(())
        }
        Some(Err(e)) => Err(e),
        None => Ok(()),
    };

    let summary = proxier.update(&[]).await;
    info!(stopped = summary.stopped.len(), "All service proxies stopped");
    result.map(|()| summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxierConfig, ServicePortName};
    use flow_api::{EndpointPort, Endpoints, Service, ServicePort};
    use flow_networking::{PortAllocator, PortRange};
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn setup(min: u16, max: u16) -> (Arc<ServiceBalancer>, Arc<Proxier>) {
        let balancer = Arc::new(ServiceBalancer::new());
        let proxier = Arc::new(Proxier::new(
            balancer.clone(),
            PortAllocator::new(PortRange::new(min, max).unwrap()),
            ProxierConfig {
                bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                ..Default::default()
            },
        ));
        (balancer, proxier)
    }

    fn desired() -> DesiredState {
        DesiredState {
            services: vec![Service::new("echo", vec![ServicePort::tcp("", 80)])],
            endpoints: vec![Endpoints::new(
                "echo",
                vec!["127.0.0.1".to_string()],
                vec![EndpointPort::new("", 9000)],
            )],
        }
    }

    #[test]
    fn test_read_state_missing_or_blank() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(read_state(&path).unwrap(), DesiredState::default());

        fs::write(&path, "  \n").unwrap();
        assert_eq!(read_state(&path).unwrap(), DesiredState::default());
    }

    #[test]
    fn test_read_state_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        fs::write(&path, "{not json").unwrap();
        assert!(read_state(&path).is_err());

        fs::write(&path, r#"{"services":[{"name":"","ports":[]}]}"#).unwrap();
        assert!(read_state(&path).is_err());
    }

    #[test]
    fn test_read_state_parses_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, serde_json::to_string(&desired()).unwrap()).unwrap();

        assert_eq!(read_state(&path).unwrap(), desired());
    }

    #[tokio::test]
    async fn test_apply_state_only_pushes_changes() {
        let (balancer, proxier) = setup(47900, 47910);
        let mut state = SyncState::default();
        let id = ServicePortName::new("echo", "");

        let summary = apply_state(&mut state, desired(), &balancer, &proxier)
            .await
            .unwrap();
        assert_eq!(summary.started, vec![id.clone()]);
        assert_eq!(
            balancer.endpoints(&id).await,
            Some(vec!["127.0.0.1:9000".to_string()])
        );

        assert!(apply_state(&mut state, desired(), &balancer, &proxier)
            .await
            .is_none());

        let mut next = desired();
        next.endpoints.clear();
        assert!(apply_state(&mut state, next, &balancer, &proxier)
            .await
            .is_none());
        assert!(!balancer.contains(&id).await);

        let summary = apply_state(&mut state, DesiredState::default(), &balancer, &proxier)
            .await
            .unwrap();
        assert_eq!(summary.stopped, vec![id]);
        assert_eq!(proxier.proxy_ports().claimed_count(), 0);
    }

    #[tokio::test]
    async fn test_apply_state_retries_failed_services() {
        let (balancer, proxier) = setup(47910, 47911);
        let mut state = SyncState::default();
        let mut next = desired();
        next.services
            .push(Service::new("other", vec![ServicePort::tcp("", 81)]));

        let summary = apply_state(&mut state, next.clone(), &balancer, &proxier)
            .await
            .unwrap();
        assert_eq!(summary.started.len(), 1);
        assert_eq!(summary.failed.len(), 1);

        let summary = apply_state(&mut state, next, &balancer, &proxier)
            .await
            .unwrap();
        assert_eq!(summary.unchanged.len(), 1);
        assert_eq!(summary.failed.len(), 1);

        proxier.update(&[]).await;
    }

    #[tokio::test]
    async fn test_run_once_applies_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, serde_json::to_string(&desired()).unwrap()).unwrap();

        let (balancer, proxier) = setup(47920, 47930);
        let config = Config {
            state_file: path,
            once: true,
            ..Config::default()
        };

        run_state_sync_loop(&config, balancer.clone(), proxier.clone())
            .await
            .unwrap();

        assert_eq!(proxier.services().await, vec![ServicePortName::new("echo", "")]);
        assert!(balancer.contains(&ServicePortName::new("echo", "")).await);
        proxier.update(&[]).await;
    }

    #[tokio::test]
    async fn test_once_mode_serves_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, serde_json::to_string(&desired()).unwrap()).unwrap();

        let (balancer, proxier) = setup(47940, 47950);
        let config = Config {
            state_file: path,
            once: true,
            ..Config::default()
        };
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let run = tokio::spawn({
            let proxier = Arc::clone(&proxier);
            async move {
                run_until(&config, balancer, proxier, async {
                    let _ = shutdown_rx.await;
                })
                .await
            }
        });

        let id = ServicePortName::new("echo", "");
        let info = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let Some(info) = proxier.get_service_info(&id).await {
                    return info;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Still serving after the single pass.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!run.is_finished());
        assert!(tokio::net::TcpStream::connect(("127.0.0.1", info.proxy_port))
            .await
            .is_ok());

        shutdown_tx.send(()).unwrap();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.stopped, vec![id]);
        assert!(proxier.services().await.is_empty());
        assert_eq!(proxier.proxy_ports().claimed_count(), 0);
    }

    #[tokio::test]
    async fn test_run_once_keeps_going_on_bad_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "42").unwrap();

        let (balancer, proxier) = setup(47930, 47940);
        let config = Config {
            state_file: path,
            once: true,
            ..Config::default()
        };

        run_state_sync_loop(&config, balancer, proxier.clone())
            .await
            .unwrap();
        assert!(proxier.services().await.is_empty());
    }
}
