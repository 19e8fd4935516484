//! Reconciliation of desired services against running proxy sockets.
//!
//! For each service port of a snapshot the proxier either keeps the running
//! socket, replaces it (protocol or declared port changed), or provisions a
//! new one on a port leased from the allocator. Entries missing from the
//! snapshot are torn down and their ports released.
//!
//! Invariants:
//! - Every live entry with a leased port holds a claim in the allocator,
//!   released exactly once on teardown
//! - Each provisioning gets a new generation; an accept loop only runs while
//!   the map still holds its generation
//! - The map lock is never held across socket or allocator calls

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flow_api::{Service, ServicePort};
use flow_networking::PortAllocator;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use super::balancer::{LoadBalancer, ServicePortName};
use super::error::ProxyError;
use super::socket::{new_proxy_socket, Protocol, ProxySocket, DEFAULT_DIAL_TIMEOUT};

/// Proxier configuration.
#[derive(Debug, Clone)]
pub struct ProxierConfig {
    /// Host proxy sockets bind to.
    pub bind_host: IpAddr,
    /// Timeout for dialing a backend.
    pub dial_timeout: Duration,
}

impl Default for ProxierConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// A running proxy for one service port.
pub struct ServiceInfo {
    pub protocol: Protocol,
    /// Declared port of the service port this entry was provisioned for.
    pub service_port: u16,
    /// Port the proxy socket listens on.
    pub proxy_port: u16,
    pub generation: u64,
    /// Whether `proxy_port` is a claim in the allocator.
    leased: bool,
    socket: Arc<dyn ProxySocket>,
}

impl ServiceInfo {
    pub fn socket(&self) -> &Arc<dyn ProxySocket> {
        &self.socket
    }

    pub fn is_leased(&self) -> bool {
        self.leased
    }

    /// Check if this entry still serves `port` as declared.
    fn matches(&self, port: &ServicePort) -> bool {
        port.protocol.parse::<Protocol>().ok() == Some(self.protocol)
            && self.service_port == port.port
    }
}

impl std::fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("protocol", &self.protocol)
            .field("service_port", &self.service_port)
            .field("proxy_port", &self.proxy_port)
            .field("generation", &self.generation)
            .field("leased", &self.leased)
            .finish()
    }
}

struct ServiceEntry {
    info: Arc<ServiceInfo>,
    accept_loop: Option<JoinHandle<()>>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct UpdateSummary {
    pub started: Vec<ServicePortName>,
    pub replaced: Vec<ServicePortName>,
    pub stopped: Vec<ServicePortName>,
    pub unchanged: Vec<ServicePortName>,
    pub failed: Vec<(ServicePortName, ProxyError)>,
}

impl UpdateSummary {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.replaced.is_empty()
            && self.stopped.is_empty()
            && self.failed.is_empty()
    }
}

/// Proxies incoming traffic of every desired service to its endpoints.
pub struct Proxier {
    load_balancer: Arc<dyn LoadBalancer>,
    proxy_ports: PortAllocator,
    config: ProxierConfig,
    /// Number of running accept loops.
    num_loops: Arc<AtomicUsize>,
    next_generation: AtomicU64,
    services: RwLock<HashMap<ServicePortName, ServiceEntry>>,
}

impl Proxier {
    pub fn new(
        load_balancer: Arc<dyn LoadBalancer>,
        proxy_ports: PortAllocator,
        config: ProxierConfig,
    ) -> Self {
        Self {
            load_balancer,
            proxy_ports,
            config,
            num_loops: Arc::new(AtomicUsize::new(0)),
            next_generation: AtomicU64::new(0),
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Reconcile running proxies against a full services snapshot.
    ///
    /// Provisioning failures are logged, reported in the summary and retried
    /// on the next snapshot; they never abort the pass.
    pub async fn update(self: &Arc<Self>, services: &[Service]) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        let mut active = HashSet::new();

        for service in services {
            for port in &service.ports {
                let id = ServicePortName::new(&service.name, &port.name);
                active.insert(id.clone());

                let current = self.get_service_info(&id).await;
                let replacing = match current {
                    Some(info) if info.matches(port) => {
                        summary.unchanged.push(id);
                        continue;
                    }
                    Some(info) => {
                        info!(
                            service = %id,
                            old_protocol = %info.protocol,
                            old_port = info.service_port,
                            new_protocol = %port.protocol,
                            new_port = port.port,
                            "Service changed, replacing proxy"
                        );
                        if let Some(entry) = self.remove_service_entry(&id).await {
                            self.teardown(&id, entry).await;
                        }
                        true
                    }
                    None => {
                        info!(service = %id, "Discovered new service");
                        false
                    }
                };

                match self.provision(&id, port).await {
                    Ok(info) => {
                        info!(
                            service = %id,
                            proxy_port = info.proxy_port,
                            "Service proxy running"
                        );
                        self.load_balancer.add_service(id.clone()).await;
                        if replacing {
                            summary.replaced.push(id);
                        } else {
                            summary.started.push(id);
                        }
                    }
                    Err(e) => {
                        warn!(
                            service = %id,
                            reason = e.reason_code(),
                            error = %e,
                            "Failed to start service proxy"
                        );
                        summary.failed.push((id, e));
                    }
                }
            }
        }

        let stale: Vec<(ServicePortName, ServiceEntry)> = {
            let mut entries = self.services.write().await;
            let ids: Vec<ServicePortName> = entries
                .keys()
                .filter(|id| !active.contains(*id))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in stale {
            info!(service = %id, "Stopping service proxy");
            self.teardown(&id, entry).await;
            summary.stopped.push(id);
        }

        summary
    }

    /// Run a service on an explicit port, bypassing the allocator.
    ///
    /// Port 0 lets the OS pick; the bound port is recorded. The port is
    /// never released to the allocator.
    pub async fn add_service_to_port(
        self: &Arc<Self>,
        service: ServicePortName,
        protocol: &str,
        port: u16,
    ) -> Result<Arc<ServiceInfo>, ProxyError> {
        let info = self.start_service(&service, protocol, port, port, false).await?;
        self.load_balancer.add_service(service).await;
        Ok(info)
    }

    pub async fn get_service_info(&self, service: &ServicePortName) -> Option<Arc<ServiceInfo>> {
        let services = self.services.read().await;
        services.get(service).map(|entry| Arc::clone(&entry.info))
    }

    /// Store an entry, returning the one it displaced.
    async fn set_service_info(
        &self,
        service: ServicePortName,
        info: Arc<ServiceInfo>,
    ) -> Option<ServiceEntry> {
        let mut services = self.services.write().await;
        services.insert(
            service,
            ServiceEntry {
                info,
                accept_loop: None,
            },
        )
    }

    async fn remove_service_entry(&self, service: &ServicePortName) -> Option<ServiceEntry> {
        self.services.write().await.remove(service)
    }

    /// Record the accept loop of `generation`, unless it was already replaced.
    async fn attach_loop(
        &self,
        service: &ServicePortName,
        generation: u64,
        handle: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut services = self.services.write().await;
        match services.get_mut(service) {
            Some(entry) if entry.info.generation == generation => {
                entry.accept_loop = Some(handle);
                Ok(())
            }
            _ => Err(handle),
        }
    }

    /// Service ports currently proxied.
    pub async fn services(&self) -> Vec<ServicePortName> {
        let mut ids: Vec<_> = self.services.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn load_balancer(&self) -> Arc<dyn LoadBalancer> {
        Arc::clone(&self.load_balancer)
    }

    pub fn proxy_ports(&self) -> &PortAllocator {
        &self.proxy_ports
    }

    /// Number of accept loops currently running.
    pub fn active_loops(&self) -> usize {
        self.num_loops.load(Ordering::SeqCst)
    }

    /// Lease a port and start a proxy for one declared service port.
    async fn provision(
        self: &Arc<Self>,
        service: &ServicePortName,
        port: &ServicePort,
    ) -> Result<Arc<ServiceInfo>, ProxyError> {
        // Reject unknown protocols before claiming a port.
        port.protocol.parse::<Protocol>()?;

        let proxy_port = self.proxy_ports.assign_next().await?;
        match self
            .start_service(service, &port.protocol, port.port, proxy_port, true)
            .await
        {
            Ok(info) => Ok(info),
            Err(e) => {
                self.proxy_ports.release(proxy_port);
                Err(e)
            }
        }
    }

    /// Bind the socket, publish the entry and spawn its accept loop.
    async fn start_service(
        self: &Arc<Self>,
        service: &ServicePortName,
        protocol: &str,
        service_port: u16,
        proxy_port: u16,
        leased: bool,
    ) -> Result<Arc<ServiceInfo>, ProxyError> {
        let addr = SocketAddr::new(self.config.bind_host, proxy_port);
        let socket = new_proxy_socket(protocol, addr, self.config.dial_timeout).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let info = Arc::new(ServiceInfo {
            protocol: protocol.parse()?,
            service_port,
            proxy_port: socket.local_addr().port(),
            generation,
            leased,
            socket: Arc::clone(&socket),
        });

        if let Some(displaced) = self
            .set_service_info(service.clone(), Arc::clone(&info))
            .await
        {
            // Only reachable when two passes race on the same service.
            warn!(service = %service, "Displaced a running proxy");
            self.teardown(service, displaced).await;
        }

        let num_loops = Arc::clone(&self.num_loops);
        num_loops.fetch_add(1, Ordering::SeqCst);
        let loop_service = service.clone();
        let proxier = Arc::downgrade(self);
        let handle = tokio::spawn(
            async move {
                socket.proxy_loop(loop_service, generation, proxier).await;
                num_loops.fetch_sub(1, Ordering::SeqCst);
            }
            .instrument(tracing::info_span!("proxy_loop", service = %service, generation)),
        );

        if self.attach_loop(service, generation, handle).await.is_err() {
            // Replaced before the loop was recorded; stop it here.
            if let Err(e) = info.socket.close() {
                warn!(service = %service, error = %e, "Failed to close proxy socket");
            }
        }

        Ok(info)
    }

    /// Close the socket, wait for its loop to drain and release the port.
    async fn teardown(&self, service: &ServicePortName, entry: ServiceEntry) {
        let ServiceEntry { info, accept_loop } = entry;

        if let Err(e) = info.socket.close() {
            warn!(service = %service, error = %e, "Failed to close proxy socket");
        }
        if let Some(handle) = accept_loop {
            if let Err(e) = handle.await {
                error!(service = %service, error = %e, "Proxy loop panicked");
            }
        }
        if info.leased {
            self.proxy_ports.release(info.proxy_port);
        }
    }
}
