//! Endpoint selection for proxied services.
//!
//! Each service port keeps an ordered endpoint list and a rotation cursor:
//! - Round-robin, no weighting and no health awareness
//! - An unreachable backend is retried on its next turn
//! - Endpoint sets are compared as multisets, so a reordered snapshot keeps
//!   the cursor where it was

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use flow_api::Endpoints;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::error::BalancerError;

/// Identifies one load-balanced entry point: a service and one of its
/// named ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServicePortName {
    pub name: String,
    pub port: String,
}

impl ServicePortName {
    pub fn new(name: &str, port: &str) -> Self {
        Self {
            name: name.to_string(),
            port: port.to_string(),
        }
    }
}

impl fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}

/// Directs traffic between the endpoints of a service.
///
/// This is the seam the proxier uses; tests substitute their own.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Register a service. Registering twice is not an error.
    async fn add_service(&self, service: ServicePortName);

    /// Pick the endpoint for the next connection. Advances the rotation.
    async fn next_endpoint(&self, service: &ServicePortName) -> Result<String, BalancerError>;
}

#[derive(Debug, Default)]
struct BalancerState {
    endpoints: Vec<String>,
    index: usize,
}

/// Round-robin balancer over every known service port.
///
/// The map lock is the only mutation path and is never held across I/O.
#[derive(Debug, Default)]
pub struct ServiceBalancer {
    services: Mutex<HashMap<ServicePortName, BalancerState>>,
}

impl ServiceBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile against a full endpoints snapshot.
    ///
    /// Every `(entry, port)` pair yields one service port whose endpoint list
    /// is `address:port` for each address. Lists equal to the current one
    /// (in any order) are left alone; changed lists replace the old one and
    /// restart the rotation. Service ports missing from the snapshot are
    /// dropped.
    pub async fn update(&self, endpoints: &[Endpoints]) {
        let mut desired: HashMap<ServicePortName, Vec<String>> = HashMap::new();
        for entry in endpoints {
            for port in &entry.ports {
                desired.insert(
                    ServicePortName::new(&entry.name, &port.name),
                    entry.addresses_for(port),
                );
            }
        }

        let mut services = self.services.lock().await;

        for (service, new_endpoints) in desired.iter() {
            let state = services.entry(service.clone()).or_default();
            if same_endpoints(&state.endpoints, new_endpoints) {
                continue;
            }
            info!(
                service = %service,
                endpoint_count = new_endpoints.len(),
                "Endpoints changed"
            );
            state.endpoints = new_endpoints.clone();
            state.index = 0;
        }

        services.retain(|service, _| {
            let keep = desired.contains_key(service);
            if !keep {
                info!(service = %service, "Removing service from load balancer");
            }
            keep
        });
    }

    /// Current endpoint list of a service, in rotation order.
    pub async fn endpoints(&self, service: &ServicePortName) -> Option<Vec<String>> {
        let services = self.services.lock().await;
        services.get(service).map(|state| state.endpoints.clone())
    }

    /// Check if the balancer has state for a service.
    pub async fn contains(&self, service: &ServicePortName) -> bool {
        self.services.lock().await.contains_key(service)
    }

    /// Number of known service ports.
    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.lock().await.is_empty()
    }
}

#[async_trait]
impl LoadBalancer for ServiceBalancer {
    async fn add_service(&self, service: ServicePortName) {
        let mut services = self.services.lock().await;
        if !services.contains_key(&service) {
            info!(service = %service, "Registered service with load balancer");
            services.insert(service, BalancerState::default());
        }
    }

    async fn next_endpoint(&self, service: &ServicePortName) -> Result<String, BalancerError> {
        let mut services = self.services.lock().await;
        let state = services
            .get_mut(service)
            .ok_or_else(|| BalancerError::MissingService(service.clone()))?;
        if state.endpoints.is_empty() {
            return Err(BalancerError::MissingEndpoints(service.clone()));
        }

        let endpoint = state.endpoints[state.index].clone();
        state.index = (state.index + 1) % state.endpoints.len();
        debug!(service = %service, endpoint = %endpoint, "Selected endpoint");
        Ok(endpoint)
    }
}

/// Order-independent comparison of two endpoint lists.
///
/// Duplicates count: `[a, a, b]` and `[a, b, b]` differ.
pub fn same_endpoints(current: &[String], desired: &[String]) -> bool {
    if current.len() != desired.len() {
        return false;
    }
    // Unchanged and in the same order.
    if current == desired {
        return true;
    }
    let distinct: HashSet<&String> = current.iter().collect();
    distinct.into_iter().all(|endpoint| {
        let count = |list: &[String]| {
            list.iter()
                .filter(|e| e.as_str() == endpoint.as_str())
                .count()
        };
        count(current) == count(desired)
    })
}
