//! Service proxy core.
//!
//! This module provides:
//! - Round-robin endpoint selection per service port
//! - Reconciliation of desired services into running proxy sockets
//! - TCP proxy sockets relaying client connections to endpoints
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxySocket (leased port) -> LoadBalancer -> Endpoint
//!                 ^
//!             Proxier::update(services)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use flow_proxy::proxy::{Proxier, ProxierConfig, ServiceBalancer};
//!
//! let balancer = Arc::new(ServiceBalancer::new());
//! let ports = PortAllocator::new("2000-3000".parse()?);
//! let proxier = Arc::new(Proxier::new(balancer.clone(), ports, ProxierConfig::default()));
//!
//! balancer.update(&state.endpoints).await;
//! proxier.update(&state.services).await;
//! ```

mod balancer;
mod error;
mod proxier;
mod socket;

pub use balancer::{same_endpoints, LoadBalancer, ServiceBalancer, ServicePortName};
pub use error::{AcceptError, BalancerError, ProxyError};
pub use proxier::{Proxier, ProxierConfig, ServiceInfo, UpdateSummary};
pub use socket::{
    new_proxy_socket, relay, Protocol, ProxySocket, ProxyStats, RelayDirection, SocketState,
    TcpProxySocket, DEFAULT_DIAL_TIMEOUT, RELAY_BUFFER_SIZE,
};
