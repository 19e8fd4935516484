pub mod config;
pub mod proxy;
pub mod sync;

pub use proxy::{
    LoadBalancer, Proxier, ProxierConfig, ProxyError, ProxySocket, ServiceBalancer,
    ServicePortName, UpdateSummary,
};
