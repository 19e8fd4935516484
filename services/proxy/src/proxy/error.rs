//! Error types for the proxy core.

use std::io;

use flow_networking::PortError;
use thiserror::Error;

use super::balancer::ServicePortName;

/// Load balancer lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BalancerError {
    /// No balancer state exists for the service.
    #[error("missing service {0}")]
    MissingService(ServicePortName),

    /// The service is known but has no endpoints.
    #[error("missing endpoints for {0}")]
    MissingEndpoints(ServicePortName),
}

/// Provisioning and per-connection proxy errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No socket implementation for the protocol.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Port allocation failed.
    #[error(transparent)]
    Port(#[from] PortError),

    /// Could not listen on the proxy port.
    #[error("failed to bind proxy port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Could not reach the selected backend.
    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// No backend available.
    #[error(transparent)]
    Balancer(#[from] BalancerError),

    /// The socket was already closed.
    #[error("proxy socket already closed")]
    SocketClosed,
}

impl ProxyError {
    /// Short reason code for log fields.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::UnsupportedProtocol(_) => "unsupported_protocol",
            ProxyError::Port(PortError::Exhausted(_)) => "port_exhausted",
            ProxyError::Port(_) => "port_allocator",
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::Dial { .. } => "dial_failed",
            ProxyError::Balancer(BalancerError::MissingService(_)) => "missing_service",
            ProxyError::Balancer(BalancerError::MissingEndpoints(_)) => "missing_endpoints",
            ProxyError::SocketClosed => "socket_closed",
        }
    }
}

/// Outcome of a failed accept.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed; the accept loop must drain.
    #[error("listener closed")]
    ListenerClosed,

    /// Transient accept failure; the loop keeps going.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_networking::PortRange;

    #[test]
    fn test_reason_codes() {
        let range = PortRange::new(2000, 2001).unwrap();
        assert_eq!(
            ProxyError::from(PortError::Exhausted(range)).reason_code(),
            "port_exhausted"
        );
        let id = ServicePortName::new("foo", "http");
        assert_eq!(
            ProxyError::from(BalancerError::MissingEndpoints(id.clone())).reason_code(),
            "missing_endpoints"
        );
        assert_eq!(
            ProxyError::from(BalancerError::MissingService(id)).to_string(),
            "missing service foo:http"
        );
    }
}
