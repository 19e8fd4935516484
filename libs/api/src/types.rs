//! Service and endpoint definitions.
//!
//! Field names are snake_case on the wire. Optional collections default to
//! empty so that a minimal entry only needs a `name`.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ApiError;

/// Protocol assumed when a service port does not name one.
pub const DEFAULT_PROTOCOL: &str = "tcp";

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

// =============================================================================
// Services
// =============================================================================

/// A named port exposed by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    /// Port name, disambiguates multiple ports of one service. May be empty.
    #[serde(default)]
    pub name: String,
    /// Port the service is declared on.
    #[serde(default)]
    pub port: u16,
    /// Port the backends listen on.
    #[serde(default)]
    pub target_port: u16,
    /// Transport protocol, e.g. `tcp`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

impl ServicePort {
    /// Create a TCP port.
    pub fn tcp(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
            target_port: port,
            protocol: default_protocol(),
        }
    }
}

/// A service as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn new(name: &str, ports: Vec<ServicePort>) -> Self {
        Self {
            name: name.to_string(),
            ports,
        }
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.name.is_empty() {
            return Err(ApiError::EmptyName("service"));
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.name.as_str()) {
                return Err(ApiError::DuplicatePort {
                    name: self.name.clone(),
                    port: port.name.clone(),
                });
            }
        }
        Ok(())
    }
}

// =============================================================================
// Endpoints
// =============================================================================

/// A named port that every address of an [`Endpoints`] entry listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
}

impl EndpointPort {
    pub fn new(name: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            port,
        }
    }
}

/// Backend addresses implementing a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Name of the service these endpoints implement.
    pub name: String,
    /// Hosts (IP addresses or names), without ports.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

impl Endpoints {
    pub fn new(name: &str, addresses: Vec<String>, ports: Vec<EndpointPort>) -> Self {
        Self {
            name: name.to_string(),
            addresses,
            ports,
        }
    }

    /// Expand every address with `port` into `host:port` strings.
    ///
    /// Addresses keep their snapshot order. IPv6 literals are bracketed.
    pub fn addresses_for(&self, port: &EndpointPort) -> Vec<String> {
        self.addresses
            .iter()
            .map(|host| join_host_port(host, port.port))
            .collect()
    }

    fn validate(&self) -> Result<(), ApiError> {
        if self.name.is_empty() {
            return Err(ApiError::EmptyName("endpoints"));
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.name.as_str()) {
                return Err(ApiError::DuplicatePort {
                    name: self.name.clone(),
                    port: port.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Format a host and port the way a dialer expects them.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// A full desired-state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub endpoints: Vec<Endpoints>,
}

impl DesiredState {
    /// Decode and validate a JSON snapshot.
    pub fn from_json(raw: &str) -> Result<Self, ApiError> {
        let state: DesiredState = serde_json::from_str(raw)?;
        state.validate()?;
        Ok(state)
    }

    /// Check names are non-empty and unique per entry and per snapshot.
    pub fn validate(&self) -> Result<(), ApiError> {
        let mut services = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !services.insert(service.name.as_str()) {
                return Err(ApiError::DuplicateEntry {
                    kind: "service",
                    name: service.name.clone(),
                });
            }
        }

        let mut endpoints = HashSet::new();
        for entry in &self.endpoints {
            entry.validate()?;
            if !endpoints.insert(entry.name.as_str()) {
                return Err(ApiError::DuplicateEntry {
                    kind: "endpoints",
                    name: entry.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.1", 80, "10.0.0.1:80")]
    #[case("backend.local", 8080, "backend.local:8080")]
    #[case("fd00::1", 443, "[fd00::1]:443")]
    #[case("[fd00::1]", 443, "[fd00::1]:443")]
    fn test_join_host_port(#[case] host: &str, #[case] port: u16, #[case] expected: &str) {
        assert_eq!(join_host_port(host, port), expected);
    }

    #[test]
    fn test_addresses_for_keeps_order() {
        let endpoints = Endpoints::new(
            "foo",
            vec!["1.1.1.1".to_string(), "1.1.1.2".to_string()],
            vec![EndpointPort::new("http", 3000)],
        );
        assert_eq!(
            endpoints.addresses_for(&endpoints.ports[0]),
            vec!["1.1.1.1:3000", "1.1.1.2:3000"]
        );
    }

    #[test]
    fn test_snapshot_defaults() {
        let raw = r#"{
            "services": [{"name": "chat", "ports": [{"port": 80}]}],
            "endpoints": [{"name": "chat"}]
        }"#;
        let state = DesiredState::from_json(raw).unwrap();
        assert_eq!(state.services[0].ports[0].protocol, "tcp");
        assert_eq!(state.services[0].ports[0].name, "");
        assert!(state.endpoints[0].addresses.is_empty());
    }

    #[test]
    fn test_empty_document_is_empty_state() {
        let state = DesiredState::from_json("{}").unwrap();
        assert_eq!(state, DesiredState::default());
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let raw = r#"{"services": [{"name": "chat", "ports": [{"name": "a"}, {"name": "a"}]}]}"#;
        assert!(matches!(
            DesiredState::from_json(raw),
            Err(ApiError::DuplicatePort { .. })
        ));
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let raw = r#"{"services": [{"name": "chat"}, {"name": "chat"}]}"#;
        assert!(matches!(
            DesiredState::from_json(raw),
            Err(ApiError::DuplicateEntry { kind: "service", .. })
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            DesiredState::from_json("{not json"),
            Err(ApiError::Serialization(_))
        ));
    }
}
