//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Service type used when a local service mapping does not name one
pub const DEFAULT_SERVICE_TYPE: &str = "ClusterIP";

/// Unique identifier for a remote development session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a fresh random session ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a session ID from an existing value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cluster Service whose traffic is redirected to a process on the
/// developer machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalService {
    /// Name of the cluster Service
    pub service_name: String,
    /// Cluster Service type (ClusterIP, NodePort, ...)
    #[serde(rename = "type", default = "default_service_type")]
    pub service_type: String,
    /// Port exposed by the Service and listened on locally
    pub port: u16,
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}

impl LocalService {
    /// Create a new local service mapping
    pub fn new(service_name: impl Into<String>, service_type: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            service_type: service_type.into(),
            port,
        }
    }
}

impl fmt::Display for LocalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.service_name, self.port, self.service_type)
    }
}

/// Parses `name:port[:type]`
impl FromStr for LocalService {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidMapping {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split(':').collect();
        let (name, port, service_type) = match parts.as_slice() {
            [name, port] => (*name, *port, DEFAULT_SERVICE_TYPE),
            [name, port, service_type] => (*name, *port, *service_type),
            _ => return Err(invalid("expected name:port[:type]")),
        };

        if name.is_empty() {
            return Err(invalid("service name is empty"));
        }
        if service_type.is_empty() {
            return Err(invalid("service type is empty"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;

        Ok(Self::new(name, service_type, port))
    }
}

/// A cluster-internal endpoint made reachable on the developer machine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteService {
    /// Hostname as resolved from inside the cluster network
    pub hostname: String,
    /// Port on the remote host
    pub port: u16,
    /// Port opened on the developer machine
    pub local_port: u16,
}

impl RemoteService {
    /// Create a new remote service mapping
    pub fn new(hostname: impl Into<String>, port: u16, local_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            local_port,
        }
    }
}

impl fmt::Display for RemoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "localhost:{} -> {}:{}", self.local_port, self.hostname, self.port)
    }
}

/// Parses `host:port[:local_port]`
impl FromStr for RemoteService {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidMapping {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split(':').collect();
        let (hostname, port, local_port) = match parts.as_slice() {
            [hostname, port] => (*hostname, *port, None),
            [hostname, port, local_port] => (*hostname, *port, Some(*local_port)),
            _ => return Err(invalid("expected host:port[:local_port]")),
        };

        if hostname.is_empty() {
            return Err(invalid("hostname is empty"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
        let local_port = match local_port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| invalid("local port is not a number"))?,
            None => port,
        };

        Ok(Self::new(hostname, port, local_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_local_service_value_equality_as_key() {
        let mut map = HashMap::new();
        map.insert(LocalService::new("service", "NodePort", 1337), 1);

        let same = LocalService::new("service", "NodePort", 1337);
        assert_eq!(map.get(&same), Some(&1));
        assert!(map
            .get(&LocalService::new("service", "ClusterIP", 1337))
            .is_none());
    }

    #[test]
    fn test_parse_local_service() {
        let svc: LocalService = "service:1337:NodePort".parse().unwrap();
        assert_eq!(svc, LocalService::new("service", "NodePort", 1337));

        let svc: LocalService = "api:8080".parse().unwrap();
        assert_eq!(svc.service_type, "ClusterIP");
    }

    #[test]
    fn test_parse_local_service_rejects_garbage() {
        assert!("service".parse::<LocalService>().is_err());
        assert!("service:http".parse::<LocalService>().is_err());
        assert!(":80".parse::<LocalService>().is_err());
        assert!("a:1:b:c".parse::<LocalService>().is_err());
    }

    #[test]
    fn test_parse_remote_service() {
        let svc: RemoteService = "postgres:5432:15432".parse().unwrap();
        assert_eq!(svc, RemoteService::new("postgres", 5432, 15432));

        let svc: RemoteService = "redis:6379".parse().unwrap();
        assert_eq!(svc.local_port, 6379);
    }

    #[test]
    fn test_local_service_deserialize_type_field() {
        let svc: LocalService =
            serde_json::from_str(r#"{"service_name":"svc","type":"NodePort","port":80}"#).unwrap();
        assert_eq!(svc.service_type, "NodePort");

        let svc: LocalService =
            serde_json::from_str(r#"{"service_name":"svc","port":80}"#).unwrap();
        assert_eq!(svc.service_type, DEFAULT_SERVICE_TYPE);
    }
}
