//! Remote development session configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::{LocalService, RemoteService};

/// Configuration for a remote development session.
///
/// Built once by the caller and shared read-only by every component of the
/// session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteDevelopmentConfig {
    /// Namespace for the relay Pod and the managed Services.
    /// `None` uses the default namespace of the active kube context.
    pub namespace: Option<String>,

    /// Cluster Services to redirect to the developer machine
    pub local_services: Vec<LocalService>,

    /// Cluster endpoints to expose on the developer machine
    pub remote_services: Vec<RemoteService>,

    /// Relay Pod settings
    pub relay: RelayConfig,

    /// Fixed local control port (a free port is picked when unset)
    pub control_port: Option<u16>,

    /// Timeout for the SSH handshake with the relay
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Interval of the tunnel liveness check
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Backoff between relay log stream reconnects
    pub log_backoff: BackoffConfig,
}

impl Default for RemoteDevelopmentConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            local_services: vec![],
            remote_services: vec![],
            relay: RelayConfig::default(),
            control_port: None,
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            log_backoff: BackoffConfig::default(),
        }
    }
}

impl RemoteDevelopmentConfig {
    /// Check the service mappings for conflicts
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut forwarded_ports = HashSet::new();
        let mut local_ports = HashSet::new();

        for service in &self.local_services {
            if service.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "local service '{}' has port 0",
                    service.service_name
                )));
            }
            if !names.insert(service.service_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "local service '{}' is configured more than once",
                    service.service_name
                )));
            }
            if !forwarded_ports.insert(service.port) {
                return Err(ConfigError::Invalid(format!(
                    "port {} is used by more than one local service",
                    service.port
                )));
            }
            if service.port == self.relay.port {
                return Err(ConfigError::Invalid(format!(
                    "local service '{}' uses the relay port {}",
                    service.service_name, self.relay.port
                )));
            }
        }

        for service in &self.remote_services {
            if service.port == 0 || service.local_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "remote service '{}' has port 0",
                    service.hostname
                )));
            }
            if !local_ports.insert(service.local_port) {
                return Err(ConfigError::Invalid(format!(
                    "local port {} is used by more than one remote service",
                    service.local_port
                )));
            }
        }

        if self.control_port == Some(0) {
            return Err(ConfigError::Invalid("control port must not be 0".into()));
        }

        if self.connect_timeout.is_zero() || self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "connect_timeout and keepalive_interval must be positive".into(),
            ));
        }

        Ok(())
    }
}

/// Relay Pod settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Container image serving the cluster-side SSH endpoint
    pub image: String,

    /// Port the relay's SSH server listens on inside the Pod
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            image: "quay.io/jkube/jkube-remote-dev:0.0.20".to_string(),
            port: 2222,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
