//! Error types for remote development sessions

use rd_cluster::ClusterError;
use rd_core::{ConfigError, ContextError};
use thiserror::Error;

/// Top-level error of a remote development session
#[derive(Error, Debug)]
pub enum RemoteDevError {
    /// The configuration was rejected by `start()`
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Session setup failed
    #[error("Session setup failed: {0}")]
    Context(#[from] ContextError),

    /// Managing cluster Services failed
    #[error("Service error: {0}")]
    Services(#[from] ServiceError),

    /// The relay Pod failed
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// The tunnel connection failed
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// `start()` was called while a session is active
    #[error("Remote development service is already running")]
    AlreadyRunning,

    /// `stop()` was called while `start()` was still in progress
    #[error("Remote development session was stopped during startup")]
    StoppedDuringStartup,

    /// A session task panicked or was aborted
    #[error("Session task failed: {0}")]
    Task(String),
}

/// Errors raised while mutating or restoring cluster Services
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A Kubernetes call for a Service failed
    #[error("Service '{service}': {source}")]
    Cluster {
        service: String,
        #[source]
        source: ClusterError,
    },

    /// The backup annotation could not be written or read
    #[error("Backup of Service '{service}' is unusable: {source}")]
    Backup {
        service: String,
        #[source]
        source: serde_json::Error,
    },

    /// One or more Services could not be restored
    #[error("Failed to tear down {} service(s): {}", failures.len(), failures.join("; "))]
    Teardown { failures: Vec<String> },
}

/// Errors raised by the relay Pod forwarder
#[derive(Error, Debug)]
pub enum RelayError {
    /// The relay Pod could not be created
    #[error("Failed to create Pod '{pod}': {source}")]
    CreatePod {
        pod: String,
        #[source]
        source: ClusterError,
    },

    /// Waiting for the relay Pod to become ready failed
    #[error("Pod '{pod}' did not become ready: {source}")]
    Readiness {
        pod: String,
        #[source]
        source: ClusterError,
    },

    /// The local control port could not be bound
    #[error("Failed to listen on control port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The relay Pod could not be deleted
    #[error("Failed to remove Pod '{pod}': {source}")]
    DeletePod {
        pod: String,
        #[source]
        source: ClusterError,
    },
}

/// Errors raised by the tunnel client
#[derive(Error, Debug)]
pub enum TunnelError {
    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Connecting to the relay did not complete in time
    #[error("Connection to relay on port {port} timed out")]
    ConnectTimeout { port: u16 },

    /// The relay rejected the session key for the discovered user
    #[error("Authentication rejected by relay for user '{user}'")]
    AuthRejected { user: String },

    /// The relay refused a reverse forward
    #[error("Relay refused to forward port {port} for Service '{service}'")]
    ForwardRejected { service: String, port: u16 },

    /// A local port for a remote service could not be bound
    #[error("Failed to listen on local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The relay connection dropped while the session was running
    #[error("Connection to relay lost")]
    ConnectionLost,
}
