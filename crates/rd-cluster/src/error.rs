//! Cluster access errors

use thiserror::Error;

/// Errors returned by [`ClusterClient`](crate::ClusterClient) operations
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The API server rejected or failed the request
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Waiting for a resource condition failed
    #[error("Failed waiting for {resource}: {message}")]
    Wait { resource: String, message: String },

    /// Object not found where one was required
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Object already exists
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Object was rejected (used by the in-memory cluster to inject failures)
    #[error("{kind} '{name}' rejected: {reason}")]
    Rejected {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Reading the Pod log failed
    #[error("Log stream for Pod '{pod}' failed: {message}")]
    LogStream { pod: String, message: String },

    /// Port-forward to a Pod could not be set up
    #[error("Port-forward to Pod '{pod}' port {port} failed: {message}")]
    PortForward {
        pod: String,
        port: u16,
        message: String,
    },

    /// Client configuration could not be loaded
    #[error("Failed to configure Kubernetes client: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Whether the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            ClusterError::NotFound { .. } => true,
            ClusterError::Api(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}
