//! Cluster client trait

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Pod, Service};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ClusterError;

/// Lines of a followed Pod log
pub type LogLines = BoxStream<'static, Result<String, ClusterError>>;

/// Byte stream to a port inside a Pod
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// The cluster operations the remote development tunnel relies on.
///
/// All operations act on the namespace the client was created for.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a Service by name, `None` if it does not exist
    async fn get_service(&self, name: &str) -> Result<Option<Service>, ClusterError>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError>;

    /// Replace an existing Service with the given object
    async fn replace_service(&self, service: &Service) -> Result<Service, ClusterError>;

    /// Delete a Service. Returns `false` if it did not exist.
    async fn delete_service(&self, name: &str) -> Result<bool, ClusterError>;

    /// Create a Pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    /// Delete a Pod. Returns `false` if it did not exist.
    async fn delete_pod(&self, name: &str) -> Result<bool, ClusterError>;

    /// List Pods matching an equality label selector (`k=v,k2=v2`)
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Wait until the Pod reports a `Ready` condition.
    ///
    /// Watch based; there is no timeout, callers race it against their own
    /// cancellation.
    async fn wait_pod_ready(&self, name: &str) -> Result<(), ClusterError>;

    /// Follow the log of a Pod line by line
    async fn pod_log_lines(&self, name: &str) -> Result<LogLines, ClusterError>;

    /// Open a byte stream to `port` inside the Pod
    async fn port_forward(&self, name: &str, port: u16)
        -> Result<Box<dyn TunnelStream>, ClusterError>;
}

/// Whether a Pod carries a `Ready` condition with status `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}
