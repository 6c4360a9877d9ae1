//! kube-rs backed cluster client

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::wait::await_condition;
use kube::{Api, Client};

use crate::client::{is_pod_ready, ClusterClient, LogLines, TunnelStream};
use crate::error::ClusterError;

/// Cluster client talking to the API server of the active kube context
#[derive(Clone)]
pub struct KubeCluster {
    services: Api<Service>,
    pods: Api<Pod>,
    namespace: String,
}

impl KubeCluster {
    /// Create a client from the inferred kube config.
    ///
    /// `namespace` overrides the default namespace of the kube context.
    pub async fn connect(namespace: Option<&str>) -> Result<Self, ClusterError> {
        let config = kube::Config::infer()
            .await
            .map_err(|e| ClusterError::Config(e.to_string()))?;
        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| config.default_namespace.clone());
        let client = Client::try_from(config)?;

        Ok(Self::with_client(client, &namespace))
    }

    /// Create a client for a namespace from an existing kube client
    pub fn with_client(client: Client, namespace: &str) -> Self {
        tracing::debug!("Using namespace {}", namespace);
        Self {
            services: Api::namespaced(client.clone(), namespace),
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Namespace this client operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Map a 404 on delete to `Ok(false)`
fn deleted(result: Result<(), kube::Error>) -> Result<bool, ClusterError> {
    match result {
        Ok(()) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_service(&self, name: &str) -> Result<Option<Service>, ClusterError> {
        Ok(self.services.get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError> {
        Ok(self.services.create(&PostParams::default(), service).await?)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, ClusterError> {
        let name = service
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Service",
                name: "<unnamed>".to_string(),
            })?;
        Ok(self
            .services
            .replace(name, &PostParams::default(), service)
            .await?)
    }

    async fn delete_service(&self, name: &str) -> Result<bool, ClusterError> {
        deleted(
            self.services
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        Ok(self.pods.create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, name: &str) -> Result<bool, ClusterError> {
        deleted(
            self.pods
                .delete(name, &DeleteParams::default().grace_period(0))
                .await
                .map(|_| ()),
        )
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }

    async fn wait_pod_ready(&self, name: &str) -> Result<(), ClusterError> {
        await_condition(self.pods.clone(), name, |pod: Option<&Pod>| {
            pod.map(is_pod_ready).unwrap_or(false)
        })
        .await
        .map_err(|e| ClusterError::Wait {
            resource: format!("Pod '{}'", name),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn pod_log_lines(&self, name: &str) -> Result<LogLines, ClusterError> {
        let logs = self
            .pods
            .log_stream(
                name,
                &LogParams {
                    follow: true,
                    ..LogParams::default()
                },
            )
            .await?;

        let pod = name.to_string();
        let lines = logs.lines().map_err(move |e| ClusterError::LogStream {
            pod: pod.clone(),
            message: e.to_string(),
        });
        Ok(lines.boxed())
    }

    async fn port_forward(
        &self,
        name: &str,
        port: u16,
    ) -> Result<Box<dyn TunnelStream>, ClusterError> {
        let mut forwarder = self.pods.portforward(name, &[port]).await?;
        let stream = forwarder
            .take_stream(port)
            .ok_or_else(|| ClusterError::PortForward {
                pod: name.to_string(),
                port,
                message: "no stream for port".to_string(),
            })?;
        Ok(Box::new(stream))
    }
}
