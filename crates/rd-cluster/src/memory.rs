//! In-memory cluster
//!
//! Keeps Services, Pods and Pod logs in concurrent maps and lets the caller
//! play the part of the kubelet: mark Pods ready, append log lines, point
//! port-forwards at a local socket and inject API failures.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, Service};
use tokio::sync::watch;

use crate::client::{is_pod_ready, ClusterClient, LogLines, TunnelStream};
use crate::error::ClusterError;

struct Inner {
    services: DashMap<String, Service>,
    pods: DashMap<String, Pod>,
    logs: DashMap<String, Vec<String>>,
    rejected_services: DashMap<String, String>,
    pod_rejection: Mutex<Option<String>>,
    relay_endpoint: Mutex<Option<SocketAddr>>,
    log_failures: AtomicUsize,
    pod_deletions: AtomicUsize,
    service_deletions: AtomicUsize,
    resource_version: AtomicU64,
    changes: watch::Sender<u64>,
}

impl Inner {
    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn check_service(&self, name: &str) -> Result<(), ClusterError> {
        match self.rejected_services.get(name) {
            Some(reason) => Err(ClusterError::Rejected {
                kind: "Service",
                name: name.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Cluster kept entirely in memory
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                services: DashMap::new(),
                pods: DashMap::new(),
                logs: DashMap::new(),
                rejected_services: DashMap::new(),
                pod_rejection: Mutex::new(None),
                relay_endpoint: Mutex::new(None),
                log_failures: AtomicUsize::new(0),
                pod_deletions: AtomicUsize::new(0),
                service_deletions: AtomicUsize::new(0),
                resource_version: AtomicU64::new(0),
                changes,
            }),
        }
    }

    /// Store a Service as if it had been created out of band
    pub fn insert_service(&self, mut service: Service) {
        let name = service.metadata.name.clone().unwrap_or_default();
        service.metadata.resource_version = Some(self.inner.next_resource_version());
        self.inner.services.insert(name, service);
        self.inner.notify();
    }

    /// Current state of a Service
    pub fn service(&self, name: &str) -> Option<Service> {
        self.inner.services.get(name).map(|s| s.clone())
    }

    /// Current state of a Pod
    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.inner.pods.get(name).map(|p| p.clone())
    }

    /// All Pods currently stored
    pub fn pods(&self) -> Vec<Pod> {
        self.inner.pods.iter().map(|p| p.clone()).collect()
    }

    /// Give the Pod a `Ready=True` condition
    pub fn mark_pod_ready(&self, name: &str) -> bool {
        let Some(mut pod) = self.inner.pods.get_mut(name) else {
            return false;
        };
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        drop(pod);
        self.inner.notify();
        true
    }

    /// Append a line to the Pod log
    pub fn push_log_line(&self, name: &str, line: impl Into<String>) {
        self.inner
            .logs
            .entry(name.to_string())
            .or_default()
            .push(line.into());
        self.inner.notify();
    }

    /// Make every create/replace of the named Service fail
    pub fn reject_service(&self, name: &str, reason: &str) {
        self.inner
            .rejected_services
            .insert(name.to_string(), reason.to_string());
    }

    /// Make every Pod creation fail
    pub fn reject_pods(&self, reason: &str) {
        if let Ok(mut rejection) = self.inner.pod_rejection.lock() {
            *rejection = Some(reason.to_string());
        }
    }

    /// Make the next `count` log stream requests fail
    pub fn fail_log_streams(&self, count: usize) {
        self.inner.log_failures.store(count, Ordering::SeqCst);
    }

    /// Route port-forwards to a local address
    pub fn set_relay_endpoint(&self, addr: SocketAddr) {
        if let Ok(mut endpoint) = self.inner.relay_endpoint.lock() {
            *endpoint = Some(addr);
        }
    }

    /// Number of Pods deleted so far
    pub fn pod_deletions(&self) -> usize {
        self.inner.pod_deletions.load(Ordering::SeqCst)
    }

    /// Number of Services deleted so far
    pub fn service_deletions(&self) -> usize {
        self.inner.service_deletions.load(Ordering::SeqCst)
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Match `k=v,k2=v2` against a Pod's labels
fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.as_ref();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|labels| labels.get(key))
                .map(|v| v == value)
                .unwrap_or(false),
            None => false,
        })
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get_service(&self, name: &str) -> Result<Option<Service>, ClusterError> {
        Ok(self.service(name))
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.inner.check_service(&name)?;
        if self.inner.services.contains_key(&name) {
            return Err(ClusterError::AlreadyExists {
                kind: "Service",
                name,
            });
        }

        let mut stored = service.clone();
        stored.metadata.resource_version = Some(self.inner.next_resource_version());
        self.inner.services.insert(name, stored.clone());
        self.inner.notify();
        Ok(stored)
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, ClusterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        self.inner.check_service(&name)?;
        if !self.inner.services.contains_key(&name) {
            return Err(ClusterError::NotFound {
                kind: "Service",
                name,
            });
        }

        let mut stored = service.clone();
        stored.metadata.resource_version = Some(self.inner.next_resource_version());
        self.inner.services.insert(name, stored.clone());
        self.inner.notify();
        Ok(stored)
    }

    async fn delete_service(&self, name: &str) -> Result<bool, ClusterError> {
        let removed = self.inner.services.remove(name).is_some();
        if removed {
            self.inner.service_deletions.fetch_add(1, Ordering::SeqCst);
            self.inner.notify();
        }
        Ok(removed)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let name = pod.metadata.name.clone().unwrap_or_default();

        let rejection = self
            .inner
            .pod_rejection
            .lock()
            .ok()
            .and_then(|rejection| rejection.clone());
        if let Some(reason) = rejection {
            return Err(ClusterError::Rejected {
                kind: "Pod",
                name,
                reason,
            });
        }

        if self.inner.pods.contains_key(&name) {
            return Err(ClusterError::AlreadyExists { kind: "Pod", name });
        }

        let mut stored = pod.clone();
        stored.metadata.resource_version = Some(self.inner.next_resource_version());
        self.inner.pods.insert(name, stored.clone());
        self.inner.notify();
        Ok(stored)
    }

    async fn delete_pod(&self, name: &str) -> Result<bool, ClusterError> {
        let removed = self.inner.pods.remove(name).is_some();
        if removed {
            self.inner.pod_deletions.fetch_add(1, Ordering::SeqCst);
            self.inner.notify();
        }
        Ok(removed)
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .inner
            .pods
            .iter()
            .filter(|pod| matches_selector(pod, label_selector))
            .map(|pod| pod.clone())
            .collect())
    }

    async fn wait_pod_ready(&self, name: &str) -> Result<(), ClusterError> {
        let mut changes = self.inner.changes.subscribe();

        loop {
            let ready = self
                .inner
                .pods
                .get(name)
                .map(|pod| is_pod_ready(&pod))
                .unwrap_or(false);
            if ready {
                return Ok(());
            }

            changes.changed().await.map_err(|_| ClusterError::Wait {
                resource: format!("Pod '{}'", name),
                message: "cluster dropped".to_string(),
            })?;
        }
    }

    async fn pod_log_lines(&self, name: &str) -> Result<LogLines, ClusterError> {
        if !self.inner.pods.contains_key(name) {
            return Err(ClusterError::NotFound {
                kind: "Pod",
                name: name.to_string(),
            });
        }

        let failed = self
            .inner
            .log_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ClusterError::LogStream {
                pod: name.to_string(),
                message: "injected failure".to_string(),
            });
        }

        let state = (
            Arc::clone(&self.inner),
            name.to_string(),
            0usize,
            self.inner.changes.subscribe(),
        );

        let lines = futures::stream::unfold(state, |(inner, name, index, mut changes)| async move {
            loop {
                let line = inner
                    .logs
                    .get(&name)
                    .and_then(|lines| lines.get(index).cloned());
                if let Some(line) = line {
                    return Some((Ok(line), (inner, name, index + 1, changes)));
                }

                // Following ends with the Pod
                if !inner.pods.contains_key(&name) {
                    return None;
                }

                if changes.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(lines.boxed())
    }

    async fn port_forward(
        &self,
        name: &str,
        port: u16,
    ) -> Result<Box<dyn TunnelStream>, ClusterError> {
        if !self.inner.pods.contains_key(name) {
            return Err(ClusterError::NotFound {
                kind: "Pod",
                name: name.to_string(),
            });
        }

        let endpoint = self
            .inner
            .relay_endpoint
            .lock()
            .ok()
            .and_then(|endpoint| *endpoint);
        let Some(addr) = endpoint else {
            return Err(ClusterError::PortForward {
                pod: name.to_string(),
                port,
                message: "no relay endpoint configured".to_string(),
            });
        };

        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}
