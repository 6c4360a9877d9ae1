//! Local service management
//!
//! Points the configured cluster Services at the tunnel and puts them back
//! the way they were when the session ends. Every Service touched is recorded
//! in the session's rollback ledger before it is mutated. A Service that
//! already existed gets a JSON backup of its original state in the
//! `jkube/previous-service` annotation; an existing backup is never
//! overwritten, so nested sessions restore the true original.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use rd_cluster::{ClusterClient, ClusterError};
use rd_core::{LocalService, ManagedService, SessionContext};

use crate::error::ServiceError;

/// Annotation holding the serialized original Service
pub const PREVIOUS_SERVICE_ANNOTATION: &str = "jkube/previous-service";

/// Creates, redirects and restores the Services of a session
#[derive(Clone)]
pub struct LocalServiceManager {
    context: Arc<SessionContext>,
    cluster: Arc<dyn ClusterClient>,
}

impl LocalServiceManager {
    /// Create a manager for the Services configured in `context`
    pub fn new(context: Arc<SessionContext>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self { context, cluster }
    }

    /// Create or redirect every configured Service, in configuration order.
    ///
    /// Stops at the first failure, or before the next Service once the
    /// session is cancelled; Services handled before that stay in the ledger
    /// so `tear_down_services` can roll them back.
    pub async fn create_or_replace_services(&self) -> Result<(), ServiceError> {
        for local in &self.context.config().local_services {
            if self.context.is_cancelled() {
                tracing::debug!("Session cancelled, not preparing Service {}", local.service_name);
                break;
            }
            if let Err(e) = self.create_or_replace(local).await {
                tracing::error!("Failed to prepare Service {}: {}", local.service_name, e);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn create_or_replace(&self, local: &LocalService) -> Result<(), ServiceError> {
        let name = local.service_name.as_str();
        let existing = self
            .cluster
            .get_service(name)
            .await
            .map_err(|source| cluster_error(name, source))?;

        match existing {
            None => {
                self.record(local, ManagedService::Created);

                self.cluster
                    .create_service(&tunnel_endpoint(local))
                    .await
                    .map_err(|source| cluster_error(name, source))?;
                tracing::info!(
                    "Created Service {} ({} on port {})",
                    name,
                    local.service_type,
                    local.port
                );
            }
            Some(existing) => {
                self.record(local, ManagedService::Replaced(Box::new(existing.clone())));

                let replacement = redirect_to_tunnel(local, &existing)?;
                self.cluster
                    .replace_service(&replacement)
                    .await
                    .map_err(|source| cluster_error(name, source))?;
                tracing::info!(
                    "Redirected Service {} to the tunnel ({} on port {})",
                    name,
                    local.service_type,
                    local.port
                );
            }
        }

        Ok(())
    }

    /// Keep the first ledger entry of a Service so repeated calls stay idempotent
    fn record(&self, local: &LocalService, managed: ManagedService) {
        self.context
            .managed_services()
            .entry(local.clone())
            .or_insert(managed);
    }

    /// Roll back every Service in the ledger.
    ///
    /// Failures are logged and collected; the remaining Services are still
    /// processed. Entries that failed stay in the ledger.
    pub async fn tear_down_services(&self) -> Result<(), ServiceError> {
        let entries: Vec<(LocalService, ManagedService)> = self
            .context
            .managed_services()
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut failures = Vec::new();
        for (local, managed) in entries {
            match self.tear_down(&local, &managed).await {
                Ok(()) => {
                    self.context.managed_services().remove(&local);
                }
                Err(e) => {
                    tracing::warn!("Failed to restore Service {}: {}", local.service_name, e);
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ServiceError::Teardown { failures })
        }
    }

    async fn tear_down(
        &self,
        local: &LocalService,
        managed: &ManagedService,
    ) -> Result<(), ServiceError> {
        let name = local.service_name.as_str();

        match managed {
            ManagedService::Created => {
                let deleted = self
                    .cluster
                    .delete_service(name)
                    .await
                    .map_err(|source| cluster_error(name, source))?;
                if deleted {
                    tracing::info!("Deleted Service {}", name);
                } else {
                    tracing::debug!("Service {} was already gone", name);
                }
            }
            ManagedService::Replaced(_) => {
                let current = self
                    .cluster
                    .get_service(name)
                    .await
                    .map_err(|source| cluster_error(name, source))?;
                let Some(current) = current else {
                    tracing::debug!("Service {} was deleted out of band, nothing to restore", name);
                    return Ok(());
                };

                let Some(restored) = restore_from_backup(&current)? else {
                    tracing::debug!("Service {} carries no backup, leaving it as is", name);
                    return Ok(());
                };

                self.cluster
                    .replace_service(&restored)
                    .await
                    .map_err(|source| cluster_error(name, source))?;
                tracing::info!("Restored Service {}", name);
            }
        }

        Ok(())
    }
}

fn cluster_error(service: &str, source: ClusterError) -> ServiceError {
    ServiceError::Cluster {
        service: service.to_string(),
        source,
    }
}

fn tunnel_port(local: &LocalService) -> ServicePort {
    ServicePort {
        port: i32::from(local.port),
        target_port: Some(IntOrString::Int(i32::from(local.port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// A brand new selector-less Service for a local service
fn tunnel_endpoint(local: &LocalService) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(local.service_name.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(local.service_type.clone()),
            ports: Some(vec![tunnel_port(local)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The original Service as stored in the backup annotation
fn backup_of(existing: &Service) -> Service {
    let annotations = existing.metadata.annotations.clone().map(|mut annotations| {
        annotations.remove(PREVIOUS_SERVICE_ANNOTATION);
        annotations
    });

    Service {
        metadata: ObjectMeta {
            name: existing.metadata.name.clone(),
            namespace: existing.metadata.namespace.clone(),
            labels: existing.metadata.labels.clone(),
            annotations: annotations.filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: existing.spec.clone(),
        ..Default::default()
    }
}

/// `existing` rewritten to route to the tunnel, with its backup attached
fn redirect_to_tunnel(local: &LocalService, existing: &Service) -> Result<Service, ServiceError> {
    let mut service = existing.clone();

    let annotations = service
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new);
    if !annotations.contains_key(PREVIOUS_SERVICE_ANNOTATION) {
        let backup =
            serde_json::to_string(&backup_of(existing)).map_err(|source| ServiceError::Backup {
                service: local.service_name.clone(),
                source,
            })?;
        annotations.insert(PREVIOUS_SERVICE_ANNOTATION.to_string(), backup);
    }

    // Cluster IP fields are immutable and have to survive the replace
    let previous = existing.spec.clone().unwrap_or_default();
    service.spec = Some(ServiceSpec {
        type_: Some(local.service_type.clone()),
        ports: Some(vec![tunnel_port(local)]),
        cluster_ip: previous.cluster_ip,
        cluster_ips: previous.cluster_ips,
        ip_families: previous.ip_families,
        ip_family_policy: previous.ip_family_policy,
        ..Default::default()
    });
    service.status = None;

    Ok(service)
}

/// `current` with the spec from its backup annotation and the annotation
/// removed, or `None` when it carries no backup
fn restore_from_backup(current: &Service) -> Result<Option<Service>, ServiceError> {
    let Some(backup) = current
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(PREVIOUS_SERVICE_ANNOTATION))
    else {
        return Ok(None);
    };

    let name = current.metadata.name.clone().unwrap_or_default();
    let original: Service =
        serde_json::from_str(backup).map_err(|source| ServiceError::Backup {
            service: name,
            source,
        })?;

    let mut restored = current.clone();
    restored.spec = original.spec;
    restored.status = None;
    restored.metadata.annotations = current.metadata.annotations.clone().and_then(|mut a| {
        a.remove(PREVIOUS_SERVICE_ANNOTATION);
        (!a.is_empty()).then_some(a)
    });

    Ok(Some(restored))
}
