//! rd-cluster: Kubernetes access for the remote development tunnel
//!
//! The tunnel only needs a handful of cluster operations: Service and Pod
//! CRUD, waiting for Pod readiness, following a Pod log and opening a
//! port-forward stream. They are collected in the [`ClusterClient`] trait with
//! two implementations:
//!
//! - [`KubeCluster`] talks to a real API server through kube-rs
//! - [`MemoryCluster`] keeps everything in memory and is driven by tests

mod client;
mod error;
mod kube_cluster;
mod memory;

pub use client::{is_pod_ready, ClusterClient, LogLines, TunnelStream};
pub use error::ClusterError;
pub use kube_cluster::KubeCluster;
pub use memory::MemoryCluster;
