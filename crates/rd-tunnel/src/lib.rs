//! rd-tunnel: Remote development tunnel between a developer machine and a
//! Kubernetes cluster
//!
//! A session redirects cluster Services to processes on the developer machine
//! and exposes cluster-internal endpoints locally. It is made of:
//!
//! - [`LocalServiceManager`]: mutates the configured Services and restores
//!   them on teardown
//! - [`RelayPodForwarder`]: runs the relay Pod that terminates the tunnel
//!   inside the cluster and forwards the local control port to it
//! - [`PortForwarder`]: the SSH client opening one forwarded channel per
//!   service mapping
//! - [`RemoteDevelopmentService`]: starts and stops all of the above

pub mod backoff;
mod bridge;
pub mod error;
pub mod relay;
pub mod remote_dev;
pub mod services;
pub mod tunnel;

pub use error::{RelayError, RemoteDevError, ServiceError, TunnelError};
pub use relay::RelayPodForwarder;
pub use remote_dev::{RemoteDevelopmentService, ServiceStatus, SessionHandle};
pub use services::{LocalServiceManager, PREVIOUS_SERVICE_ANNOTATION};
pub use tunnel::PortForwarder;
