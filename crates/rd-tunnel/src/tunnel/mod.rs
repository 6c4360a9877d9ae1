//! SSH tunnel to the relay Pod
//!
//! Connects through the local control port as the discovered user, requests
//! one reverse forward per local service and serves one local listener per
//! remote service.

mod forwarder;
mod handler;

pub use forwarder::PortForwarder;
