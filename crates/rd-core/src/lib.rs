//! rd-core: Core abstractions and configuration for the remote development tunnel
//!
//! This crate provides the service mapping types, the configuration structures
//! and the per-session context shared by the relay Pod forwarder, the port
//! forwarder and the orchestrator.

pub mod config;
pub mod context;
pub mod error;
pub mod types;

pub use config::RemoteDevelopmentConfig;
pub use context::{DiscoveredUser, ManagedService, SessionContext};
pub use error::{ConfigError, ContextError};
pub use types::{LocalService, RemoteService, SessionId};
