//! Core error types for the remote development tunnel

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A service mapping given on the command line could not be parsed
    #[error("Invalid service mapping '{value}': {reason}")]
    InvalidMapping { value: String, reason: String },
}

/// Errors raised while setting up a session context
#[derive(Error, Debug)]
pub enum ContextError {
    /// Key pair generation failed
    #[error("Failed to generate session key pair")]
    KeyGeneration,

    /// Public key could not be derived from the generated key pair
    #[error("Failed to extract public key: {0}")]
    PublicKey(String),

    /// No local control port could be allocated
    #[error("Failed to allocate local control port: {0}")]
    ControlPort(#[source] std::io::Error),

    /// The session ended before the relay reported its user
    #[error("Session cancelled before the tunnel user was discovered")]
    UserDiscoveryCancelled,
}
