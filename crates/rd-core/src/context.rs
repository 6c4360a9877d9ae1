//! Per-session state shared by every component of a remote development run
//!
//! A [`SessionContext`] is created by each `start()` and dropped at the end of
//! the matching `stop()`. It carries the immutable configuration plus the
//! values discovered or produced while the session runs:
//!
//! - the session ID used as label value on every cluster object we create
//! - an Ed25519 key pair whose public half is handed to the relay Pod
//! - the local control port the tunnel client connects through
//! - the tunnel user, discovered asynchronously from the relay Pod log
//! - the rollback ledger of Services mutated for this session

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Service;
use russh_keys::key::KeyPair;
use russh_keys::PublicKeyBase64;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteDevelopmentConfig;
use crate::error::ContextError;
use crate::types::{LocalService, SessionId};

/// What a session did to a cluster Service, recorded before doing it
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedService {
    /// The Service did not exist and was created for the session
    Created,
    /// The Service existed; holds the object as observed before mutation
    Replaced(Box<Service>),
}

/// Single-assignment cell holding the user the relay Pod runs sshd as.
///
/// Resolved at most once. Readers wait until it is resolved or until the
/// session is cancelled.
#[derive(Debug)]
pub struct DiscoveredUser {
    tx: watch::Sender<Option<String>>,
}

impl DiscoveredUser {
    /// Create an unresolved cell
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Resolve the cell.
    ///
    /// Returns `false` (and keeps the first value) if it was already resolved.
    pub fn resolve(&self, user: impl Into<String>) -> bool {
        let user = user.into();
        self.tx.send_if_modified(move |current| {
            if current.is_some() {
                return false;
            }
            *current = Some(user);
            true
        })
    }

    /// Current value, if resolved
    pub fn get(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Whether the cell has been resolved
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the cell is resolved, or until `cancel` fires
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<String, ContextError> {
        let mut rx = self.tx.subscribe();

        tokio::select! {
            _ = cancel.cancelled() => Err(ContextError::UserDiscoveryCancelled),
            result = rx.wait_for(Option::is_some) => {
                let user = result.map_err(|_| ContextError::UserDiscoveryCancelled)?;
                user.clone().ok_or(ContextError::UserDiscoveryCancelled)
            }
        }
    }
}

impl Default for DiscoveredUser {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by all components of one remote development session
pub struct SessionContext {
    config: Arc<RemoteDevelopmentConfig>,
    session_id: SessionId,
    key_pair: Arc<KeyPair>,
    authorized_key: String,
    control_port: u16,
    discovered_user: DiscoveredUser,
    managed_services: DashMap<LocalService, ManagedService>,
    cancel: CancellationToken,
}

impl SessionContext {
    /// Create a context with a fresh session ID, key pair and control port
    pub fn new(config: Arc<RemoteDevelopmentConfig>) -> Result<Self, ContextError> {
        let session_id = SessionId::generate();

        let key_pair = KeyPair::generate_ed25519().ok_or(ContextError::KeyGeneration)?;
        let public_key = key_pair
            .clone_public_key()
            .map_err(|e| ContextError::PublicKey(e.to_string()))?;
        let authorized_key = format!(
            "{} {} jkube-remote-dev-{}",
            public_key.name(),
            public_key.public_key_base64(),
            session_id
        );

        let control_port = allocate_control_port(config.control_port)?;

        tracing::debug!(
            "Created session {} (control port {}, key {})",
            session_id,
            control_port,
            public_key.fingerprint()
        );

        Ok(Self {
            config,
            session_id,
            key_pair: Arc::new(key_pair),
            authorized_key,
            control_port,
            discovered_user: DiscoveredUser::new(),
            managed_services: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Session configuration
    pub fn config(&self) -> &RemoteDevelopmentConfig {
        &self.config
    }

    /// Unique ID of this session
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Private key used to authenticate against the relay
    pub fn key_pair(&self) -> Arc<KeyPair> {
        Arc::clone(&self.key_pair)
    }

    /// Public key as a single OpenSSH `authorized_keys` line
    pub fn authorized_key(&self) -> &str {
        &self.authorized_key
    }

    /// Local port of the control connection to the relay Pod
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// User the relay Pod accepts tunnel connections for
    pub fn discovered_user(&self) -> &DiscoveredUser {
        &self.discovered_user
    }

    /// Rollback ledger of the Services touched by this session
    pub fn managed_services(&self) -> &DashMap<LocalService, ManagedService> {
        &self.managed_services
    }

    /// Token cancelled when the session ends
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Child token for a task bound to this session
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// End the session: every wait tied to it returns
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the session has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("control_port", &self.control_port)
            .field("discovered_user", &self.discovered_user.get())
            .field("managed_services", &self.managed_services.len())
            .finish_non_exhaustive()
    }
}

fn allocate_control_port(configured: Option<u16>) -> Result<u16, ContextError> {
    if let Some(port) = configured {
        return Ok(port);
    }

    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(ContextError::ControlPort)?;
    let port = listener
        .local_addr()
        .map_err(ContextError::ControlPort)?
        .port();
    Ok(port)
}
