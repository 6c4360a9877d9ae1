//! Port forwarder
//!
//! The SSH client side of the tunnel. It waits for the relay to announce its
//! user, connects through the control port and keeps every forward open
//! until stopped or until the connection drops.

use std::collections::HashMap;
use std::sync::Arc;

use rd_core::{RemoteService, SessionContext};
use russh::client::{self, Handle};
use russh::Disconnect;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::handler::TunnelHandler;
use crate::bridge::{bridge, pause_after_accept_error};
use crate::error::TunnelError;

/// SSH client carrying the forwards of a session
pub struct PortForwarder {
    context: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl PortForwarder {
    pub fn new(context: Arc<SessionContext>) -> Self {
        let cancel = context.child_token();
        Self { context, cancel }
    }

    /// Run until stopped or until the relay connection drops.
    ///
    /// Stopping before the user is discovered ends the run successfully.
    pub async fn run(&self) -> Result<(), TunnelError> {
        let user = match self.context.discovered_user().wait(&self.cancel).await {
            Ok(user) => user,
            Err(_) => {
                tracing::debug!("Port forwarder stopped before the tunnel user was known");
                return Ok(());
            }
        };

        let mut handle = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            handle = self.connect(&user) => handle?,
        };

        if let Err(e) = self.request_reverse_forwards(&mut handle).await {
            disconnect(&handle).await;
            return Err(e);
        }

        let listeners = match self.bind_remote_services().await {
            Ok(listeners) => listeners,
            Err(e) => {
                disconnect(&handle).await;
                return Err(e);
            }
        };

        let handle = Arc::new(handle);
        for (remote, listener) in listeners {
            tokio::spawn(serve_remote_service(
                Arc::clone(&handle),
                remote,
                listener,
                self.cancel.clone(),
            ));
        }

        let result = self.hold(&handle).await;
        disconnect(&handle).await;
        result
    }

    /// Connect through the control port and authenticate as `user`
    async fn connect(&self, user: &str) -> Result<Handle<TunnelHandler>, TunnelError> {
        let config = self.context.config();
        let port = self.context.control_port();

        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(config.keepalive_interval),
            ..Default::default()
        });
        let forwarded: HashMap<u32, String> = config
            .local_services
            .iter()
            .map(|local| (u32::from(local.port), local.service_name.clone()))
            .collect();
        let handler = TunnelHandler::new(forwarded, self.cancel.clone());

        tracing::debug!("Connecting to relay on control port {} as '{}'", port, user);
        let key = self.context.key_pair();
        let connecting = async move {
            let mut handle = client::connect(ssh_config, ("127.0.0.1", port), handler).await?;
            let authenticated = handle.authenticate_publickey(user, key).await?;
            Ok::<_, TunnelError>((handle, authenticated))
        };

        let (handle, authenticated) = tokio::time::timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| TunnelError::ConnectTimeout { port })??;

        if !authenticated {
            return Err(TunnelError::AuthRejected {
                user: user.to_string(),
            });
        }

        tracing::info!("Connected to relay as '{}'", user);
        Ok(handle)
    }

    /// Ask the relay to listen on every local service port
    async fn request_reverse_forwards(
        &self,
        handle: &mut Handle<TunnelHandler>,
    ) -> Result<(), TunnelError> {
        for local in &self.context.config().local_services {
            match handle.tcpip_forward("0.0.0.0", u32::from(local.port)).await {
                Ok(_) => {}
                Err(russh::Error::RequestDenied) => {
                    return Err(TunnelError::ForwardRejected {
                        service: local.service_name.clone(),
                        port: local.port,
                    });
                }
                Err(e) => return Err(e.into()),
            }
            tracing::info!(
                "Forwarding Service {} (port {}) to localhost:{}",
                local.service_name,
                local.port,
                local.port
            );
        }
        Ok(())
    }

    async fn bind_remote_services(&self) -> Result<Vec<(RemoteService, TcpListener)>, TunnelError> {
        let mut listeners = Vec::new();
        for remote in &self.context.config().remote_services {
            let listener = TcpListener::bind(("127.0.0.1", remote.local_port))
                .await
                .map_err(|source| TunnelError::Bind {
                    port: remote.local_port,
                    source,
                })?;
            tracing::info!(
                "Exposing {}:{} on localhost:{}",
                remote.hostname,
                remote.port,
                remote.local_port
            );
            listeners.push((remote.clone(), listener));
        }
        Ok(listeners)
    }

    /// Check the connection every keepalive interval until stopped
    async fn hold(&self, handle: &Handle<TunnelHandler>) -> Result<(), TunnelError> {
        let mut liveness = tokio::time::interval(self.context.config().keepalive_interval);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        tracing::error!("Connection to relay lost");
                        return Err(TunnelError::ConnectionLost);
                    }
                }
            }
        }
    }

    /// Close every channel, listener and the relay connection
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn disconnect(handle: &Handle<TunnelHandler>) {
    if handle.is_closed() {
        return;
    }
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "session stopped", "en")
        .await
    {
        tracing::debug!("Failed to disconnect from relay: {}", e);
    }
}

/// Open a direct-tcpip channel to the remote service per accepted connection
async fn serve_remote_service(
    handle: Arc<Handle<TunnelHandler>>,
    remote: RemoteService,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (socket, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("Failed to accept on localhost:{}: {}", remote.local_port, e);
                if !pause_after_accept_error(&cancel).await {
                    break;
                }
                continue;
            }
        };

        let channel = match handle
            .channel_open_direct_tcpip(
                remote.hostname.clone(),
                u32::from(remote.port),
                peer_addr.ip().to_string(),
                u32::from(peer_addr.port()),
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("Relay refused a channel to {}: {}", remote, e);
                continue;
            }
        };

        let label = format!("{} -> {}", peer_addr, remote);
        tokio::spawn(bridge(
            socket,
            Box::pin(channel.into_stream()),
            cancel.clone(),
            label,
        ));
    }
}
