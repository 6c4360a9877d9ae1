//! SSH client handler for the relay connection

use std::collections::HashMap;

use async_trait::async_trait;
use russh::client::{self, Msg, Session};
use russh::Channel;
use russh_keys::key::PublicKey;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::bridge::bridge;
use crate::error::TunnelError;

/// Handles channels the relay opens back to the developer machine
pub(crate) struct TunnelHandler {
    /// Reverse-forwarded port -> name of the local service behind it
    forwarded: HashMap<u32, String>,
    cancel: CancellationToken,
}

impl TunnelHandler {
    pub(crate) fn new(forwarded: HashMap<u32, String>, cancel: CancellationToken) -> Self {
        Self { forwarded, cancel }
    }
}

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = TunnelError;

    /// The relay is reached through our own port-forward and generates a
    /// fresh host key on every start, so any key is accepted.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Relay host key: {}", server_public_key.fingerprint());
        Ok(true)
    }

    /// Bridge a cluster connection to the matching local service
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(service) = self.forwarded.get(&connected_port).cloned() else {
            tracing::warn!(
                "Relay opened a channel for unexpected port {}:{}",
                connected_address,
                connected_port
            );
            return Ok(());
        };

        tracing::debug!(
            "Connection from {}:{} to Service {}",
            originator_address,
            originator_port,
            service
        );

        let Ok(local_port) = u16::try_from(connected_port) else {
            return Ok(());
        };
        let cancel = self.cancel.clone();
        let originator = format!("{}:{}", originator_address, originator_port);
        tokio::spawn(async move {
            match TcpStream::connect(("127.0.0.1", local_port)).await {
                Ok(socket) => {
                    let label = format!("{} -> {} (localhost:{})", originator, service, local_port);
                    bridge(Box::pin(channel.into_stream()), socket, cancel, label).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "Service {}: nothing is listening on localhost:{}: {}",
                        service,
                        local_port,
                        e
                    );
                    let _ = channel.close().await;
                }
            }
        });

        Ok(())
    }
}
