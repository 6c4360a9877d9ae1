//! Relay Pod forwarder
//!
//! Creates the relay Pod, waits for it to become ready, serves the local
//! control port and follows the Pod log until the tunnel user shows up.

use std::sync::Arc;

use futures::StreamExt;
use rd_cluster::ClusterClient;
use rd_core::SessionContext;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::container_user;
use super::manifest::{format_labels, pod_labels, pod_name, relay_pod};
use crate::backoff::ExponentialBackoff;
use crate::bridge::{bridge, pause_after_accept_error};
use crate::error::RelayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PodState {
    /// `run()` has not created the Pod yet
    Pending,
    /// The Pod exists
    Created,
    /// `stop()` ran; the Pod is gone or was never created
    Stopped,
}

/// Runs the relay Pod of a session
pub struct RelayPodForwarder {
    context: Arc<SessionContext>,
    cluster: Arc<dyn ClusterClient>,
    pod_name: String,
    /// Serializes Pod creation against `stop()`
    state: Mutex<PodState>,
    cancel: CancellationToken,
}

impl RelayPodForwarder {
    pub fn new(context: Arc<SessionContext>, cluster: Arc<dyn ClusterClient>) -> Self {
        let pod_name = pod_name(context.session_id());
        let cancel = context.child_token();
        Self {
            context,
            cluster,
            pod_name,
            state: Mutex::new(PodState::Pending),
            cancel,
        }
    }

    /// Name of the relay Pod
    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    /// Run until stopped.
    ///
    /// Returns `Ok` when cancelled; fails if the Pod cannot be created, never
    /// becomes ready or the control port cannot be bound.
    pub async fn run(&self) -> Result<(), RelayError> {
        {
            let mut state = self.state.lock().await;
            if *state != PodState::Pending || self.cancel.is_cancelled() {
                return Ok(());
            }

            self.cluster
                .create_pod(&relay_pod(&self.context))
                .await
                .map_err(|source| RelayError::CreatePod {
                    pod: self.pod_name.clone(),
                    source,
                })?;
            *state = PodState::Created;
        }

        tracing::info!(
            "{} with labels [{}] waiting for ready...",
            self.pod_name,
            format_labels(&pod_labels(self.context.session_id()))
        );

        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            result = self.cluster.wait_pod_ready(&self.pod_name) => {
                result.map_err(|source| RelayError::Readiness {
                    pod: self.pod_name.clone(),
                    source,
                })?;
            }
        }
        tracing::info!("{} is ready", self.pod_name);

        let port = self.context.control_port();
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|source| RelayError::Listen { port, source })?;

        tokio::join!(self.serve_control_port(listener), self.follow_log());
        Ok(())
    }

    /// Forward each control connection to the relay port of the Pod
    async fn serve_control_port(&self, listener: TcpListener) {
        let relay_port = self.context.config().relay.port;

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (socket, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept control connection: {}", e);
                    if !pause_after_accept_error(&self.cancel).await {
                        break;
                    }
                    continue;
                }
            };
            tracing::debug!("Control connection from {}", peer_addr);

            let cluster = Arc::clone(&self.cluster);
            let pod = self.pod_name.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                match cluster.port_forward(&pod, relay_port).await {
                    Ok(stream) => {
                        let label = format!("control {} -> {}:{}", peer_addr, pod, relay_port);
                        bridge(socket, stream, cancel, label).await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to forward control connection to {}: {}", pod, e);
                    }
                }
            });
        }
    }

    /// Follow the Pod log until the user is known and the stream ends
    async fn follow_log(&self) {
        let mut backoff = ExponentialBackoff::from_config(&self.context.config().log_backoff);

        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = self.cluster.pod_log_lines(&self.pod_name) => opened,
            };

            match opened {
                Ok(mut lines) => {
                    backoff.reset();
                    loop {
                        let next = tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            next = lines.next() => next,
                        };
                        match next {
                            Some(Ok(line)) => self.handle_log_line(&line),
                            Some(Err(e)) => {
                                tracing::warn!("Log stream of {} failed: {}", self.pod_name, e);
                                break;
                            }
                            None => {
                                tracing::debug!("Log stream of {} ended", self.pod_name);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to stream logs of {}: {}", self.pod_name, e);
                }
            }

            if self.context.discovered_user().is_resolved() {
                return;
            }

            let delay = backoff.next_delay();
            tracing::debug!("Reopening log stream of {} in {:?}", self.pod_name, delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn handle_log_line(&self, line: &str) {
        tracing::debug!("[{}] {}", self.pod_name, line);

        if let Some(user) = container_user(line) {
            if self.context.discovered_user().resolve(user) {
                tracing::info!(
                    "Opening remote development connection to {} on control port {}",
                    self.pod_name,
                    self.context.control_port()
                );
            }
        }
    }

    /// Stop the forwarder and remove the Pod.
    ///
    /// Safe before `run()` and on repeated calls. A Pod whose deletion failed
    /// is retried by the next call.
    pub async fn stop(&self) -> Result<(), RelayError> {
        self.cancel.cancel();

        let mut state = self.state.lock().await;
        if *state != PodState::Created {
            *state = PodState::Stopped;
            return Ok(());
        }

        tracing::info!("Removing Pod {}...", self.pod_name);
        match self.cluster.delete_pod(&self.pod_name).await {
            Ok(_) => {
                *state = PodState::Stopped;
                Ok(())
            }
            Err(source) => Err(RelayError::DeletePod {
                pod: self.pod_name.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rd_cluster::MemoryCluster;
    use rd_core::config::BackoffConfig;
    use rd_core::RemoteDevelopmentConfig;
    use std::time::Duration;

    fn forwarder(cluster: &MemoryCluster) -> Arc<RelayPodForwarder> {
        let config = RemoteDevelopmentConfig {
            log_backoff: BackoffConfig {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: 0.0,
            },
            ..Default::default()
        };
        let context = Arc::new(SessionContext::new(Arc::new(config)).unwrap());
        Arc::new(RelayPodForwarder::new(context, Arc::new(cluster.clone())))
    }

    async fn wait_for_pod(cluster: &MemoryCluster, name: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cluster.pod(name).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_user_discovered_from_log() {
        let cluster = MemoryCluster::new();
        let forwarder = forwarder(&cluster);
        let name = forwarder.pod_name().to_string();

        let task = {
            let forwarder = Arc::clone(&forwarder);
            tokio::spawn(async move { forwarder.run().await })
        };

        wait_for_pod(&cluster, &name).await;
        cluster.push_log_line(&name, "Starting sshd");
        cluster.push_log_line(&name, "Current container user is: the-random-user");
        cluster.mark_pod_ready(&name);

        let cancel = CancellationToken::new();
        let user = tokio::time::timeout(
            Duration::from_secs(5),
            forwarder.context.discovered_user().wait(&cancel),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(user, "the-random-user");

        forwarder.stop().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(cluster.pod(&name).is_none());
    }

    #[tokio::test]
    async fn test_log_stream_failures_are_retried() {
        let cluster = MemoryCluster::new();
        cluster.fail_log_streams(3);
        let forwarder = forwarder(&cluster);
        let name = forwarder.pod_name().to_string();

        let task = {
            let forwarder = Arc::clone(&forwarder);
            tokio::spawn(async move { forwarder.run().await })
        };

        wait_for_pod(&cluster, &name).await;
        cluster.push_log_line(&name, "Current container user is: jkube");
        cluster.mark_pod_ready(&name);

        let user = tokio::time::timeout(
            Duration::from_secs(5),
            forwarder
                .context
                .discovered_user()
                .wait(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(user, "jkube");

        forwarder.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cluster = MemoryCluster::new();
        let forwarder = forwarder(&cluster);
        let name = forwarder.pod_name().to_string();

        let task = {
            let forwarder = Arc::clone(&forwarder);
            tokio::spawn(async move { forwarder.run().await })
        };
        wait_for_pod(&cluster, &name).await;

        forwarder.stop().await.unwrap();
        forwarder.stop().await.unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(cluster.pod_deletions(), 1);
        assert!(cluster.pods().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_run() {
        let cluster = MemoryCluster::new();
        let forwarder = forwarder(&cluster);

        forwarder.stop().await.unwrap();
        forwarder.run().await.unwrap();

        assert!(cluster.pods().is_empty());
        assert_eq!(cluster.pod_deletions(), 0);
    }

    #[tokio::test]
    async fn test_pod_creation_failure() {
        let cluster = MemoryCluster::new();
        cluster.reject_pods("quota exceeded");
        let forwarder = forwarder(&cluster);

        let err = forwarder.run().await.unwrap_err();
        assert!(matches!(err, RelayError::CreatePod { .. }));

        forwarder.stop().await.unwrap();
        assert_eq!(cluster.pod_deletions(), 0);
    }

    #[tokio::test]
    async fn test_control_port_forwards_to_relay() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cluster = MemoryCluster::new();
        cluster.set_relay_endpoint(relay.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = relay.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let forwarder = forwarder(&cluster);
        let name = forwarder.pod_name().to_string();
        let task = {
            let forwarder = Arc::clone(&forwarder);
            tokio::spawn(async move { forwarder.run().await })
        };
        wait_for_pod(&cluster, &name).await;
        cluster.push_log_line(&name, "Current container user is: jkube");
        cluster.mark_pod_ready(&name);
        forwarder
            .context
            .discovered_user()
            .wait(&CancellationToken::new())
            .await
            .unwrap();

        let port = forwarder.context.control_port();
        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        forwarder.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
