//! Shared helpers for the integration tests
//!
//! - [`RelayEmulator`]: an in-process SSH server playing the relay container
//! - [`act_as_kubelet`]: marks the relay Pod ready and prints the user line
//! - [`GatedCluster`]: holds `create_service` calls until released
//! - [`capture_logs`]: collects formatted log output of the current thread

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use rd_cluster::{ClusterClient, ClusterError, LogLines, MemoryCluster, TunnelStream};
use russh::server::{Auth, Handler, Msg, Session};
use russh::Channel;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

/// SSH server standing in for the relay container.
///
/// Accepts the key found in the `PUBLIC_KEY` env of the relay Pod stored in
/// the cluster, and only for the configured user. Supports `direct-tcpip`
/// channels and `tcpip-forward` requests. Connections pass through a proxy
/// so a test can cut them.
pub struct RelayEmulator {
    addr: SocketAddr,
    forwards: Arc<Mutex<HashMap<u32, SocketAddr>>>,
    reject_forwards: Arc<AtomicBool>,
    links: CancellationToken,
    cancel: CancellationToken,
}

impl RelayEmulator {
    pub async fn start(cluster: MemoryCluster, user: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ssh_addr = listener.local_addr().unwrap();

        let config = Arc::new(russh::server::Config {
            keys: vec![KeyPair::generate_ed25519().unwrap()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        let forwards = Arc::new(Mutex::new(HashMap::new()));
        let reject_forwards = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let links = cancel.child_token();

        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = proxy.local_addr().unwrap();
        tokio::spawn(run_proxy(proxy, ssh_addr, links.clone()));

        {
            let forwards = Arc::clone(&forwards);
            let reject_forwards = Arc::clone(&reject_forwards);
            let cancel = cancel.clone();
            let user = user.to_string();
            tokio::spawn(async move {
                loop {
                    let (socket, _) = tokio::select! {
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => match accepted {
                            Ok(accepted) => accepted,
                            Err(_) => break,
                        },
                    };

                    let handler = RelaySession {
                        cluster: cluster.clone(),
                        user: user.clone(),
                        forwards: Arc::clone(&forwards),
                        reject_forwards: Arc::clone(&reject_forwards),
                    };
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        let _ = russh::server::run_stream(config, socket, handler).await;
                    });
                }
            });
        }

        Self {
            addr,
            forwards,
            reject_forwards,
            links,
            cancel,
        }
    }

    /// Refuse every `tcpip-forward` request from now on
    pub fn reject_forwards(&self) {
        self.reject_forwards.store(true, Ordering::SeqCst);
    }

    /// Cut every client connection, as if the relay went away
    pub fn drop_connections(&self) {
        self.links.cancel();
    }

    /// Address the cluster port-forward should connect to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Where the emulator listens for a reverse-forwarded port
    pub fn forwarded_addr(&self, port: u16) -> Option<SocketAddr> {
        self.forwards.lock().unwrap().get(&u32::from(port)).copied()
    }

    /// Wait until the client requested a reverse forward of `port`
    pub async fn wait_for_forward(&self, port: u16) -> SocketAddr {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(addr) = self.forwarded_addr(port) {
                    return addr;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reverse forward was never requested")
    }
}

impl Drop for RelayEmulator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Pass connections through to the SSH server until `links` is cancelled
async fn run_proxy(proxy: TcpListener, ssh_addr: SocketAddr, links: CancellationToken) {
    loop {
        let mut client = tokio::select! {
            _ = links.cancelled() => break,
            accepted = proxy.accept() => match accepted {
                Ok((socket, _)) => socket,
                Err(_) => break,
            },
        };

        let links = links.clone();
        tokio::spawn(async move {
            let Ok(mut server) = TcpStream::connect(ssh_addr).await else {
                return;
            };
            tokio::select! {
                _ = links.cancelled() => {}
                _ = tokio::io::copy_bidirectional(&mut client, &mut server) => {}
            }
        });
    }
}

struct RelaySession {
    cluster: MemoryCluster,
    user: String,
    forwards: Arc<Mutex<HashMap<u32, SocketAddr>>>,
    reject_forwards: Arc<AtomicBool>,
}

impl RelaySession {
    /// Fingerprints of every key handed to a relay Pod
    fn authorized_fingerprints(&self) -> Vec<String> {
        self.cluster
            .pods()
            .into_iter()
            .filter_map(|pod| pod.spec)
            .flat_map(|spec| spec.containers)
            .filter_map(|container| container.env)
            .flatten()
            .filter(|env| env.name == "PUBLIC_KEY")
            .filter_map(|env| env.value)
            .filter_map(|line| {
                let encoded = line.split_whitespace().nth(1)?.to_string();
                russh_keys::parse_public_key_base64(&encoded).ok()
            })
            .map(|key| key.fingerprint())
            .collect()
    }
}

async fn pump(channel: Channel<Msg>, mut socket: TcpStream) {
    let mut stream = Box::pin(channel.into_stream());
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut socket).await;
}

#[async_trait]
impl Handler for RelaySession {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint();
        if user == self.user && self.authorized_fingerprints().contains(&fingerprint) {
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = format!("{}:{}", host_to_connect, port_to_connect);
        let Ok(socket) = TcpStream::connect(&target).await else {
            return Ok(false);
        };
        tokio::spawn(pump(channel, socket));
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.reject_forwards.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        self.forwards
            .lock()
            .unwrap()
            .insert(*port, listener.local_addr()?);

        let handle = session.handle();
        let address = address.to_string();
        let requested = *port;
        tokio::spawn(async move {
            while let Ok((socket, peer)) = listener.accept().await {
                let opened = handle
                    .channel_open_forwarded_tcpip(
                        address.clone(),
                        requested,
                        peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await;
                match opened {
                    Ok(channel) => {
                        tokio::spawn(pump(channel, socket));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(true)
    }
}

/// Play the kubelet for the relay Pod: make it ready and print the user line
pub async fn act_as_kubelet(cluster: &MemoryCluster, pod_name: &str, user: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while cluster.pod(pod_name).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("relay Pod was never created");

    cluster.push_log_line(pod_name, "Server listening on 0.0.0.0 port 2222.");
    cluster.push_log_line(pod_name, format!("Current container user is: {}", user));
    cluster.mark_pod_ready(pod_name);
}

/// Cluster whose `create_service` calls wait until [`GatedCluster::release`]
#[derive(Clone)]
pub struct GatedCluster {
    inner: MemoryCluster,
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
}

impl GatedCluster {
    pub fn new(inner: MemoryCluster) -> Self {
        Self {
            inner,
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }

    /// Wait until a `create_service` call is held at the gate
    pub async fn wait_for_create(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.entered.notified())
            .await
            .expect("create_service was never called");
    }

    /// Let every held and future call through
    pub fn release(&self) {
        self.gate.close();
    }
}

#[async_trait]
impl ClusterClient for GatedCluster {
    async fn get_service(&self, name: &str) -> Result<Option<Service>, ClusterError> {
        self.inner.get_service(name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Service, ClusterError> {
        self.entered.notify_one();
        let _ = self.gate.acquire().await;
        self.inner.create_service(service).await
    }

    async fn replace_service(&self, service: &Service) -> Result<Service, ClusterError> {
        self.inner.replace_service(service).await
    }

    async fn delete_service(&self, name: &str) -> Result<bool, ClusterError> {
        self.inner.delete_service(name).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        self.inner.create_pod(pod).await
    }

    async fn delete_pod(&self, name: &str) -> Result<bool, ClusterError> {
        self.inner.delete_pod(name).await
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ClusterError> {
        self.inner.list_pods(label_selector).await
    }

    async fn wait_pod_ready(&self, name: &str) -> Result<(), ClusterError> {
        self.inner.wait_pod_ready(name).await
    }

    async fn pod_log_lines(&self, name: &str) -> Result<LogLines, ClusterError> {
        self.inner.pod_log_lines(name).await
    }

    async fn port_forward(
        &self,
        name: &str,
        port: u16,
    ) -> Result<Box<dyn TunnelStream>, ClusterError> {
        self.inner.port_forward(name, port).await
    }
}

/// Echo server on an ephemeral port
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Connect, retrying until the listener shows up
pub async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(stream) = TcpStream::connect(addr).await {
                return stream;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listener never came up")
}

/// Write `payload` and read the same number of bytes back
pub async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("no echo")
        .unwrap();
    buf
}

/// Formatted log output collected in memory
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Number of lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Capture logs emitted on this thread until the guard is dropped.
///
/// Use with the default current-thread test runtime so spawned tasks log
/// through the same subscriber.
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (logs, guard)
}
