//! Remote development service
//!
//! Starts and stops a session: Services first, then the relay Pod forwarder
//! and the port forwarder as two tasks watched by a supervisor. The first
//! fatal error of either task ends the session and rolls everything back.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{self, Either};
use rd_cluster::ClusterClient;
use rd_core::{RemoteDevelopmentConfig, SessionContext, SessionId};
use tokio::task::{JoinError, JoinHandle};

use crate::error::{RemoteDevError, ServiceError};
use crate::relay::RelayPodForwarder;
use crate::services::LocalServiceManager;
use crate::tunnel::PortForwarder;

/// Lifecycle state of the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServiceStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            ServiceStatus::Idle => "idle",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
        };
        f.write_str(status)
    }
}

/// Components of one started session
struct Session {
    context: Arc<SessionContext>,
    services: LocalServiceManager,
    relay: Arc<RelayPodForwarder>,
    tunnel: Arc<PortForwarder>,
    /// Held while Services are prepared or torn down
    services_lock: tokio::sync::Mutex<()>,
}

impl Session {
    fn new(context: Arc<SessionContext>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            services: LocalServiceManager::new(Arc::clone(&context), Arc::clone(&cluster)),
            relay: Arc::new(RelayPodForwarder::new(Arc::clone(&context), cluster)),
            tunnel: Arc::new(PortForwarder::new(Arc::clone(&context))),
            context,
            services_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create or redirect the configured Services.
    ///
    /// A concurrent `shutdown()` waits until the Service in flight is
    /// recorded and mutated, so it always sees the complete ledger.
    async fn prepare_services(&self) -> Result<(), ServiceError> {
        let _guard = self.services_lock.lock().await;
        self.services.create_or_replace_services().await
    }

    /// Cancel everything, remove the Pod and restore the Services.
    ///
    /// Safe to call repeatedly and concurrently; later calls only pick up
    /// what earlier ones left behind.
    async fn shutdown(&self) -> Result<(), RemoteDevError> {
        self.context.cancel();
        let _guard = self.services_lock.lock().await;

        self.tunnel.stop();

        let relay = self.relay.stop().await;
        if let Err(e) = &relay {
            tracing::warn!("{}", e);
        }
        let services = self.services.tear_down_services().await;

        relay?;
        services?;
        Ok(())
    }
}

#[derive(Default)]
struct State {
    status: ServiceStatus,
    session: Option<Arc<Session>>,
}

impl State {
    fn owns(&self, session: &Arc<Session>) -> bool {
        self.session
            .as_ref()
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Back to `Idle` if `session` is still the current one
fn release(state: &Mutex<State>, session: &Arc<Session>) {
    let mut state = lock(state);
    if state.owns(session) {
        state.session = None;
        state.status = ServiceStatus::Idle;
    }
}

/// Handle to a started session
pub struct SessionHandle {
    session_id: SessionId,
    pod_name: String,
    control_port: u16,
    supervisor: JoinHandle<Result<(), RemoteDevError>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Name of the relay Pod
    pub fn pod_name(&self) -> &str {
        &self.pod_name
    }

    /// Local port of the control connection
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Whether the session has ended
    pub fn is_finished(&self) -> bool {
        self.supervisor.is_finished()
    }

    /// Wait for the session to end.
    ///
    /// Resolves with the first fatal error of the session, or `Ok` once it
    /// was stopped.
    pub async fn wait(self) -> Result<(), RemoteDevError> {
        self.supervisor.await.map_err(task_error)?
    }
}

fn task_error(e: JoinError) -> RemoteDevError {
    RemoteDevError::Task(e.to_string())
}

/// Runs remote development sessions against a cluster
pub struct RemoteDevelopmentService {
    config: Arc<RemoteDevelopmentConfig>,
    cluster: Arc<dyn ClusterClient>,
    state: Arc<Mutex<State>>,
}

impl RemoteDevelopmentService {
    pub fn new(config: Arc<RemoteDevelopmentConfig>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            config,
            cluster,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> ServiceStatus {
        lock(&self.state).status
    }

    /// Start a session.
    ///
    /// Services are prepared before the forwarders are spawned; if that fails
    /// or the session is stopped meanwhile, whatever was already created is
    /// rolled back.
    pub async fn start(&self) -> Result<SessionHandle, RemoteDevError> {
        self.config.validate()?;

        let session = {
            let mut state = lock(&self.state);
            if state.status != ServiceStatus::Idle {
                return Err(RemoteDevError::AlreadyRunning);
            }

            let context = Arc::new(SessionContext::new(Arc::clone(&self.config))?);
            let session = Arc::new(Session::new(context, Arc::clone(&self.cluster)));
            state.status = ServiceStatus::Starting;
            state.session = Some(Arc::clone(&session));
            session
        };
        tracing::debug!(
            "Starting remote development session {}",
            session.context.session_id()
        );

        if let Err(e) = session.prepare_services().await {
            if let Err(rollback) = session.shutdown().await {
                tracing::warn!("Rollback after failed start is incomplete: {}", rollback);
            }
            release(&self.state, &session);
            return Err(e.into());
        }

        let tasks = {
            let mut state = lock(&self.state);
            if state.owns(&session) && !session.context.is_cancelled() {
                tracing::info!("Starting Kubernetes SSH service forwarder...");
                let relay = Arc::clone(&session.relay);
                let relay_task =
                    tokio::spawn(async move { relay.run().await.map_err(RemoteDevError::from) });

                tracing::info!("Starting port forwarder...");
                let tunnel = Arc::clone(&session.tunnel);
                let tunnel_task =
                    tokio::spawn(async move { tunnel.run().await.map_err(RemoteDevError::from) });

                state.status = ServiceStatus::Running;
                Some((relay_task, tunnel_task))
            } else {
                None
            }
        };

        let Some((relay_task, tunnel_task)) = tasks else {
            if let Err(e) = session.shutdown().await {
                tracing::warn!("Rollback after interrupted start is incomplete: {}", e);
            }
            release(&self.state, &session);
            return Err(RemoteDevError::StoppedDuringStartup);
        };

        let handle = SessionHandle {
            session_id: session.context.session_id().clone(),
            pod_name: session.relay.pod_name().to_string(),
            control_port: session.context.control_port(),
            supervisor: tokio::spawn(supervise(
                Arc::clone(&self.state),
                session,
                relay_task,
                tunnel_task,
            )),
        };
        Ok(handle)
    }

    /// Stop the current session, if any.
    ///
    /// Valid in every state; a stop during `start()` makes that start roll
    /// back and fail.
    pub async fn stop(&self) -> Result<(), RemoteDevError> {
        let session = {
            let mut state = lock(&self.state);
            state.status = ServiceStatus::Stopping;
            state.session.take()
        };

        let result = match session {
            Some(session) => session.shutdown().await,
            None => Ok(()),
        };

        lock(&self.state).status = ServiceStatus::Idle;
        tracing::info!("Remote development service stopped");
        result
    }
}

/// Wait for the first task to end, then shut the session down
async fn supervise(
    state: Arc<Mutex<State>>,
    session: Arc<Session>,
    relay_task: JoinHandle<Result<(), RemoteDevError>>,
    tunnel_task: JoinHandle<Result<(), RemoteDevError>>,
) -> Result<(), RemoteDevError> {
    let (first, remaining) = match future::select(relay_task, tunnel_task).await {
        Either::Left((result, tunnel_task)) => (result, tunnel_task),
        Either::Right((result, relay_task)) => (result, relay_task),
    };

    let first = first.map_err(task_error).and_then(|result| result);
    if let Err(e) = &first {
        tracing::error!("Remote development session failed: {}", e);
    }

    let teardown = session.shutdown().await;
    let second = remaining.await.map_err(task_error).and_then(|result| result);
    release(&state, &session);

    first.and(second).and(teardown)
}
