//! remote-dev: Joins the developer machine to a Kubernetes cluster network
//!
//! `run` redirects cluster Services to local processes and exposes cluster
//! endpoints locally until interrupted. `cleanup` removes relay Pods left
//! behind by sessions that did not shut down cleanly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rd_cluster::{ClusterClient, KubeCluster};
use rd_core::config::{self, RemoteDevelopmentConfig};
use rd_core::{LocalService, RemoteService, SessionId};
use rd_tunnel::relay::relay_selector;
use rd_tunnel::RemoteDevelopmentService;

#[derive(Parser)]
#[command(name = "remote-dev")]
#[command(about = "Remote development tunnel for Kubernetes")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Namespace (overrides config)
    #[arg(short, long, global = true, env = "REMOTE_DEV_NAMESPACE")]
    namespace: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a remote development session until interrupted
    Run(RunArgs),

    /// Remove leftover relay Pods
    Cleanup {
        /// Only remove the Pod of this session
        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Cluster Service to serve from this machine (overrides config)
    #[arg(long = "local-service", value_name = "NAME:PORT[:TYPE]")]
    local_services: Vec<LocalService>,

    /// Cluster endpoint to expose on this machine (overrides config)
    #[arg(long = "remote-service", value_name = "HOST:PORT[:LOCAL_PORT]")]
    remote_services: Vec<RemoteService>,

    /// Fixed local control port (overrides config)
    #[arg(long)]
    control_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(cli.config.as_ref())?;
    if cli.namespace.is_some() {
        config.namespace = cli.namespace;
    }

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Cleanup { session } => cleanup(config, session).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<RemoteDevelopmentConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        tracing::debug!("Using default configuration");
        Ok(RemoteDevelopmentConfig::default())
    }
}

async fn run(mut config: RemoteDevelopmentConfig, args: RunArgs) -> Result<()> {
    if !args.local_services.is_empty() {
        config.local_services = args.local_services;
    }
    if !args.remote_services.is_empty() {
        config.remote_services = args.remote_services;
    }
    if args.control_port.is_some() {
        config.control_port = args.control_port;
    }
    config.validate().context("Invalid configuration")?;

    if config.local_services.is_empty() && config.remote_services.is_empty() {
        tracing::warn!("No local or remote services configured, the session will only run the relay");
    }

    let cluster = KubeCluster::connect(config.namespace.as_deref())
        .await
        .context("Failed to connect to the cluster")?;
    tracing::info!("Using namespace {}", cluster.namespace());

    let service = RemoteDevelopmentService::new(Arc::new(config), Arc::new(cluster));
    let handle = service
        .start()
        .await
        .context("Failed to start remote development session")?;
    tracing::info!(
        "Session {} started (relay Pod {}, control port {})",
        handle.session_id(),
        handle.pod_name(),
        handle.control_port()
    );

    let wait = handle.wait();
    tokio::pin!(wait);

    let ended = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut wait => Some(result),
    };

    let stopped = service.stop().await;
    let result = match ended {
        Some(result) => result,
        None => wait.await,
    };

    result.context("Remote development session failed")?;
    stopped.context("Failed to clean up remote development session")?;
    Ok(())
}

async fn cleanup(config: RemoteDevelopmentConfig, session: Option<String>) -> Result<()> {
    let cluster = KubeCluster::connect(config.namespace.as_deref())
        .await
        .context("Failed to connect to the cluster")?;

    let session = session.map(SessionId::new);
    let selector = relay_selector(session.as_ref());
    let pods = cluster
        .list_pods(&selector)
        .await
        .context("Failed to list relay Pods")?;

    if pods.is_empty() {
        tracing::info!("No relay Pods found in namespace {}", cluster.namespace());
        return Ok(());
    }

    for pod in pods {
        let Some(name) = pod.metadata.name else {
            continue;
        };
        if cluster
            .delete_pod(&name)
            .await
            .with_context(|| format!("Failed to remove Pod {}", name))?
        {
            tracing::info!("Removed Pod {}", name);
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, stopping...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, stopping...");
        }
    }
}
