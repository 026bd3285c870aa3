//! NodeHealth Operator Entry Point
//!
//! Starts the leader-election loop, the NodeHealthCheck controller and the
//! HTTP endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use nodehealth_k8s::controller::{ControllerState, LeaseManager};
use nodehealth_k8s::{config, controller, Error};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Name of the lease arbitrating which operator instance reconciles.
const LEADER_LEASE_NAME: &str = "nodehealth-operator-leader";
const LEADER_LEASE_TTL: Duration = Duration::from_secs(15);
const LEADER_RENEW_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "nodehealth-operator", version, about)]
struct Args {
    /// Namespace holding the coordination leases.
    #[arg(long, env = "NHC_LEASES_NAMESPACE", default_value = config::DEFAULT_LEASES_NAMESPACE)]
    leases_namespace: String,

    /// Periodic full resync interval in seconds.
    #[arg(long, env = "NHC_RESYNC_SECONDS", default_value_t = 60)]
    resync_seconds: u64,

    /// Requeue interval in seconds while a node lease is contended.
    #[arg(long, env = "NHC_LEASE_RETRY_SECONDS", default_value_t = 30)]
    lease_retry_seconds: u64,

    /// Bind address of the HTTP endpoint.
    #[cfg(feature = "rest-api")]
    #[arg(long, env = "NHC_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: std::net::SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    info!(
        "Starting NodeHealth Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    config::set_tunables(config::Tunables {
        leases_namespace: args.leases_namespace.clone(),
        resync_period: Duration::from_secs(args.resync_seconds),
        lease_retry_interval: Duration::from_secs(args.lease_retry_seconds),
        ..Default::default()
    });

    // Initialize Kubernetes client
    let client = Client::try_default().await.map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let holder = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "nodehealth-operator".to_string());
    let is_leader = start_leader_election(client.clone(), &args.leases_namespace, holder);

    let mut state = ControllerState::new(client.clone());
    state.is_leader = is_leader;
    let state = Arc::new(state);

    #[cfg(feature = "rest-api")]
    {
        let addr = args.http_addr;
        tokio::spawn(async move {
            if let Err(e) = nodehealth_k8s::rest_api::run_server(addr).await {
                tracing::error!("HTTP endpoint error: {:?}", e);
            }
        });
    }

    // Run the main controller loop
    controller::run_controller(state).await?;

    Ok(())
}

/// Renew the process-level leader lease in the background and expose the
/// outcome as a flag the reconciler consults. Per-node exclusion is handled
/// separately by the node leases; this switch only stops two operator
/// instances from reconciling at once.
fn start_leader_election(client: Client, namespace: &str, holder: String) -> Arc<AtomicBool> {
    let is_leader = Arc::new(AtomicBool::new(false));
    let flag = is_leader.clone();
    let manager = LeaseManager::with_holder(client, namespace.to_string(), holder);

    tokio::spawn(async move {
        loop {
            match manager
                .acquire_named(LEADER_LEASE_NAME, LEADER_LEASE_TTL)
                .await
            {
                Ok(outcome) => {
                    if outcome.acquired != flag.load(Ordering::Relaxed) {
                        info!(leader = outcome.acquired, "leader state changed");
                        flag.store(outcome.acquired, Ordering::Relaxed);
                    }
                }
                Err(e) => warn!("leader election error: {e}"),
            }
            tokio::time::sleep(LEADER_RENEW_INTERVAL).await;
        }
    });

    is_leader
}
