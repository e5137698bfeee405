//! hoist Host Agent
//!
//! The host agent runs on each host and executes container jobs assigned
//! by the scheduler. Startup registers the agent's endpoints with service
//! discovery, resolves and connects to the scheduler, and verifies the
//! container runtime daemon is reachable; any failure there is fatal and
//! the externally supervised process exits to be restarted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hoist_host_agent::attach::run_attach_listener;
use hoist_host_agent::config::Config;
use hoist_host_agent::discovery::{
    attach_service_name, rpc_service_name, Discovery, HttpDiscovery, SCHEDULER_SERVICE,
};
use hoist_host_agent::orchestrator::Orchestrator;
use hoist_host_agent::ports::PortAllocator;
use hoist_host_agent::runtime::docker::DockerRuntime;
use hoist_host_agent::runtime::ContainerRuntime;
use hoist_host_agent::runtime_sync::run_runtime_sync;
use hoist_host_agent::scheduler::{
    HostDescriptor, HttpSchedulerClient, ResourceValue, SchedulerClient,
};
use hoist_host_agent::scheduler_sync::run_scheduler_sync;
use hoist_host_agent::state::JobStateStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;
    info!(
        host_id = %config.host_id,
        discovery_url = %config.discovery_url,
        runtime_socket = %config.runtime_socket,
        "Starting hoist host agent"
    );

    // Register this instance's endpoints and resolve the scheduler.
    let discovery = HttpDiscovery::new(&config.discovery_url);
    discovery
        .register(&rpc_service_name(&config.host_id), config.rpc_port)
        .await
        .context("registering rpc endpoint")?;
    discovery
        .register(&attach_service_name(&config.host_id), config.attach_port)
        .await
        .context("registering attach endpoint")?;

    let schedulers = discovery
        .lookup(SCHEDULER_SERVICE)
        .await
        .context("looking up scheduler instances")?;
    let scheduler_addr = schedulers
        .first()
        .context("no scheduler instances found")?;
    let scheduler: Arc<dyn SchedulerClient> =
        Arc::new(HttpSchedulerClient::new(&format!("http://{scheduler_addr}")));
    info!(scheduler_addr = %scheduler_addr, "Resolved scheduler");

    // The agent is useless without the runtime daemon; fail fast.
    let docker = DockerRuntime::new(&config.runtime_socket);
    docker
        .ping()
        .await
        .context("connecting to container runtime daemon")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);
    info!("Connected to container runtime");

    let store = Arc::new(JobStateStore::new());
    let ports = Arc::new(PortAllocator::start(
        config.port_range_start,
        config.port_range_end,
    ));

    // Attach-readiness listener, runtime event syncer, scheduler syncer.
    let attach_addr: SocketAddr = ([0, 0, 0, 0], config.attach_port).into();
    tokio::spawn({
        let store = Arc::clone(&store);
        async move {
            if let Err(e) = run_attach_listener(attach_addr, store).await {
                error!(error = %e, "attach listener failed");
            }
        }
    });
    tokio::spawn({
        let runtime = Arc::clone(&runtime);
        let store = Arc::clone(&store);
        async move { run_runtime_sync(runtime, store).await }
    });
    tokio::spawn({
        let store = Arc::clone(&store);
        let scheduler = Arc::clone(&scheduler);
        async move { run_scheduler_sync(store, scheduler).await }
    });

    // Register the host and drive its assignment stream.
    let host = HostDescriptor {
        id: config.host_id.clone(),
        resources: HashMap::from([(
            "memory".to_string(),
            ResourceValue {
                value: config.memory_mb,
            },
        )]),
    };
    let jobs = scheduler
        .register_host(&host)
        .await
        .context("registering host with scheduler")?;
    info!(host_id = %config.host_id, "Host registered");

    let orchestrator = Orchestrator::new(store, ports, runtime);
    tokio::select! {
        result = orchestrator.run(jobs) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    }
}
