use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rudder::agent::{
    create_agent_router, load_or_create_node_id, local_ip, new_shared_collector,
    spawn_heartbeat, spawn_task_monitor, AgentState, HeartbeatConfig, TaskSupervisor,
};
use rudder::cli::{AgentArgs, Cli, Commands, ServerArgs};
use rudder::cluster::{
    create_control_plane_router, spawn_executor, spawn_health_sweeper, spawn_scheduler,
    AgentTransport, ControlPlaneState, Executor, Node, NodeManager, ResourceManager,
    ResourceManagerConfig,
};
use rudder::store::Store;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Some(ref env_file) = cli.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Agent(args) => run_agent(args).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        process::exit(1);
    }
}

// ============================================================================
// Control plane
// ============================================================================

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let store = Store::open(&args.db_path)
        .with_context(|| format!("failed to open store at {}", args.db_path.display()))?;
    let node_manager = Arc::new(NodeManager::new(store));
    let transport = Arc::new(AgentTransport::new(node_manager.clone()));
    let executor = Arc::new(Executor::new(node_manager.clone(), transport.clone()));

    // Scheduler and executor communicate only through this plan channel.
    let (plan_tx, plan_rx) = mpsc::unbounded_channel();
    let _executor_shutdown = spawn_executor(executor.clone(), plan_rx);
    let (scheduler, _scheduler_shutdown) = spawn_scheduler(node_manager.clone(), plan_tx);

    let resource_manager = Arc::new(ResourceManager::new(
        node_manager.clone(),
        ResourceManagerConfig {
            heartbeat_timeout_secs: args.heartbeat_timeout_secs as f64,
            sweep_interval_secs: args.sweep_interval_secs,
        },
    ));
    let _sweeper_shutdown = spawn_health_sweeper(resource_manager.clone());

    let state = ControlPlaneState {
        node_manager,
        scheduler,
        executor,
        resource_manager,
        transport,
    };
    let app = create_control_plane_router(state);

    let addr = format!("{}:{}", args.bind_addr, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("control plane listening on {addr}");
    info!("  POST /register        - agent registration");
    info!("  POST /heartbeat       - agent heartbeats");
    info!("  POST /jobs            - submit a job");
    info!("  GET  /jobs            - list jobs");
    info!("  GET  /nodes           - list nodes");

    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Node agent
// ============================================================================

async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    let node_id = load_or_create_node_id(&args.state_dir)
        .with_context(|| format!("failed to load node id from {}", args.state_dir.display()))?;
    let ip_address = local_ip();
    let endpoint = format!("http://{}:{}", ip_address, args.port);

    let collector = new_shared_collector();
    let resources = collector.write().await.collect();

    // Registration is fatal on failure: an agent the control plane does
    // not know about cannot receive work.
    let node = Node {
        node_id: node_id.clone(),
        ip_address: ip_address.clone(),
        resources,
        healthy: true,
        last_heartbeat: 0.0,
        endpoint: endpoint.clone(),
    };
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("failed to create HTTP client")?;
    let response = client
        .post(format!("{}/register", args.server_url))
        .json(&node)
        .send()
        .await
        .with_context(|| format!("could not reach control plane at {}", args.server_url))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("registration rejected ({status}): {body}");
    }
    info!(%node_id, %ip_address, "registered with control plane");

    let supervisor = Arc::new(TaskSupervisor::new());
    let _heartbeat_shutdown = spawn_heartbeat(
        HeartbeatConfig::new(&args.server_url, &node_id)
            .with_interval(args.heartbeat_interval_secs),
        supervisor.clone(),
        collector,
    );
    let _monitor_shutdown = spawn_task_monitor(supervisor.clone());

    let app = create_agent_router(AgentState { supervisor });
    let addr = format!("{}:{}", args.bind_addr, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%node_id, "agent listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
