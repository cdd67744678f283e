//! Fleet Orchestrator
//!
//! Per-machine worker-service orchestrator for the GPU compute fleet.
//!
//! ## Startup sequence
//!
//! ```text
//! WORKERS + ecosystem.config.json + service mapping
//!   ↓ (Structure::build)
//! immutable machine Structure
//!   ↓ (StartupOrchestrator: parallel services → warm-up → sequential pairs)
//! supervised backend services + queue workers
//!   ↓ (StatusAggregator: events + periodic polls)
//! machine:status:<machine_id> snapshots + admin read-view
//! ```
//!
//! ## Shutdown
//!
//! SIGTERM/SIGINT publishes one final `shutdown` snapshot, then stops all
//! children in reverse start order.

pub mod api;
pub mod config;
pub mod state;

use async_trait::async_trait;
use axum_helpers::ShutdownCoordinator;
use config::Config;
use core_config::DeployMode;
use domain_machine::{ServiceMapping, Structure, descriptor};
use domain_status::{
    HttpHealthProbe, Pm2Status, ProcessTableEntry, ProcessTableSource, StatusAggregator,
    StatusPublisher, StatusReducer, run_poller, run_subscriber,
};
use domain_supervision::{
    ProcessSupervisor, ScriptPresenceCheck, ServiceState, StartupOrchestrator, StartupPlan,
    SupervisorEvent,
};
use eyre::{Result, WrapErr};
use metrics_exporter_prometheus::PrometheusBuilder;
use state::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Adapter: the supervisor's process table in status vocabulary.
struct SupervisorTableSource {
    supervisor: Arc<ProcessSupervisor>,
}

#[async_trait]
impl ProcessTableSource for SupervisorTableSource {
    async fn process_table(&self) -> Vec<ProcessTableEntry> {
        self.supervisor
            .process_table()
            .await
            .into_iter()
            .map(|entry| ProcessTableEntry {
                name: entry.name,
                status: match entry.state {
                    ServiceState::Starting | ServiceState::Ready | ServiceState::Running => {
                        Pm2Status::Online
                    }
                    ServiceState::Stopping | ServiceState::Stopped => Pm2Status::Stopped,
                    ServiceState::Failed => Pm2Status::Errored,
                },
                pid: entry.pid,
                port: entry.port,
            })
            .collect()
    }
}

/// Run the orchestrator.
///
/// # Errors
///
/// Returns an error (and a non-zero exit code) if:
/// - Configuration is invalid (`WORKERS`, `HUB_REDIS_URL`, ...)
/// - The process descriptor is missing or malformed
/// - Any backend service or worker fails to start or become ready
/// - Redis is unreachable after bounded retries
pub async fn run() -> Result<()> {
    // Logging first: JSON on fleet machines, compact on workstations
    let mode = DeployMode::detect();
    core_config::tracing::init(mode);

    let config = Config::load().wrap_err("Failed to load configuration")?;
    info!(
        name = %config.identity.name,
        version = %config.identity.version,
        mode = ?config.identity.mode,
        machine_id = %config.machine.machine_id,
        "Starting fleet orchestrator"
    );

    // Initialize Prometheus metrics
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("Failed to install metrics recorder")?;

    // Resolve the machine structure
    let mut records = descriptor::load(&config.machine.ecosystem_path)
        .wrap_err("Failed to load the process descriptor")?;
    let mapping = ServiceMapping::bundled().with_env_port_overrides();
    if config.machine.gpu_mode.is_mock() {
        descriptor::apply_cpu_fallback(&mut records, &mapping);
    }
    if let Some(token) = &config.machine.worker_auth_token {
        descriptor::inject_worker_auth_token(&mut records, token);
    }
    let structure = Structure::build(
        &config.machine.machine_id,
        &config.machine.workers,
        &records,
        &mapping,
    )
    .wrap_err("Failed to resolve the machine structure")?;
    info!(
        gpu_count = structure.gpu_count,
        workers = structure.workers.len(),
        services = structure.services.len(),
        capabilities = ?structure.capabilities,
        "Machine structure resolved"
    );

    // Bring everything up
    let run_dir = std::env::temp_dir().join(format!("fleet-{}", config.machine.machine_id));
    let install = Arc::new(ScriptPresenceCheck::from_records(&records));
    let supervisor = Arc::new(
        ProcessSupervisor::new(run_dir, install).wrap_err("Failed to initialize supervisor")?,
    );

    // Runtime exits are reported, never auto-restarted at this layer; the
    // periodic poll folds them into the published status.
    if let Some(mut exits) = supervisor.take_events() {
        tokio::spawn(async move {
            while let Some(SupervisorEvent::ChildExited {
                name, exit_code, ..
            }) = exits.recv().await
            {
                warn!(name = %name, exit_code = ?exit_code, "Supervised process exited");
            }
        });
    }

    let plan = StartupPlan::from_records(&records, &mapping);
    let mut startup = StartupOrchestrator::new(
        Arc::clone(&supervisor),
        plan,
        config.machine.warmup,
        config.machine.validate_delay,
    );
    // Already-started processes are torn down LIFO inside the orchestrator
    startup.run().await.wrap_err("Startup failed")?;
    info!(started = ?startup.started_services(), "All pairs started");

    // Status aggregation
    info!(hub = %config.hub.redacted(), "Connecting to the hub queue");
    let redis =
        domain_status::redis::connect_with_retry(&config.hub.url, config.hub.connect_attempts)
            .await
            .wrap_err("Failed to connect to the hub queue")?;

    let health_url = format!("http://localhost:{}/health", config.admin.port);
    let reducer = StatusReducer::new(&config.machine.machine_id, structure, health_url);
    let publisher = StatusPublisher::new(redis.clone(), &config.machine.machine_id);
    let (handle, aggregator_task) = StatusAggregator::spawn(reducer, publisher);

    let (stop_tx, stop_rx) = watch::channel(false);
    let subscriber_task = tokio::spawn(run_subscriber(
        config.hub.url.clone(),
        config.machine.machine_id.clone(),
        handle.clone(),
        stop_rx.clone(),
    ));
    let poller_task = tokio::spawn(run_poller(
        handle.clone(),
        Arc::new(SupervisorTableSource {
            supervisor: Arc::clone(&supervisor),
        }),
        Arc::new(HttpHealthProbe::default()),
        Some(redis.clone()),
        config.machine.status_interval,
        stop_rx.clone(),
    ));

    // Machine is up: phase → ready, then the initial snapshot
    handle.machine_ready().await.ok();
    handle.publish_initial().await.ok();

    // Admin read-view
    let app_state = AppState::new(config.identity, handle.snapshot(), metrics);
    let admin_addr = config.admin.socket_addr();
    let listener = TcpListener::bind(admin_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", admin_addr))?;
    info!(address = %admin_addr, "Admin server listening");

    let coordinator = ShutdownCoordinator::new();
    let mut server_shutdown = coordinator.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::router(app_state))
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await
        {
            error!(error = %e, "Admin server failed");
        }
    });

    coordinator.wait_for_signal().await;

    // Teardown: one final shutdown snapshot, then children in LIFO order
    let _ = stop_tx.send(true);
    handle.shutdown().await;
    let _ = aggregator_task.await;
    let _ = subscriber_task.await;
    let _ = poller_task.await;
    supervisor.stop_all().await;
    let _ = server_task.await;

    info!("Fleet orchestrator stopped");
    Ok(())
}
