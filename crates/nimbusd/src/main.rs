//! nimbusd — the Nimbus daemon.
//!
//! Single binary that assembles all Nimbus subsystems:
//! - State store (redb)
//! - Node registry (+ optional fleet seed file)
//! - Health monitor
//! - Port allocator + quota service
//! - Capacity scheduler + instance manager
//! - Billing meter
//! - REST API
//!
//! # Usage
//!
//! ```text
//! nimbusd serve --port 8080 --data-dir /var/lib/nimbus --fleet fleet.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use nimbus_billing::{BillingService, Pricing};
use nimbus_health::{HealthMonitor, HealthPolicy, MonitorConfig, TcpPinger};
use nimbus_manager::{InstanceManager, ManagerConfig, NoopRuntime};
use nimbus_ports::{PortAllocator, PortRange};
use nimbus_quota::{DefaultLimits, QuotaService};
use nimbus_registry::{FleetSeed, NodeRegistry};
use nimbus_scheduler::{CapacityScheduler, NoTelemetry};

#[derive(Parser)]
#[command(name = "nimbusd", about = "Nimbus orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (API server + health monitor).
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/nimbus")]
        data_dir: PathBuf,

        /// Fleet seed file (TOML list of nodes) loaded at startup.
        #[arg(long)]
        fleet: Option<PathBuf>,

        /// Health sweep interval in seconds.
        #[arg(long, default_value = "30")]
        health_interval: u64,

        /// Per-node probe timeout in seconds.
        #[arg(long, default_value = "5")]
        probe_timeout: u64,

        /// TCP port probed for node liveness.
        #[arg(long, default_value = "22")]
        probe_port: u16,

        /// Seconds an instance may stay pending across a restart
        /// before recovery writes it off.
        #[arg(long, default_value = "120")]
        pending_grace: u64,

        /// Seconds between usage metering passes.
        #[arg(long, default_value = "3600")]
        billing_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,nimbusd=debug,nimbus=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            fleet,
            health_interval,
            probe_timeout,
            probe_port,
            pending_grace,
            billing_interval,
        } => {
            serve(
                port,
                data_dir,
                fleet,
                health_interval,
                probe_timeout,
                probe_port,
                pending_grace,
                billing_interval,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    port: u16,
    data_dir: PathBuf,
    fleet: Option<PathBuf>,
    health_interval: u64,
    probe_timeout: u64,
    probe_port: u16,
    pending_grace: u64,
    billing_interval: u64,
) -> anyhow::Result<()> {
    info!("Nimbus daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("nimbus.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = nimbus_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let registry = NodeRegistry::new(store.clone());
    if let Some(path) = fleet {
        let seed = FleetSeed::from_file(&path)?;
        let added = registry.seed(seed)?;
        info!(path = ?path, added, "fleet seed loaded");
    }

    let ports = Arc::new(PortAllocator::new(PortRange::default()));
    let quotas = Arc::new(QuotaService::new(store.clone(), DefaultLimits::default()));
    let scheduler = CapacityScheduler::new(store.clone());
    let billing = Arc::new(BillingService::new(store.clone(), Pricing::default()));

    let manager = Arc::new(InstanceManager::new(
        store.clone(),
        scheduler.clone(),
        Arc::clone(&ports),
        Arc::clone(&quotas),
        Arc::new(NoopRuntime),
        ManagerConfig {
            pending_grace: Duration::from_secs(pending_grace),
            ..ManagerConfig::default()
        },
    ));

    // Rebuild the derived aggregates before serving any request.
    let report = manager.recover().await?;
    info!(
        restored_ports = report.restored_ports,
        expired_pending = report.expired_pending,
        "recovery complete"
    );

    let monitor = HealthMonitor::new(
        registry.clone(),
        Arc::new(TcpPinger::new(probe_port)),
        MonitorConfig {
            interval: Duration::from_secs(health_interval),
            probe_timeout: Duration::from_secs(probe_timeout),
            policy: HealthPolicy::default(),
        },
    );
    info!(interval = health_interval, "health monitor initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let monitor_handle = tokio::spawn(monitor.clone().run(shutdown_rx.clone()));
    let billing_handle = tokio::spawn(Arc::clone(&billing).run(
        Duration::from_secs(billing_interval),
        shutdown_rx,
    ));
    info!(interval = billing_interval, "billing meter started");

    // ── Start API server ───────────────────────────────────────

    let router = nimbus_api::build_router(nimbus_api::ApiState {
        manager,
        monitor,
        registry,
        quotas,
        scheduler,
        ports,
        billing,
        telemetry: Arc::new(NoTelemetry),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = monitor_handle.await;
    let _ = billing_handle.await;

    info!("Nimbus daemon stopped");
    Ok(())
}
