/**
 * OBSERVATORY KERNEL - Supervisor entry point
 *
 * ROLE: Loads the configuration, opens the device bus, starts the
 * supervisor (workers, state machines, executor, watchdog), then serves the
 * command port and the HTTP API until `killserver` or ctrl-c.
 *
 * RESTART: the watchdog terminates this process on stale telemetry; the
 * service manager is expected to start it again.
 */

use anyhow::Context as _;
use observatory_kernel::alerts::{AlertSink, BusAlertSink, LogAlertSink};
use observatory_kernel::bus::{BusConnector, BusLink};
use observatory_kernel::command_server::CommandServer;
use observatory_kernel::config::{load_config, AlertBackend};
use observatory_kernel::context::{ObservatoryContext, SystemClock};
use observatory_kernel::dispatch::build_registry;
use observatory_kernel::executor::JsonlExposureLog;
use observatory_kernel::health::HealthTracker;
use observatory_kernel::http::{build_router, AppState};
use observatory_kernel::periodic::secs;
use observatory_kernel::supervisor::{Supervisor, SupervisorParts};
use observatory_kernel::watchdog::SysinfoKiller;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().await.context("loading configuration")?;
    info!(
        "[kernel] {} subsystems, bus {}:{}",
        config.subsystems.len(),
        config.bus.host,
        config.bus.port
    );

    let health = HealthTracker::new();
    let (link, _bus_task) = BusLink::start(&config.bus, health.clone());

    let alerts: Arc<dyn AlertSink> = match config.alerts.backend {
        AlertBackend::Log => Arc::new(LogAlertSink),
        AlertBackend::Bus => Arc::new(BusAlertSink::new(link.client())),
    };
    let mut ctx = ObservatoryContext::new(config, Arc::new(SystemClock), alerts);
    ctx.health = health;
    let ctx = Arc::new(ctx);

    let supervisor = Supervisor::start(
        ctx.clone(),
        SupervisorParts {
            connector: Arc::new(BusConnector::new(link.clone())),
            killer: Arc::new(SysinfoKiller),
            driver: None,
            exposure_log: Box::new(JsonlExposureLog::new(&ctx.config.scheduler.exposure_log)),
        },
    )
    .await;

    let registry = build_registry(supervisor.services())?;
    let server = CommandServer::new(registry, secs(ctx.config.command_server.reply_timeout_s));
    let stop = server.shutdown_handle();
    let listener = CommandServer::bind(&ctx.config.command_server.addr)
        .await
        .with_context(|| format!("binding command port {}", ctx.config.command_server.addr))?;
    let command_task = tokio::spawn(server.serve(listener));

    if ctx.config.http.enabled {
        let app = build_router(AppState {
            ctx: ctx.clone(),
            master: supervisor.master.clone(),
            executor: supervisor.executor.clone(),
        });
        let http_listener = TcpListener::bind(&ctx.config.http.addr)
            .await
            .with_context(|| format!("binding http {}", ctx.config.http.addr))?;
        info!("[kernel] http api on {}", ctx.config.http.addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                error!("[kernel] http server stopped: {e}");
            }
        });
    }

    tokio::select! {
        res = command_task => match res {
            Ok(Ok(())) => info!("[kernel] command server closed"),
            Ok(Err(e)) => error!("[kernel] command server failed: {e}"),
            Err(e) => error!("[kernel] command server task: {e}"),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("[kernel] interrupted");
            stop.shutdown();
        }
    }

    supervisor.shutdown();
    Ok(())
}
