//! spendwatch engine binary.
//!
//! Wires the ledger, job tracker, anomaly analyzer, and alert engine
//! together, starts the periodic loops, and serves the operational HTTP API
//! until a shutdown signal arrives.

use std::sync::Arc;
use std::time::Duration;

use spendwatch_core::{EngineConfig, LoggingConfig};
use spendwatch_engine::alerts::{AlertEngine, MetricResolver};
use spendwatch_engine::anomaly::AnomalyAnalyzer;
use spendwatch_engine::api::{build_router, AppState};
use spendwatch_engine::config::load_config;
use spendwatch_engine::job_api::HttpJobApi;
use spendwatch_engine::ledger::BudgetLedger;
use spendwatch_engine::notify::build_channels;
use spendwatch_engine::shutdown::{shutdown_signal, ShutdownCoordinator};
use spendwatch_engine::tracker::JobTracker;
use spendwatch_storage::{
    InMemoryAlertRepository, InMemoryCostRepository, InMemoryJobRepository,
};
use tracing::{info, warn};

/// Seconds to wait for in-flight work after the shutdown signal.
const DRAIN_TIMEOUT_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_arg = std::env::args().nth(1);
    let config = load_config(config_arg.as_deref())?;
    init_tracing(&config.logging);

    info!(
        listen_addr = %config.listen_addr,
        total_budget_usd = config.budget.total_budget_usd,
        "Starting spendwatch engine"
    );

    let coordinator = ShutdownCoordinator::new(DRAIN_TIMEOUT_SECS);
    let state = build_app_state(&config, &coordinator)?;

    state.analyzer.warm_up().await?;
    state.tracker.resume_pollers().await?;
    spawn_engine_loops(&config, &state, &coordinator);

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(listen_addr = %config.listen_addr, "Operational API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator.clone()))
        .await?;

    info!("HTTP server stopped, draining background work");
    coordinator.trigger();
    coordinator.drain().await;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    if config.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Build the shared [`AppState`] from configuration.
fn build_app_state(
    config: &EngineConfig,
    coordinator: &ShutdownCoordinator,
) -> anyhow::Result<Arc<AppState>> {
    let costs = Arc::new(InMemoryCostRepository::new());
    let jobs = Arc::new(InMemoryJobRepository::new());
    let alert_repo = Arc::new(InMemoryAlertRepository::new());

    let ledger = Arc::new(BudgetLedger::new(
        costs.clone() as Arc<dyn spendwatch_core::CostRepository>,
        config.budget.total_budget_usd,
    )?);
    let analyzer = Arc::new(AnomalyAnalyzer::new(
        costs as Arc<dyn spendwatch_core::CostRepository>,
        config.anomaly.clone(),
    ));
    let job_api = Arc::new(HttpJobApi::new(
        &config.tracker.job_api_url,
        config.tracker.job_api_timeout_ms,
    )?);
    let tracker = Arc::new(JobTracker::new(
        Arc::clone(&ledger),
        Arc::clone(&analyzer),
        jobs.clone() as Arc<dyn spendwatch_core::JobRepository>,
        job_api,
        config.tracker.clone(),
        coordinator.clone(),
    ));

    let resolver = Arc::new(MetricResolver::new(
        Arc::clone(&ledger),
        jobs as Arc<dyn spendwatch_core::JobRepository>,
        Arc::clone(&analyzer),
    ));
    let channels = build_channels(&config.alerting.channels)?;
    let alerts = Arc::new(AlertEngine::new(
        alert_repo,
        resolver,
        channels,
        config.alerting.clone(),
    ));

    Ok(Arc::new(AppState {
        ledger,
        tracker,
        analyzer,
        alerts,
        admin_token: config.admin_token.clone(),
    }))
}

/// Start the periodic loops: alert evaluation, trend sweep, and cleanup.
///
/// Each loop watches the shutdown token and counts its ticks as in-flight
/// work so shutdown can drain them.
fn spawn_engine_loops(
    config: &EngineConfig,
    state: &Arc<AppState>,
    coordinator: &ShutdownCoordinator,
) {
    if config.alerting.enabled {
        let alerts = Arc::clone(&state.alerts);
        let coord = coordinator.clone();
        let interval = Duration::from_secs(config.alerting.evaluation_interval_secs);
        tokio::spawn(async move {
            run_periodic("alert evaluation", interval, coord, move || {
                let alerts = Arc::clone(&alerts);
                async move { alerts.evaluate_rules().await }
            })
            .await;
        });

        let alerts = Arc::clone(&state.alerts);
        let analyzer = Arc::clone(&state.analyzer);
        let retention_hours = config.alerting.resolved_retention_hours;
        let coord = coordinator.clone();
        let interval = Duration::from_secs(config.alerting.cleanup_interval_secs);
        tokio::spawn(async move {
            run_periodic("cleanup", interval, coord, move || {
                let alerts = Arc::clone(&alerts);
                let analyzer = Arc::clone(&analyzer);
                async move {
                    analyzer.prune_resolved(retention_hours).await;
                    alerts.cleanup().await
                }
            })
            .await;
        });
    }

    if config.anomaly.enabled {
        let ledger = Arc::clone(&state.ledger);
        let analyzer = Arc::clone(&state.analyzer);
        let coord = coordinator.clone();
        let interval = Duration::from_secs(config.anomaly.trend_sweep_interval_secs);
        tokio::spawn(async move {
            run_periodic("trend sweep", interval, coord, move || {
                let ledger = Arc::clone(&ledger);
                let analyzer = Arc::clone(&analyzer);
                async move {
                    let status = ledger.status().await?;
                    analyzer.trend_sweep(&status).await.map(|_| ())
                }
            })
            .await;
        });
    }
}

/// Run `tick` on a fixed interval until shutdown is requested.
async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    coordinator: ShutdownCoordinator,
    tick: F,
) where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = spendwatch_core::Result<()>>,
{
    let token = coordinator.token();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(loop_name = name, "Periodic loop stopped");
                break;
            }
            _ = ticker.tick() => {
                let _guard = coordinator.track();
                if let Err(e) = tick().await {
                    warn!(loop_name = name, error = %e, "Periodic tick failed");
                }
            }
        }
    }
}
