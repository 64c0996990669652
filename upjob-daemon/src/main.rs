//! # upjob daemon
//!
//! Hosts the update-job orchestrator. The daemon loads its configuration,
//! connects the orchestrator to the (simulated) remote job service and the
//! update-log server, then runs the requested commands and logs every
//! presentation event until the pipelines settle.
//!
//! ## Usage
//! ```bash
//! upjob-daemon --config /etc/upjob/daemon.yaml --check --upgrade system
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

mod cli;
mod config;
mod http_logs;

use cli::Args;
use config::{parse_duration, Config, DEFAULT_CONFIG_PATH};
use http_logs::HttpUpdateLogService;
use upjob_core::{
    Classification, JobSlot, MockJobService, ModelReceiver, Orchestrator, OrchestratorEvent,
    StaticUpdateLogService, SysinfoFreeSpace, UpdateLogService,
};

/// Interval at which the daemon checks whether all jobs are done.
const SETTLE_POLL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    upjob_common::init_logging_with(&args.log_level, args.log_format())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting upjob daemon");

    let config = load_config(&args)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let run_for = parse_duration(&args.run_for)
        .with_context(|| format!("Invalid --run-for value '{}'", args.run_for))?;

    let upgrades = args
        .upgrade
        .iter()
        .map(|name| name.parse::<Classification>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    info!(
        watchdog = %config.orchestrator.watchdog_interval,
        locale = %config.orchestrator.locale,
        update_log = config.update_log.enabled,
        "Update daemon configured"
    );

    if let Err(e) = run(config, &args, upgrades, run_for).await {
        error!(error = %e, "Update daemon failed");
        return Err(e);
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(config_path) => {
            // Explicit config file provided
            let cfg = Config::load(config_path).map_err(|e| {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                e
            })?;
            info!(config_path = %config_path, "Configuration loaded");
            Ok(cfg.with_cli_overrides(args))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                Ok(cfg.with_cli_overrides(args))
            }
            Err(_) => {
                info!("No config file found, using CLI arguments and defaults");
                Ok(Config::default().with_cli_overrides(args))
            }
        },
    }
}

/// Build the simulated job service from the `simulation` section.
fn build_remote(config: &Config) -> MockJobService {
    let sim = &config.simulation;
    let remote = MockJobService::with_auto_run(sim.step_duration());
    remote.set_package_size(sim.package_size);

    for (key, packages) in &sim.packages {
        let packages: Vec<&str> = packages.iter().map(String::as_str).collect();
        remote.set_packages(key, &packages);
    }
    for (id, description) in &sim.failures {
        warn!(job_id = %id, "Simulated jobs with this id will fail");
        remote.fail_jobs_with_id(id, description);
    }
    remote
}

fn build_log_service(config: &Config) -> Result<Arc<dyn UpdateLogService>> {
    let section = &config.update_log;
    if !section.enabled {
        info!("Update-log server disabled");
        return Ok(Arc::new(StaticUpdateLogService::default()));
    }

    info!(server = %section.server_url, unstable = section.unstable, "Using update-log server");
    let service =
        HttpUpdateLogService::new(&section.server_url, section.unstable, section.timeout_duration())?;
    Ok(Arc::new(service))
}

async fn run(
    config: Config,
    args: &Args,
    upgrades: Vec<Classification>,
    run_for: Duration,
) -> Result<()> {
    let deadline = Instant::now() + run_for;

    let remote = build_remote(&config);
    let log_service = build_log_service(&config)?;
    let space = SysinfoFreeSpace::new(config.orchestrator.space_check_path.clone());

    let (orchestrator, inbox_rx, model) = Orchestrator::new(
        config.orchestrator_config(),
        Arc::new(remote.clone()),
        log_service,
        Arc::new(space),
        config.policy_snapshot(),
    );
    let orchestrator = Arc::new(orchestrator);
    remote.attach(orchestrator.inbox());

    let run_loop = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run(inbox_rx).await }
    });
    let printer = tokio::spawn(log_model_events(model));

    orchestrator.init().await.context("Initialization failed")?;
    let orch = &orchestrator;

    if args.check || orchestrator.policy().auto_check {
        match orchestrator.check_for_updates().await {
            Ok(()) => {
                wait_until(deadline, move || async move {
                    orch.job(JobSlot::Check).await.is_none()
                })
                .await;
            }
            Err(e) => error!(error = %e, "Check for updates failed"),
        }
    }

    for classification in upgrades {
        if let Err(e) = orchestrator.dist_upgrade(classification).await {
            warn!(classification = %classification, error = %e, "Upgrade rejected");
        }
    }

    let settled = wait_until(deadline, move || async move {
        orch.job_snapshot().await.is_empty()
    })
    .await;

    if settled {
        info!("All update jobs settled");
    } else {
        warn!(run_for = %args.run_for, "Stopping with jobs still running");
    }

    for classification in Classification::CONCRETE {
        if let Some(item) = orchestrator.update_item(classification).await {
            info!(
                classification = %classification,
                packages = item.packages.len(),
                download_size = item.download_size,
                version = %item.version,
                "Update item"
            );
        }
    }

    let _ = orchestrator.inbox().send(OrchestratorEvent::Shutdown);
    run_loop.await.context("Orchestrator loop panicked")?;
    drop(orchestrator);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    info!("Update daemon stopped");
    Ok(())
}

/// Poll `done` until it holds or `deadline` passes. Returns whether it held.
async fn wait_until<F, Fut>(deadline: Instant, mut done: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    loop {
        if done().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(SETTLE_POLL).await;
    }
}

async fn log_model_events(mut model: ModelReceiver) {
    while let Some(event) = model.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => info!(event = %json, "Update event"),
            Err(e) => warn!(error = %e, ?event, "Failed to serialize update event"),
        }
    }
}
