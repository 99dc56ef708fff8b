//! Trendline orchestrator service.
//!
//! Loads the pipeline from `TRENDLINE_CONFIG` (default
//! `config/pipeline.toml`), replays the run journal and drives the agents
//! until SIGINT or SIGTERM. SIGHUP reloads the pipeline file.

mod config;
mod executor;

use crate::config::{AppConfig, CONFIG_PATH_VAR, DEFAULT_CONFIG_PATH};
use crate::executor::CommandExecutor;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trendline_pipeline::ExecutorRegistry;
use trendline_scheduler::alert::LOG_CHANNEL;
use trendline_scheduler::{
    ConfigSnapshot, FileJournal, LogAlertSink, Orchestrator, load_config,
};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = std::env::var_os(CONFIG_PATH_VAR)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);

    let config: AppConfig = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(path = %path.display(), agents = config.pipeline.agents.len(), "loaded configuration");

    let missing = config.missing_executors();
    if !missing.is_empty() {
        warn!(
            executors = ?missing,
            "agents reference executors with no command; their runs will fail"
        );
    }

    let snapshot = match ConfigSnapshot::build(config.pipeline.clone()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "invalid pipeline configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.state_dir) {
        error!(dir = %config.state_dir.display(), error = %e, "cannot create state directory");
        return ExitCode::FAILURE;
    }
    let journal = match FileJournal::open(config.journal_path()) {
        Ok(journal) => journal,
        Err(e) => {
            error!(error = %e, "cannot open run journal");
            return ExitCode::FAILURE;
        }
    };

    let mut executors = ExecutorRegistry::new();
    for (name, spec) in &config.executors {
        executors.register(name.clone(), Arc::new(CommandExecutor::new(spec.clone())));
    }

    let orchestrator = match Orchestrator::builder(snapshot)
        .with_executors(executors)
        .with_journal(Arc::new(journal))
        .with_alert_sink(LOG_CHANNEL, Arc::new(LogAlertSink))
        .build()
    {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "failed to restore scheduler state");
            return ExitCode::FAILURE;
        }
    };

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(Arc::clone(&orchestrator), path));

    orchestrator.run(shutdown_signal()).await;
    ExitCode::SUCCESS
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

/// Re-reads the pipeline file on every SIGHUP. Invalid files are logged
/// and the running configuration stays in force.
#[cfg(unix)]
async fn reload_on_hangup(orchestrator: Arc<Orchestrator>, path: PathBuf) {
    let mut hangups =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGHUP, reload disabled");
                return;
            }
        };
    while hangups.recv().await.is_some() {
        match reload_snapshot(&path) {
            Ok(snapshot) => orchestrator.reload(snapshot),
            Err(reason) => warn!(path = %path.display(), %reason, "reload rejected"),
        }
    }
}

#[cfg(unix)]
fn reload_snapshot(path: &std::path::Path) -> Result<ConfigSnapshot, String> {
    let config: AppConfig = load_config(path).map_err(|e| e.to_string())?;
    ConfigSnapshot::build(config.pipeline).map_err(|e| e.to_string())
}
