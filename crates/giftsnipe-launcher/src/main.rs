/*
[INPUT]:  CLI arguments, YAML launcher configuration, OS shutdown signals
[OUTPUT]: Supervised market processes; exit 0 unless a market exhausted its restarts
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags or the supervision entry flow
*/

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use giftsnipe_adapter::{FanoutNotifier, LogNotifier, SharedNotifier, WebhookNotifier};
use giftsnipe_engine::ExitStatus;
use giftsnipe_engine::logging::init_tracing;
use giftsnipe_launcher::{LauncherConfig, Supervisor, SupervisorSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "giftsnipe-launcher", version, about = "Runs and supervises one engine process per market")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", default_value = "configs/launcher.yaml")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    let _guard = match init_tracing(&args.log_level, "launcher") {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("[launcher] {err:#}");
            return ExitStatus::ConfigError.into();
        }
    };

    let config = match LauncherConfig::from_file(&args.config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(config_path = %args.config_path.display(), error = %err, "configuration error");
            return ExitStatus::ConfigError.into();
        }
    };

    let status = match run(&args, config).await {
        Ok(status) => status,
        Err(err) => {
            error!(error = format!("{err:#}"), "launcher failed");
            ExitStatus::Crash
        }
    };
    info!(code = status.code(), "launcher exiting");
    status.into()
}

async fn run(args: &Cli, config: LauncherConfig) -> Result<ExitStatus> {
    let enabled: Vec<&str> = config.enabled_markets().map(|m| m.name.as_str()).collect();
    info!(
        config_path = %args.config_path.display(),
        markets = ?enabled,
        "configuration loaded"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(ExitStatus::Clean);
    }
    if enabled.is_empty() {
        error!("no enabled markets in config");
        return Ok(ExitStatus::ConfigError);
    }

    let config_dir = args
        .config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default();
    let settings = SupervisorSettings::from_config(&config, config_dir);
    info!(engine = %settings.engine_path.display(), "engine binary resolved");

    let notifier = build_notifier(&config)?;
    let mut supervisor = Supervisor::new(&config, settings, notifier);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let status = supervisor.run(shutdown).await;
    for (name, handle) in supervisor.snapshot() {
        info!(market = %name, state = %handle.state, restarts = handle.restarts, "final state");
    }
    let exhausted = supervisor.exhausted_markets();
    if !exhausted.is_empty() {
        error!(markets = ?exhausted, "markets stopped after exhausting their restart policy");
    }
    Ok(status)
}

fn build_notifier(config: &LauncherConfig) -> Result<SharedNotifier> {
    let mut fanout = FanoutNotifier::new().with(Arc::new(LogNotifier));
    if let Some(url) = config
        .notifications
        .as_ref()
        .and_then(|n| n.webhook_url.as_deref())
    {
        let webhook = WebhookNotifier::new(url).context("build webhook notifier")?;
        fanout = fanout.with(Arc::new(webhook));
    }
    Ok(Arc::new(fanout))
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
