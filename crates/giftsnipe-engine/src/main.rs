/*
[INPUT]:  CLI arguments, YAML engine configuration, OS shutdown signals
[OUTPUT]: Running account loops for one market, exit code per the launcher contract
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use giftsnipe_adapter::{
    FanoutNotifier, LogNotifier, PaperMarket, SharedMarketClient, SharedNotifier, WebhookNotifier,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use giftsnipe_engine::logging::init_tracing;
use giftsnipe_engine::{Engine, EngineConfig, ExitStatus, Ledger, RunMode};

#[derive(Parser, Debug)]
#[command(name = "giftsnipe-engine", version, about = "Gift marketplace trading engine (one market per process)")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    let loaded = EngineConfig::from_file(&args.config_path);
    let prefix = loaded
        .as_ref()
        .map(|config| config.market_name())
        .unwrap_or("engine");

    let _guard = match init_tracing(&args.log_level, prefix) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("[{prefix}] {err:#}");
            return ExitStatus::ConfigError.into();
        }
    };

    let config = match loaded {
        Ok(config) => config,
        Err(err) => {
            error!(
                config_path = %args.config_path.display(),
                error = %err,
                "configuration error"
            );
            return ExitStatus::ConfigError.into();
        }
    };

    let status = match run(&args, config).await {
        Ok(status) => status,
        Err(err) => {
            error!(error = format!("{err:#}"), "engine failed");
            ExitStatus::Crash
        }
    };
    info!(code = status.code(), "engine exiting");
    status.into()
}

async fn run(args: &Cli, config: EngineConfig) -> Result<ExitStatus> {
    info!(
        config_path = %args.config_path.display(),
        mode = ?config.mode,
        accounts = config.accounts.len(),
        dry_run = args.dry_run,
        "configuration loaded"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(ExitStatus::Clean);
    }

    if config.mode == RunMode::Live {
        for account in &config.accounts {
            if let Err(err) = account.resolve_credentials() {
                error!(account = %account.id, error = %err, "credentials unavailable");
            }
        }
        error!("live mode requested but no live market client is linked into this binary");
        return Ok(ExitStatus::ConfigError);
    }

    let ledger_path = config.resolved_ledger_path();
    let ledger = Ledger::open(&ledger_path)
        .with_context(|| format!("open ledger {}", ledger_path.display()))?;
    info!(ledger = %ledger_path.display(), "ledger opened");

    let notifier = build_notifier(&config)?;
    let market = match config.paper.clone() {
        Some(feed) => PaperMarket::with_feed(feed),
        None => PaperMarket::new(),
    };

    let account_ids: Vec<String> = config.accounts.iter().map(|a| a.id.clone()).collect();
    let mut engine = Engine::new(config, ledger.clone(), notifier);
    setup_signal_handlers(engine.shutdown_token());

    engine
        .spawn_accounts(|_| Ok(Arc::new(market.clone()) as SharedMarketClient))
        .context("spawn account loops")?;

    let report = engine.wait().await;
    for (account, outcome) in &report.outcomes {
        info!(account = %account, outcome = ?outcome, "account loop finished");
    }

    for account in account_ids {
        match ledger.compute_pnl(&account) {
            Ok(pnl) => match serde_json::to_string(&pnl) {
                Ok(payload) => info!(account = %account, pnl = %payload, "ledger pnl"),
                Err(err) => warn!(account = %account, error = %err, "serialize pnl failed"),
            },
            Err(err) => warn!(account = %account, error = %err, "compute pnl failed"),
        }
    }

    Ok(report.exit_status())
}

fn build_notifier(config: &EngineConfig) -> Result<SharedNotifier> {
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
