/*
[INPUT]:  EngineConfig, Ledger, notification sink, per-account MarketClient builder
[OUTPUT]: Supervised account loops with bounded shutdown and a per-account EngineReport
[POS]:    Execution layer - per-market orchestrator
[UPDATE]: When changing startup/shutdown guarantees or supervision semantics
*/

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use giftsnipe_adapter::{SharedMarketClient, SharedNotifier};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::account::{AccountError, AccountLoop, SharedContext};
use crate::config::{AccountConfig, EngineConfig};
use crate::exit::ExitStatus;
use crate::ledger::Ledger;
use crate::rate_limit::PermitPool;

static PANIC_HOOK_ONCE: Once = Once::new();

fn ensure_panic_hook_installed() {
    PANIC_HOOK_ONCE.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!("panic in account loop: {info}");
            previous(info);
        }));
    });
}

/// How an account loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountOutcome {
    Stopped,
    FatalAuth(String),
    Failed(String),
    Panicked(String),
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub outcomes: BTreeMap<String, AccountOutcome>,
}

impl EngineReport {
    /// Process exit status for this report.
    ///
    /// Every account halted on authorization maps to a configuration error so
    /// the launcher does not restart a process that cannot trade.
    pub fn exit_status(&self) -> ExitStatus {
        if !self.outcomes.is_empty()
            && self
                .outcomes
                .values()
                .all(|o| matches!(o, AccountOutcome::FatalAuth(_)))
        {
            return ExitStatus::ConfigError;
        }
        if self
            .outcomes
            .values()
            .any(|o| matches!(o, AccountOutcome::Failed(_) | AccountOutcome::Panicked(_)))
        {
            return ExitStatus::Crash;
        }
        ExitStatus::Clean
    }
}

struct ManagedAccount {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), AccountError>>,
}

/// Runs one account loop per configured account for a single market.
pub struct Engine {
    config: Arc<EngineConfig>,
    shared: SharedContext,
    accounts: HashMap<String, ManagedAccount>,
    shutdown: CancellationToken,
    done_tx: Option<mpsc::Sender<()>>,
    done_rx: mpsc::Receiver<()>,
}

impl Engine {
    pub fn new(config: EngineConfig, ledger: Ledger, notifier: SharedNotifier) -> Self {
        let permits = PermitPool::new(config.rate_limit.max_actions, config.rate_limit.window());
        let (done_tx, done_rx) = mpsc::channel(1);
        Self {
            config: Arc::new(config),
            shared: SharedContext {
                ledger,
                permits,
                notifier,
            },
            accounts: HashMap::new(),
            shutdown: CancellationToken::new(),
            done_tx: Some(done_tx),
            done_rx,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn market(&self) -> &str {
        self.config.market_name()
    }

    /// Spawn one loop per account, building each client with `build_client`.
    pub fn spawn_accounts<F>(&mut self, build_client: F) -> Result<()>
    where
        F: Fn(&AccountConfig) -> Result<SharedMarketClient>,
    {
        ensure_panic_hook_installed();
        let Some(done_tx) = self.done_tx.take() else {
            return Err(anyhow!("accounts already spawned"));
        };

        for account in &self.config.accounts {
            if self.accounts.contains_key(&account.id) {
                return Err(anyhow!("duplicate account id: {}", account.id));
            }

            let client = build_client(account)
                .with_context(|| format!("build market client for account={}", account.id))?;
            let shutdown = self.shutdown.child_token();
            let account_loop = AccountLoop::new(
                self.config.strategy_for(account),
                self.config.runtime.clone(),
                client,
                self.shared.clone(),
                shutdown.clone(),
            );

            let done = done_tx.clone();
            let handle = tokio::spawn(async move {
                let result = account_loop.run().await;
                drop(done);
                result
            });
            self.accounts.insert(account.id.clone(), ManagedAccount { shutdown, handle });
        }

        info!(
            market = %self.market(),
            accounts = self.accounts.len(),
            "account loops started"
        );
        Ok(())
    }

    /// Cancel a single account loop and wait for it within the grace period.
    pub async fn stop_account(&mut self, account_id: &str) -> Result<AccountOutcome> {
        let Some(account) = self.accounts.remove(account_id) else {
            return Err(anyhow!("account not found: {account_id}"));
        };
        account.shutdown.cancel();
        let deadline = Instant::now() + self.config.runtime.shutdown_grace();
        Ok(join_with_deadline(account_id, account.handle, deadline).await)
    }

    /// Block until shutdown is requested or every loop has exited, then join.
    pub async fn wait(&mut self) -> EngineReport {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!(market = %self.market(), "shutdown requested");
            }
            _ = self.done_rx.recv() => {
                info!(market = %self.market(), "all account loops exited");
            }
        }
        self.shutdown_and_wait().await
    }

    /// Request shutdown and join every loop, aborting the ones past the grace period.
    pub async fn shutdown_and_wait(&mut self) -> EngineReport {
        self.shutdown.cancel();
        let grace = self.config.runtime.shutdown_grace();
        self.join_all_with_deadline(grace).await
    }

    async fn join_all_with_deadline(&mut self, timeout: Duration) -> EngineReport {
        let deadline = Instant::now() + timeout;
        let mut report = EngineReport::default();

        let mut accounts: Vec<(String, ManagedAccount)> =
            std::mem::take(&mut self.accounts).into_iter().collect();
        accounts.sort_by(|a, b| a.0.cmp(&b.0));

        for (account_id, account) in accounts {
            let outcome = join_with_deadline(&account_id, account.handle, deadline).await;
            report.outcomes.insert(account_id, outcome);
        }
        report
    }
}

async fn join_with_deadline(
    account_id: &str,
    mut handle: JoinHandle<Result<(), AccountError>>,
    deadline: Instant,
) -> AccountOutcome {
    let sleep = sleep_until_deadline(deadline);
    tokio::select! {
        res = &mut handle => match res {
            Ok(Ok(())) => AccountOutcome::Stopped,
            Ok(Err(AccountError::Unauthorized(err))) => AccountOutcome::FatalAuth(err.to_string()),
            Ok(Err(err)) => AccountOutcome::Failed(err.to_string()),
            Err(join_err) if join_err.is_panic() => {
                error!(account = %account_id, "account loop panicked: {join_err}");
                AccountOutcome::Panicked(join_err.to_string())
            }
            Err(join_err) => AccountOutcome::Failed(join_err.to_string()),
        },
        _ = sleep => {
            handle.abort();
            warn!(account = %account_id, "account loop did not stop in time, aborted");
            AccountOutcome::Aborted
        }
    }
}

fn sleep_until_deadline(deadline: Instant) -> Sleep {
    tokio::time::sleep_until(deadline)
}
