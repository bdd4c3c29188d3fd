/*
[INPUT]:  LauncherConfig market descriptors, notification sink, shutdown token
[OUTPUT]: One supervised OS process per enabled market, restarted per policy
[POS]:    Supervision layer - process lifecycle and fault isolation
[UPDATE]: When changing spawn, liveness, restart or shutdown behavior
*/

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use giftsnipe_adapter::{NotificationEvent, SharedNotifier};
use giftsnipe_engine::ExitStatus;
use giftsnipe_engine::exit::CONFIG_ERROR_CODE;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{LauncherConfig, MarketDescriptor, expand_token, sibling_engine_path};
use crate::policy::{RestartDecision, RestartTracker};
use crate::state_machine::{MarketAction, MarketState, MarketStateMachine, StopReason};

/// Environment variable carrying the market name into the child.
pub const MARKET_ENV: &str = "GIFTSNIPE_MARKET";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub liveness_grace: Duration,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    /// Base for relative `cwd` values and `${CONFIG_DIR}`
    pub config_dir: PathBuf,
    /// Target of `${ENGINE}`
    pub engine_path: PathBuf,
}

impl SupervisorSettings {
    pub fn from_config(config: &LauncherConfig, config_dir: impl Into<PathBuf>) -> Self {
        let mut config_dir = config_dir.into();
        if config_dir.as_os_str().is_empty() {
            config_dir = PathBuf::from(".");
        }
        Self {
            liveness_grace: config.liveness_grace(),
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            config_dir,
            engine_path: sibling_engine_path(),
        }
    }
}

/// Point-in-time view of one supervised market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub market: String,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub state: MarketState,
    pub restarts: usize,
}

struct ManagedMarket {
    descriptor: MarketDescriptor,
    machine: MarketStateMachine,
    tracker: RestartTracker,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    live_at: Option<Instant>,
    restart_at: Option<Instant>,
    stop_requested: bool,
    restarts: usize,
}

impl ManagedMarket {
    fn new(descriptor: MarketDescriptor) -> Self {
        let tracker = RestartTracker::new(descriptor.restart.clone());
        Self {
            descriptor,
            machine: MarketStateMachine::default(),
            tracker,
            child: None,
            pid: None,
            started_at: None,
            live_at: None,
            restart_at: None,
            stop_requested: false,
            restarts: 0,
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn state(&self) -> MarketState {
        self.machine.state()
    }

    fn apply(&mut self, action: MarketAction) -> Option<MarketState> {
        let from = self.machine.state();
        match self.machine.transition(action) {
            Ok(to) => {
                info!(market = %self.descriptor.name, from = %from, to = %to, "state transition");
                Some(to)
            }
            Err(err) => {
                error!(market = %self.descriptor.name, error = %err, "rejected state transition");
                None
            }
        }
    }

    fn start(&mut self, settings: &SupervisorSettings, notifier: &SharedNotifier, now: Instant) {
        if self.apply(MarketAction::Start).is_none() {
            return;
        }
        self.restart_at = None;

        match spawn_child(&self.descriptor, settings) {
            Ok(mut child) => {
                self.pid = child.id();
                self.started_at = Some(Utc::now());
                self.live_at = Some(now + settings.liveness_grace);
                if let Some(stdout) = child.stdout.take() {
                    relay_output(self.descriptor.name.clone(), "stdout", stdout);
                }
                if let Some(stderr) = child.stderr.take() {
                    relay_output(self.descriptor.name.clone(), "stderr", stderr);
                }
                self.child = Some(child);
                info!(
                    market = %self.descriptor.name,
                    pid = self.pid.unwrap_or_default(),
                    command = %self.descriptor.command.join(" "),
                    "process started"
                );
            }
            Err(err) => {
                error!(market = %self.descriptor.name, error = %err, "failed to start process");
                self.crash(false, now, notifier);
            }
        }
    }

    /// Reap an exited child or promote it to Running after the liveness grace.
    fn poll_child(&mut self, now: Instant, notifier: &SharedNotifier) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                self.child = None;
                self.pid = None;
                self.live_at = None;
                self.on_exit(status.code(), now, notifier);
            }
            Ok(None) => {
                if self.state() == MarketState::Starting
                    && self.live_at.is_some_and(|live_at| now >= live_at)
                {
                    self.apply(MarketAction::ConfirmLive);
                }
            }
            Err(err) => {
                warn!(market = %self.descriptor.name, error = %err, "failed to poll process");
            }
        }
    }

    fn on_exit(&mut self, code: Option<i32>, now: Instant, notifier: &SharedNotifier) {
        if self.stop_requested {
            info!(market = %self.descriptor.name, code = ?code, "process exited on request");
            self.apply(MarketAction::RequestedExit);
            return;
        }

        if code == Some(CONFIG_ERROR_CODE) {
            let from = self.state();
            error!(
                market = %self.descriptor.name,
                code = CONFIG_ERROR_CODE,
                "process reported a configuration error, not restarting"
            );
            if let Some(to) = self.apply(MarketAction::ConfigExit) {
                notifier.notify(NotificationEvent::MarketStateChanged {
                    market: self.descriptor.name.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            return;
        }

        warn!(market = %self.descriptor.name, code = ?code, "process exited unexpectedly");
        self.crash(code == Some(0), now, notifier);
    }

    fn crash(&mut self, clean: bool, now: Instant, notifier: &SharedNotifier) {
        let from = self.state();
        if self.apply(MarketAction::Crash).is_none() {
            return;
        }
        notifier.notify(NotificationEvent::MarketStateChanged {
            market: self.descriptor.name.clone(),
            from: from.to_string(),
            to: MarketState::Crashed.to_string(),
        });

        match self.tracker.on_exit(clean, now) {
            RestartDecision::Restart { delay, attempt } => {
                self.apply(MarketAction::ScheduleRestart);
                self.restart_at = Some(now + delay);
                self.restarts += 1;
                info!(
                    market = %self.descriptor.name,
                    delay_ms = delay.as_millis() as u64,
                    attempt,
                    max_attempts = self.descriptor.restart.max_attempts,
                    "restart scheduled"
                );
            }
            RestartDecision::Exhausted { attempts } => {
                self.apply(MarketAction::GiveUp);
                error!(
                    market = %self.descriptor.name,
                    attempts,
                    window_secs = self.descriptor.restart.window_secs,
                    "restart policy exhausted, market stays stopped"
                );
                notifier.notify(NotificationEvent::RestartPolicyExhausted {
                    market: self.descriptor.name.clone(),
                    attempts,
                });
            }
        }
    }

    fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            market: self.descriptor.name.clone(),
            pid: self.pid,
            started_at: self.started_at,
            state: self.state(),
            restarts: self.restarts,
        }
    }
}

/// Supervises every enabled market of a launcher configuration.
pub struct Supervisor {
    settings: SupervisorSettings,
    markets: BTreeMap<String, ManagedMarket>,
    notifier: SharedNotifier,
}

impl Supervisor {
    pub fn new(config: &LauncherConfig, settings: SupervisorSettings, notifier: SharedNotifier) -> Self {
        let mut markets = BTreeMap::new();
        for descriptor in &config.markets {
            if !descriptor.enabled {
                info!(market = %descriptor.name, "market disabled, skipping");
                continue;
            }
            markets.insert(descriptor.name.clone(), ManagedMarket::new(descriptor.clone()));
        }
        Self {
            settings,
            markets,
            notifier,
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn start_all(&mut self) {
        let now = Instant::now();
        let settings = &self.settings;
        let notifier = &self.notifier;
        for market in self.markets.values_mut() {
            if market.state() == MarketState::Stopped(StopReason::NotStarted) {
                market.start(settings, notifier, now);
            }
        }
    }

    /// One supervision pass: reap exits, confirm liveness, fire due restarts.
    pub fn poll_once(&mut self, now: Instant) {
        let settings = &self.settings;
        let notifier = &self.notifier;
        for market in self.markets.values_mut() {
            match market.state() {
                MarketState::Starting | MarketState::Running => market.poll_child(now, notifier),
                MarketState::Restarting
                    if market.restart_at.is_some_and(|restart_at| now >= restart_at) =>
                {
                    market.start(settings, notifier, now);
                }
                _ => {}
            }
        }
    }

    /// Start every market and supervise until shutdown or until all are terminal.
    pub async fn run(&mut self, shutdown: CancellationToken) -> ExitStatus {
        self.start_all();
        loop {
            if self.all_terminal() {
                info!("every market is stopped");
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested");
                    let timeout = self.settings.shutdown_timeout;
                    self.stop_all(timeout).await;
                    break;
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {
                    self.poll_once(Instant::now());
                }
            }
        }
        self.exit_status()
    }

    /// SIGTERM every live child, SIGKILL the ones still alive after `timeout`.
    pub async fn stop_all(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        for market in self.markets.values_mut() {
            market.stop_requested = true;
            if let Some(child) = market.child.as_mut() {
                info!(market = %market.descriptor.name, "stopping");
                terminate(child, &market.descriptor.name);
            }
        }

        for market in self.markets.values_mut() {
            match market.child.take() {
                Some(mut child) => {
                    match tokio::time::timeout_at(deadline, child.wait()).await {
                        Ok(Ok(status)) => {
                            info!(market = %market.descriptor.name, code = ?status.code(), "process exited");
                        }
                        Ok(Err(err)) => {
                            warn!(market = %market.descriptor.name, error = %err, "wait for process failed");
                        }
                        Err(_) => {
                            warn!(market = %market.descriptor.name, "shutdown timeout elapsed, killing process");
                            if let Err(err) = child.kill().await {
                                warn!(market = %market.descriptor.name, error = %err, "kill failed");
                            }
                        }
                    }
                    market.pid = None;
                    market.live_at = None;
                    market.apply(MarketAction::RequestedExit);
                }
                None if !market.state().is_terminal() => {
                    market.restart_at = None;
                    market.apply(MarketAction::Stop);
                }
                None => {}
            }
        }
        info!("all markets stopped");
    }

    pub fn state(&self, market: &str) -> Option<MarketState> {
        self.markets.get(market).map(ManagedMarket::state)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ProcessHandle> {
        self.markets
            .iter()
            .map(|(name, market)| (name.clone(), market.handle()))
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.markets.values().all(|m| m.state().is_terminal())
    }

    pub fn exhausted_markets(&self) -> Vec<&str> {
        self.markets
            .values()
            .filter(|m| m.state() == MarketState::Stopped(StopReason::PolicyExhausted))
            .map(ManagedMarket::name)
            .collect()
    }

    /// Clean unless a market ran out of restarts.
    pub fn exit_status(&self) -> ExitStatus {
        if self.exhausted_markets().is_empty() {
            ExitStatus::Clean
        } else {
            ExitStatus::Crash
        }
    }
}

fn spawn_child(descriptor: &MarketDescriptor, settings: &SupervisorSettings) -> io::Result<Child> {
    let argv: Vec<String> = descriptor
        .command
        .iter()
        .map(|token| expand_token(token, &settings.config_dir, &settings.engine_path))
        .collect();
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };

    let cwd = match &descriptor.cwd {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => settings.config_dir.join(dir),
        None => settings.config_dir.clone(),
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .envs(&descriptor.env)
        .env(MARKET_ENV, &descriptor.name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command.spawn()
}

/// Forward child output lines through the launcher log under the market prefix.
fn relay_output<R>(market: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let own_prefix = format!("[{market}] ");
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let text = line.strip_prefix(own_prefix.as_str()).unwrap_or(&line).trim_end();
                    if !text.is_empty() {
                        info!(market = %market, stream, "{text}");
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(market = %market, stream, error = %err, "output relay closed");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn terminate(child: &mut Child, market: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        warn!(market = %market, error = %io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, market: &str) {
    if let Err(err) = child.start_kill() {
        warn!(market = %market, error = %err, "terminate failed");
    }
}
