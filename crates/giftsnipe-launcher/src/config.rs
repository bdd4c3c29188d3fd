/*
[INPUT]:  YAML launcher configuration file
[OUTPUT]: Validated LauncherConfig with one MarketDescriptor per market
[POS]:    Configuration layer - supervised market list
[UPDATE]: When adding launcher settings or descriptor fields
*/

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use giftsnipe_engine::config::NotificationConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::{Backoff, RestartPolicy};

/// Replaced by the path of the engine binary installed next to the launcher.
pub const ENGINE_TOKEN: &str = "${ENGINE}";
/// Replaced by the directory holding the launcher configuration file.
pub const CONFIG_DIR_TOKEN: &str = "${CONFIG_DIR}";

#[derive(Debug, Error)]
pub enum LauncherConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid launcher config: {0}")]
    Invalid(String),

    #[error("duplicate market name: {0}")]
    DuplicateMarket(String),
}

fn default_shutdown_timeout_secs() -> u64 {
    8
}

fn default_liveness_grace_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    400
}

fn default_enabled() -> bool {
    true
}

/// One supervised market process
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MarketDescriptor {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// argv; the first entry is the program
    pub command: Vec<String>,
    /// Working directory, relative paths resolve against the config directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart: RestartPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_liveness_grace_ms")]
    pub liveness_grace_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub notifications: Option<NotificationConfig>,
    pub markets: Vec<MarketDescriptor>,
}

impl LauncherConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LauncherConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| LauncherConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, LauncherConfigError> {
        let config: LauncherConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LauncherConfigError> {
        let invalid = |msg: String| Err(LauncherConfigError::Invalid(msg));

        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be > 0".into());
        }
        if self.markets.is_empty() {
            return invalid("at least one market is required".into());
        }
        if let Some(url) = self
            .notifications
            .as_ref()
            .and_then(|n| n.webhook_url.as_deref())
        {
            match url::Url::parse(url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => {
                    return invalid(format!(
                        "notifications.webhook_url: unsupported scheme {}",
                        parsed.scheme()
                    ));
                }
                Err(err) => return invalid(format!("notifications.webhook_url: {err}")),
            }
        }

        let mut seen = HashSet::new();
        for market in &self.markets {
            if market.name.trim().is_empty() {
                return invalid("market name must not be empty".into());
            }
            if !seen.insert(market.name.as_str()) {
                return Err(LauncherConfigError::DuplicateMarket(market.name.clone()));
            }
            if market.command.first().is_none_or(|program| program.trim().is_empty()) {
                return invalid(format!("market {}: command must not be empty", market.name));
            }
            if market.restart.window_secs == 0 {
                return invalid(format!("market {}: restart.window_secs must be > 0", market.name));
            }
            match &market.restart.backoff {
                Backoff::Exponential { base_ms, cap_ms } if base_ms > cap_ms => {
                    return invalid(format!(
                        "market {}: backoff base_ms must not exceed cap_ms",
                        market.name
                    ));
                }
                Backoff::ScheduleMs(delays) if delays.is_empty() => {
                    return invalid(format!(
                        "market {}: backoff schedule_ms must not be empty",
                        market.name
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn liveness_grace(&self) -> Duration {
        Duration::from_millis(self.liveness_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn enabled_markets(&self) -> impl Iterator<Item = &MarketDescriptor> {
        self.markets.iter().filter(|m| m.enabled)
    }
}

/// Expand the launcher's argv placeholders.
pub fn expand_token(token: &str, config_dir: &Path, engine_path: &Path) -> String {
    if token == ENGINE_TOKEN {
        return engine_path.display().to_string();
    }
    token.replace(CONFIG_DIR_TOKEN, &config_dir.display().to_string())
}

/// The engine binary installed next to the running launcher.
pub fn sibling_engine_path() -> PathBuf {
    let name = format!("giftsnipe-engine{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .unwrap_or_else(|| PathBuf::from(name))
}
