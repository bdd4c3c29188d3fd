/*
[INPUT]:  YAML engine configuration file
[OUTPUT]: Validated EngineConfig and per-account resolved StrategyParams
[POS]:    Configuration layer - market process setup
[UPDATE]: When adding new configuration options
*/

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use giftsnipe_adapter::PaperFeedConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("duplicate account id: {0}")]
    DuplicateAccount(String),

    #[error("credentials for account {account}: {reason}")]
    Credentials { account: String, reason: String },
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

/// Supported marketplaces. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Portal,
    Tonnel,
    Mrkt,
}

impl MarketKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketKind::Portal => "portal",
            MarketKind::Tonnel => "tonnel",
            MarketKind::Mrkt => "mrkt",
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Simulated venue, no real orders
    #[default]
    Paper,
    Live,
}

/// Top-level configuration for one market process
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub market: MarketKind,
    #[serde(default)]
    pub mode: RunMode,
    /// SQLite ledger file; defaults to the user data directory
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
    #[serde(default)]
    pub fee_rate: Decimal,
    #[serde(default = "default_price_step")]
    pub price_step: Decimal,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    pub strategy: StrategyConfig,
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub paper: Option<PaperFeedConfig>,
    #[serde(default)]
    pub notifications: Option<NotificationConfig>,
}

/// Market-wide action ceiling shared by every account
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_actions")]
    pub max_actions: usize,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_actions: default_max_actions(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Loop timing, retry and shutdown settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_hot_poll_interval_ms")]
    pub hot_poll_interval_ms: u64,
    #[serde(default = "default_hot_cycles")]
    pub hot_cycles: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_submission_timeout_secs")]
    pub submission_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_fill_poll_every_secs")]
    pub fill_poll_every_secs: u64,
    /// Upper bound on listings requested per fetch; unset asks for everything
    #[serde(default)]
    pub search_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            hot_poll_interval_ms: default_hot_poll_interval_ms(),
            hot_cycles: default_hot_cycles(),
            request_timeout_ms: default_request_timeout_ms(),
            submission_timeout_secs: default_submission_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            fill_poll_every_secs: default_fill_poll_every_secs(),
            search_limit: None,
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn hot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hot_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn fill_poll_every(&self) -> Duration {
        Duration::from_secs(self.fill_poll_every_secs)
    }

    /// Exponential backoff for the given retry attempt, clamped to the cap.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(5);
        Duration::from_millis(
            self.retry_base_ms
                .saturating_mul(factor)
                .min(self.retry_cap_ms),
        )
    }
}

/// How a buy target price is derived from a listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PricingConfig {
    /// Take the ask as listed
    Undercut { delta: Decimal },
    /// `min(floor * factor, price - delta)` rounded down to the price step
    FloorRelative { factor: Decimal, delta: Decimal },
}

impl Default for PricingConfig {
    fn default() -> Self {
        PricingConfig::Undercut {
            delta: default_price_step(),
        }
    }
}

impl PricingConfig {
    pub fn delta(&self) -> Decimal {
        match self {
            PricingConfig::Undercut { delta } | PricingConfig::FloorRelative { delta, .. } => *delta,
        }
    }
}

/// Listing of held items at `floor * (1 + markup_pct / 100)`.
///
/// The result is clamped to `[min_sell_price, max_sell_price]`. Without a
/// floor the acquisition price is used as the base.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AutoSellConfig {
    #[serde(default)]
    pub markup_pct: Decimal,
    #[serde(default)]
    pub max_sell_price: Option<Decimal>,
}

/// Market-wide strategy defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub price_ceiling: Decimal,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub tolerance: Decimal,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub min_margin: Option<Decimal>,
    #[serde(default)]
    pub min_sell_price: Option<Decimal>,
    #[serde(default = "default_max_buys_per_cycle")]
    pub max_buys_per_cycle: usize,
    #[serde(default)]
    pub auto_sell: Option<AutoSellConfig>,
}

/// Per-account strategy overrides; unset fields inherit the market default
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyOverrides {
    #[serde(default)]
    pub price_ceiling: Option<Decimal>,
    #[serde(default)]
    pub pricing: Option<PricingConfig>,
    #[serde(default)]
    pub tolerance: Option<Decimal>,
    #[serde(default)]
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub deny: Option<Vec<String>>,
    #[serde(default)]
    pub min_margin: Option<Decimal>,
    #[serde(default)]
    pub min_sell_price: Option<Decimal>,
    #[serde(default)]
    pub max_buys_per_cycle: Option<usize>,
    #[serde(default)]
    pub auto_sell: Option<AutoSellConfig>,
}

/// Account identity and credentials reference
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub id: String,
    /// `env:VAR`, `file:PATH` or a literal value
    #[serde(default)]
    pub credentials: String,
    #[serde(default)]
    pub overrides: StrategyOverrides,
}

impl AccountConfig {
    pub fn resolve_credentials(&self) -> Result<String, ConfigError> {
        let fail = |reason: String| ConfigError::Credentials {
            account: self.id.clone(),
            reason,
        };

        let reference = self.credentials.trim();
        if let Some(var) = reference.strip_prefix("env:") {
            std::env::var(var).map_err(|_| fail(format!("environment variable {var} not set")))
        } else if let Some(path) = reference.strip_prefix("file:") {
            std::fs::read_to_string(path)
                .map(|value| value.trim().to_string())
                .map_err(|err| fail(format!("read {path}: {err}")))
        } else if reference.is_empty() {
            Err(fail("no credentials configured".to_string()))
        } else {
            Ok(reference.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Strategy parameters after overlaying account overrides on market defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyParams {
    pub market: String,
    pub account_id: String,
    pub price_ceiling: Decimal,
    pub pricing: PricingConfig,
    pub tolerance: Decimal,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    pub min_margin: Option<Decimal>,
    pub fee_rate: Decimal,
    pub price_step: Decimal,
    pub min_sell_price: Option<Decimal>,
    pub max_buys_per_cycle: usize,
    pub auto_sell: Option<AutoSellConfig>,
}

impl EngineConfig {
    /// Load and validate configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(invalid("at least one account is required"));
        }
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(invalid("fee_rate must be in [0, 1)"));
        }
        if self.price_step <= Decimal::ZERO {
            return Err(invalid("price_step must be positive"));
        }
        if self.rate_limit.max_actions == 0 || self.rate_limit.window_ms == 0 {
            return Err(invalid("rate_limit.max_actions and window_ms must be positive"));
        }
        if self.runtime.poll_interval_ms == 0 || self.runtime.hot_poll_interval_ms == 0 {
            return Err(invalid("poll intervals must be positive"));
        }
        if self.runtime.request_timeout_ms == 0 {
            return Err(invalid("runtime.request_timeout_ms must be positive"));
        }
        if self.runtime.search_limit == Some(0) {
            return Err(invalid("runtime.search_limit must be positive when set"));
        }
        if self.runtime.retry_base_ms > self.runtime.retry_cap_ms {
            return Err(invalid("runtime.retry_base_ms exceeds retry_cap_ms"));
        }
        if let Some(paper) = &self.paper {
            if paper.floor_price <= Decimal::ZERO {
                return Err(invalid("paper.floor_price must be positive"));
            }
            if paper.sell_fill_pct > 100 {
                return Err(invalid("paper.sell_fill_pct must be within 0..=100"));
            }
        }
        if let Some(url) = self
            .notifications
            .as_ref()
            .and_then(|n| n.webhook_url.as_deref())
        {
            let parsed = url::Url::parse(url)
                .map_err(|err| invalid(format!("notifications.webhook_url: {err}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(invalid(format!(
                    "notifications.webhook_url: unsupported scheme {}",
                    parsed.scheme()
                )));
            }
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(invalid("account id must not be empty"));
            }
            if account.id.contains(':') {
                return Err(invalid(format!(
                    "account id {} must not contain ':'",
                    account.id
                )));
            }
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::DuplicateAccount(account.id.clone()));
            }
            validate_params(&self.strategy_for(account))?;
        }
        Ok(())
    }

    pub fn market_name(&self) -> &'static str {
        self.market.as_str()
    }

    /// Ledger location: configured path or `<data_dir>/giftsnipe/<market>.sqlite3`.
    pub fn resolved_ledger_path(&self) -> PathBuf {
        if let Some(path) = &self.ledger_path {
            return path.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("giftsnipe")
            .join(format!("{}.sqlite3", self.market_name()))
    }

    pub fn strategy_for(&self, account: &AccountConfig) -> StrategyParams {
        let base = &self.strategy;
        let o = &account.overrides;
        StrategyParams {
            market: self.market_name().to_string(),
            account_id: account.id.clone(),
            price_ceiling: o.price_ceiling.unwrap_or(base.price_ceiling),
            pricing: o.pricing.clone().unwrap_or_else(|| base.pricing.clone()),
            tolerance: o.tolerance.unwrap_or(base.tolerance),
            allow: o.allow.clone().unwrap_or_else(|| base.allow.clone()),
            deny: o.deny.clone().unwrap_or_else(|| base.deny.clone()),
            min_margin: o.min_margin.or(base.min_margin),
            fee_rate: self.fee_rate,
            price_step: self.price_step,
            min_sell_price: o.min_sell_price.or(base.min_sell_price),
            max_buys_per_cycle: o.max_buys_per_cycle.unwrap_or(base.max_buys_per_cycle),
            auto_sell: o.auto_sell.clone().or_else(|| base.auto_sell.clone()),
        }
    }
}

fn validate_params(params: &StrategyParams) -> Result<(), ConfigError> {
    let who = &params.account_id;
    if params.price_ceiling <= Decimal::ZERO {
        return Err(invalid(format!("price_ceiling must be positive (account {who})")));
    }
    if params.tolerance < Decimal::ZERO {
        return Err(invalid(format!("tolerance must not be negative (account {who})")));
    }
    match &params.pricing {
        PricingConfig::Undercut { delta } if *delta < Decimal::ZERO => {
            return Err(invalid(format!("pricing.delta must not be negative (account {who})")));
        }
        PricingConfig::FloorRelative { factor, delta } => {
            if *factor <= Decimal::ZERO || *delta < Decimal::ZERO {
                return Err(invalid(format!(
                    "floor_relative pricing needs factor > 0 and delta >= 0 (account {who})"
                )));
            }
        }
        PricingConfig::Undercut { .. } => {}
    }
    if let Some(sell) = &params.auto_sell {
        if sell.markup_pct < Decimal::ZERO {
            return Err(invalid(format!("auto_sell.markup_pct must not be negative (account {who})")));
        }
        if let (Some(min), Some(max)) = (params.min_sell_price, sell.max_sell_price) {
            if min > max {
                return Err(invalid(format!(
                    "min_sell_price exceeds auto_sell.max_sell_price (account {who})"
                )));
            }
        }
    }
    if params.max_buys_per_cycle == 0 {
        return Err(invalid(format!("max_buys_per_cycle must be positive (account {who})")));
    }
    Ok(())
}

fn default_price_step() -> Decimal {
    Decimal::new(1, 2)
}

fn default_max_actions() -> usize {
    10
}

fn default_window_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_hot_poll_interval_ms() -> u64 {
    1_000
}

fn default_hot_cycles() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_submission_timeout_secs() -> u64 {
    120
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_cap_ms() -> u64 {
    5_000
}

fn default_fill_poll_every_secs() -> u64 {
    20
}

fn default_max_buys_per_cycle() -> usize {
    4
}
