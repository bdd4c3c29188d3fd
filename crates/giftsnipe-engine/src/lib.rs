/*
[INPUT]:  Public API exports for the giftsnipe-engine crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod account;
pub mod config;
pub mod engine;
pub mod exit;
pub mod ledger;
pub mod logging;
pub mod rate_limit;
pub mod strategy;

// Re-export main types for convenience
pub use account::{AccountError, AccountLoop, SharedContext};
pub use config::{AccountConfig, ConfigError, EngineConfig, MarketKind, RunMode, StrategyParams};
pub use engine::{AccountOutcome, Engine, EngineReport};
pub use exit::ExitStatus;
pub use ledger::{Ledger, LedgerError, PnLSnapshot, TradeRecord, TradeStatus};
pub use rate_limit::PermitPool;
