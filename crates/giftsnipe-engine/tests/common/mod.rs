/*
[INPUT]:  Engine crate public API, PaperMarket
[OUTPUT]: Shared fixtures for engine integration tests
[POS]:    Integration test layer - common utilities
[UPDATE]: When fixture shapes change
*/

#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use giftsnipe_adapter::{
    Intent, IntentKind, ListingView, LogNotifier, PaperMarket, SharedMarketClient, Side,
};
use giftsnipe_engine::{AccountLoop, EngineConfig, Ledger, PermitPool, SharedContext};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

/// Portal config with ceiling 100, undercut delta 1 and the given accounts.
pub fn config(accounts: &[&str]) -> EngineConfig {
    config_with(accounts, "")
}

/// Same as `config`, with held items listed at a 10% markup over the floor.
pub fn selling_config(accounts: &[&str]) -> EngineConfig {
    config_with(accounts, "  auto_sell:\n    markup_pct: \"10\"\n")
}

fn config_with(accounts: &[&str], strategy_extra: &str) -> EngineConfig {
    let mut yaml = String::from(
        r#"
market: portal
runtime:
  poll_interval_ms: 50
  hot_poll_interval_ms: 20
  shutdown_grace_secs: 1
  max_retries: 1
  retry_base_ms: 10
  retry_cap_ms: 20
strategy:
  price_ceiling: "100"
  pricing:
    mode: undercut
    delta: "1"
"#,
    );
    yaml.push_str(strategy_extra);
    yaml.push_str("accounts:\n");
    for id in accounts {
        yaml.push_str(&format!("  - id: {id}\n"));
    }
    EngineConfig::from_yaml(&yaml).expect("valid config")
}

pub fn account_loop(
    config: &EngineConfig,
    account_id: &str,
    client: SharedMarketClient,
    ledger: &Ledger,
) -> AccountLoop {
    let account = config
        .accounts
        .iter()
        .find(|a| a.id == account_id)
        .expect("account configured");
    AccountLoop::new(
        config.strategy_for(account),
        config.runtime.clone(),
        client,
        SharedContext {
            ledger: ledger.clone(),
            permits: PermitPool::new(100, Duration::from_secs(1)),
            notifier: Arc::new(LogNotifier),
        },
        CancellationToken::new(),
    )
}

pub fn paper_client(market: &PaperMarket) -> SharedMarketClient {
    Arc::new(market.clone())
}

pub fn listing(item: &str, price: &str) -> ListingView {
    ListingView {
        item_id: item.into(),
        collection: "Plush Pepe".into(),
        price: dec(price),
        floor_price: Some(dec("100")),
        seller: "bob".into(),
        observed_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    }
}

pub fn buy_intent(account: &str, item: &str, price: &str) -> Intent {
    Intent {
        kind: IntentKind::Buy,
        target: item.into(),
        item_id: item.into(),
        collection: "Plush Pepe".into(),
        side: Side::Buy,
        price: dec(price),
        account_id: account.into(),
        idempotency_key: Intent::buy_key("portal", account, item, dec(price)),
    }
}
