/*
[INPUT]:  Test fixtures for the marketplace contract
[OUTPUT]: Shared listing/intent builders and mock server helpers
[POS]:    Test infrastructure - shared across integration tests
[UPDATE]: When contract types change shape
*/

//! Common test utilities for giftsnipe-adapter tests

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use giftsnipe_adapter::{Intent, IntentKind, ListingView, Side};
use rust_decimal::Decimal;
use wiremock::MockServer;

/// Setup a mock HTTP server for testing
#[allow(dead_code)]
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

#[allow(dead_code)]
pub fn listing(item: &str, collection: &str, price: &str, seller: &str) -> ListingView {
    ListingView {
        item_id: item.to_string(),
        collection: collection.to_string(),
        price: dec(price),
        floor_price: Some(dec("100")),
        seller: seller.to_string(),
        observed_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    }
}

#[allow(dead_code)]
pub fn intent(kind: IntentKind, target: &str, price: &str, key: &str) -> Intent {
    Intent {
        kind,
        target: target.to_string(),
        item_id: target.to_string(),
        collection: "Plush Pepe".to_string(),
        side: Side::Buy,
        price: dec(price),
        account_id: "acc1".to_string(),
        idempotency_key: key.to_string(),
    }
}
