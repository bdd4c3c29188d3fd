/*
[INPUT]:  Marketplace observations and trading decisions
[OUTPUT]: Strongly-typed models exchanged with a MarketClient
[POS]:    Data layer - contract models
[UPDATE]: When the client contract gains or changes a field
*/

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{IntentKind, Side};

/// A single item currently offered for sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingView {
    pub item_id: String,
    pub collection: String,
    pub price: Decimal,
    #[serde(default)]
    pub floor_price: Option<Decimal>,
    pub seller: String,
    pub observed_at: DateTime<Utc>,
}

/// An order owned by the account.
///
/// `Buy` is a standing offer on an item, `Sell` is one of the account's own
/// listings. `best_competing` is whatever the venue reports as the best
/// opposing quote on the same side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub item_id: String,
    pub collection: String,
    pub side: Side,
    pub price: Decimal,
    #[serde(default)]
    pub best_competing: Option<Decimal>,
}

/// A decision to act, produced by the strategy and consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    /// Item id for buys and listings, order id for cancels and reprices.
    pub target: String,
    pub item_id: String,
    pub collection: String,
    pub side: Side,
    pub price: Decimal,
    pub account_id: String,
    pub idempotency_key: String,
}

impl Intent {
    /// The price is part of the key, so a relisted item at a new ask is a new attempt.
    pub fn buy_key(market: &str, account: &str, item_id: &str, price: Decimal) -> String {
        format!("{market}:{account}:buy:{item_id}:{}", price.normalize())
    }

    pub fn list_key(market: &str, account: &str, item_id: &str, price: Decimal) -> String {
        format!("{market}:{account}:list:{item_id}:{}", price.normalize())
    }

    pub fn cancel_key(market: &str, account: &str, order_id: &str) -> String {
        format!("{market}:{account}:cancel:{order_id}")
    }

    pub fn reprice_key(market: &str, account: &str, order_id: &str, price: Decimal) -> String {
        format!("{market}:{account}:reprice:{order_id}:{}", price.normalize())
    }

    pub fn fill_key(market: &str, account: &str, fill_id: &str) -> String {
        format!("{market}:{account}:fill:{fill_id}")
    }
}

/// An item held by the account.
///
/// `listed` is true while one of the account's sell orders covers the item.
/// `acquired_price` is the venue's view of what the account paid, if known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub item_id: String,
    pub collection: String,
    #[serde(default)]
    pub floor_price: Option<Decimal>,
    #[serde(default)]
    pub acquired_price: Option<Decimal>,
    #[serde(default)]
    pub listed: bool,
}

/// Venue answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub accepted: bool,
    #[serde(default)]
    pub external_order_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub fee: Decimal,
}

impl SubmissionResult {
    pub fn accepted(external_order_id: impl Into<String>, fee: Decimal) -> Self {
        Self {
            accepted: true,
            external_order_id: Some(external_order_id.into()),
            reason: None,
            fee,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            external_order_id: None,
            reason: Some(reason.into()),
            fee: Decimal::ZERO,
        }
    }
}

/// Result of asking the venue about an earlier submission by client key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionLookup {
    Found(SubmissionResult),
    Unknown,
}

/// A completed sale of one of the account's items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    pub item_id: String,
    pub collection: String,
    pub side: Side,
    pub price: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFilter {
    /// Empty means every collection.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListingFilter {
    pub fn matches(&self, collection: &str) -> bool {
        self.collections.is_empty()
            || self
                .collections
                .iter()
                .any(|c| c.eq_ignore_ascii_case(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    #[test]
    fn reprice_key_normalizes_price() {
        let key = Intent::reprice_key("portal", "acc1", "o-7", dec("96.50"));
        assert_eq!(key, "portal:acc1:reprice:o-7:96.5");
    }

    #[test]
    fn buy_key_carries_price() {
        let key = Intent::buy_key("portal", "acc1", "g-1", dec("95.00"));
        assert_eq!(key, "portal:acc1:buy:g-1:95");
        assert_ne!(key, Intent::buy_key("portal", "acc1", "g-1", dec("80")));
    }

    #[test]
    fn listing_deserializes_decimal_strings() {
        let json = r#"{
            "item_id": "g-1",
            "collection": "Plush Pepe",
            "price": "95.00",
            "seller": "bob",
            "observed_at": "2026-01-01T00:00:00Z"
        }"#;
        let listing: ListingView = serde_json::from_str(json).unwrap();
        assert_eq!(listing.price, dec("95"));
        assert!(listing.floor_price.is_none());
    }

    #[test]
    fn filter_matches_case_insensitively() {
        let filter = ListingFilter {
            collections: vec!["plush pepe".to_string()],
            limit: None,
        };
        assert!(filter.matches("Plush Pepe"));
        assert!(!filter.matches("Durov Cap"));
        assert!(ListingFilter::default().matches("anything"));
    }

    #[test]
    fn rejected_result_carries_reason() {
        let result = SubmissionResult::rejected("price moved");
        assert!(!result.accepted);
        assert_eq!(result.reason.as_deref(), Some("price moved"));
    }
}
