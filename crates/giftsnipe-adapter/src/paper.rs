/*
[INPUT]:  Seeded listing feed settings, test fixtures, intents from the account loop
[OUTPUT]: PaperMarket - in-process MarketClient simulating a venue
[POS]:    Client layer - dry-run venue and test double
[UPDATE]: When venue semantics the core relies on change
*/

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tracing::debug;

use crate::client::MarketClient;
use crate::error::{MarketError, Result};
use crate::types::{
    Fill, Intent, IntentKind, InventoryItem, ListingFilter, ListingView, OpenOrder, Side,
    SubmissionLookup, SubmissionResult,
};

const MAX_FEED_LISTINGS: usize = 64;
const PAPER_SELLER: &str = "paper-seller";

/// Random listing feed used in paper mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaperFeedConfig {
    pub collections: Vec<String>,
    pub floor_price: Decimal,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_listings_per_fetch")]
    pub listings_per_fetch: usize,
    /// Chance in percent that a resting sell order is bought on each fetch
    #[serde(default)]
    pub sell_fill_pct: u32,
}

fn default_seed() -> u64 {
    7
}

fn default_listings_per_fetch() -> usize {
    2
}

#[derive(Debug, Clone)]
struct PaperOrder {
    account_id: String,
    order: OpenOrder,
}

struct Feed {
    config: PaperFeedConfig,
    rng: StdRng,
}

#[derive(Default)]
struct PaperState {
    listings: BTreeMap<String, ListingView>,
    orders: BTreeMap<String, PaperOrder>,
    submissions: BTreeMap<String, SubmissionResult>,
    fills: BTreeMap<String, Vec<Fill>>,
    inventory: BTreeMap<String, BTreeMap<String, InventoryItem>>,
    failures: VecDeque<MarketError>,
    revoked: BTreeSet<String>,
    feed: Option<Feed>,
    next_id: u64,
    executed_submissions: usize,
}

impl PaperState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn check(&mut self, account_id: Option<&str>) -> Result<()> {
        if let Some(err) = self.failures.pop_front() {
            return Err(err);
        }
        if let Some(account) = account_id {
            if self.revoked.contains(account) {
                return Err(MarketError::Unauthorized(format!(
                    "session for {account} revoked"
                )));
            }
        }
        Ok(())
    }

    fn generate_listings(&mut self) {
        let Some(feed) = self.feed.as_mut() else {
            return;
        };
        if feed.config.collections.is_empty() {
            return;
        }

        let mut generated = Vec::with_capacity(feed.config.listings_per_fetch);
        for _ in 0..feed.config.listings_per_fetch {
            let idx = feed.rng.gen_range(0..feed.config.collections.len());
            let collection = feed.config.collections[idx].clone();
            let bps: i64 = feed.rng.gen_range(8_000..=12_000);
            let price = (feed.config.floor_price * Decimal::new(bps, 4)).round_dp(2);
            generated.push((collection, price, feed.config.floor_price));
        }

        for (collection, price, floor) in generated {
            let item_id = self.next_id("paper-item");
            self.listings.insert(
                item_id.clone(),
                ListingView {
                    item_id,
                    collection,
                    price,
                    floor_price: Some(floor),
                    seller: PAPER_SELLER.to_string(),
                    observed_at: Utc::now(),
                },
            );
        }

        while self.listings.len() > MAX_FEED_LISTINGS {
            let Some(oldest) = self
                .listings
                .values()
                .min_by(|a, b| a.observed_at.cmp(&b.observed_at).then(a.item_id.cmp(&b.item_id)))
                .map(|l| l.item_id.clone())
            else {
                break;
            };
            self.listings.remove(&oldest);
        }
    }

    /// Resting sell orders find a buyer at random.
    fn simulate_sales(&mut self) {
        let Some(pct) = self.feed.as_ref().map(|feed| feed.config.sell_fill_pct) else {
            return;
        };
        if pct == 0 {
            return;
        }
        let asks: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, entry)| entry.order.side == Side::Sell)
            .map(|(id, _)| id.clone())
            .collect();
        for order_id in asks {
            let roll = match self.feed.as_mut() {
                Some(feed) => feed.rng.gen_range(0..100u32),
                None => return,
            };
            if roll < pct {
                self.fill_order(&order_id, Decimal::ZERO);
            }
        }
    }

    fn fill_order(&mut self, order_id: &str, fee: Decimal) -> Option<Fill> {
        let entry = self.orders.remove(order_id)?;
        let fill = Fill {
            fill_id: self.next_id("paper-fill"),
            item_id: entry.order.item_id.clone(),
            collection: entry.order.collection.clone(),
            side: entry.order.side,
            price: entry.order.price,
            fee,
            filled_at: Utc::now(),
        };
        let held = self.inventory.entry(entry.account_id.clone()).or_default();
        match fill.side {
            Side::Sell => {
                held.remove(&fill.item_id);
            }
            Side::Buy => {
                held.insert(
                    fill.item_id.clone(),
                    InventoryItem {
                        item_id: fill.item_id.clone(),
                        collection: fill.collection.clone(),
                        floor_price: None,
                        acquired_price: Some(fill.price),
                        listed: false,
                    },
                );
            }
        }
        self.fills
            .entry(entry.account_id)
            .or_default()
            .push(fill.clone());
        Some(fill)
    }

    fn is_listed(&self, account_id: &str, item_id: &str) -> bool {
        self.orders.values().any(|entry| {
            entry.account_id == account_id
                && entry.order.side == Side::Sell
                && entry.order.item_id == item_id
        })
    }

    fn place_order(&mut self, account_id: &str, item_id: &str, collection: &str, side: Side, price: Decimal) -> String {
        let order_id = self.next_id("paper-order");
        self.orders.insert(
            order_id.clone(),
            PaperOrder {
                account_id: account_id.to_string(),
                order: OpenOrder {
                    order_id: order_id.clone(),
                    item_id: item_id.to_string(),
                    collection: collection.to_string(),
                    side,
                    price,
                    best_competing: None,
                },
            },
        );
        order_id
    }

    fn execute(&mut self, intent: &Intent) -> SubmissionResult {
        match intent.kind {
            IntentKind::Buy => {
                let Some(listing) = self.listings.get(&intent.target) else {
                    return SubmissionResult::rejected("listing no longer available");
                };
                if intent.price < listing.price {
                    return SubmissionResult::rejected(format!(
                        "price {} below ask {}",
                        intent.price, listing.price
                    ));
                }
                let bought = InventoryItem {
                    item_id: listing.item_id.clone(),
                    collection: listing.collection.clone(),
                    floor_price: listing.floor_price,
                    acquired_price: Some(intent.price),
                    listed: false,
                };
                self.listings.remove(&intent.target);
                self.inventory
                    .entry(intent.account_id.clone())
                    .or_default()
                    .insert(bought.item_id.clone(), bought);
                SubmissionResult::accepted(self.next_id("paper-buy"), Decimal::ZERO)
            }
            IntentKind::List => {
                let Some(item) = self
                    .inventory
                    .get(&intent.account_id)
                    .and_then(|held| held.get(&intent.target))
                    .cloned()
                else {
                    return SubmissionResult::rejected("item not in inventory");
                };
                if intent.price <= Decimal::ZERO {
                    return SubmissionResult::rejected("price must be positive");
                }
                if self.is_listed(&intent.account_id, &item.item_id) {
                    return SubmissionResult::rejected("item already listed");
                }
                let order_id = self.place_order(
                    &intent.account_id,
                    &item.item_id,
                    &item.collection,
                    Side::Sell,
                    intent.price,
                );
                SubmissionResult::accepted(order_id, Decimal::ZERO)
            }
            IntentKind::Cancel => match self.orders.get(&intent.target) {
                Some(entry) if entry.account_id == intent.account_id => {
                    self.orders.remove(&intent.target);
                    SubmissionResult::accepted(intent.target.clone(), Decimal::ZERO)
                }
                _ => SubmissionResult::rejected("unknown order"),
            },
            IntentKind::Reprice => match self.orders.get_mut(&intent.target) {
                Some(entry) if entry.account_id == intent.account_id => {
                    entry.order.price = intent.price;
                    SubmissionResult::accepted(intent.target.clone(), Decimal::ZERO)
                }
                _ => SubmissionResult::rejected("unknown order"),
            },
        }
    }
}

/// In-memory venue. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct PaperMarket {
    state: Arc<TokioMutex<PaperState>>,
}

impl PaperMarket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Venue that produces fresh listings on every fetch.
    pub fn with_feed(config: PaperFeedConfig) -> Self {
        let state = PaperState {
            feed: Some(Feed {
                rng: StdRng::seed_from_u64(config.seed),
                config,
            }),
            ..PaperState::default()
        };
        Self {
            state: Arc::new(TokioMutex::new(state)),
        }
    }

    pub async fn add_listing(&self, listing: ListingView) {
        let mut state = self.state.lock().await;
        state.listings.insert(listing.item_id.clone(), listing);
    }

    /// Places an order for `account_id` and returns its order id.
    pub async fn add_order(
        &self,
        account_id: &str,
        item_id: &str,
        collection: &str,
        side: Side,
        price: Decimal,
    ) -> String {
        let mut state = self.state.lock().await;
        state.place_order(account_id, item_id, collection, side, price)
    }

    /// Gives `account_id` an item without going through a buy.
    pub async fn add_inventory(&self, account_id: &str, item: InventoryItem) {
        self.state
            .lock()
            .await
            .inventory
            .entry(account_id.to_string())
            .or_default()
            .insert(item.item_id.clone(), item);
    }

    pub async fn set_best_competing(&self, order_id: &str, price: Option<Decimal>) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.orders.get_mut(order_id) {
            entry.order.best_competing = price;
        }
    }

    /// Executes a resting order and reports it as a fill.
    pub async fn fill_order(&self, order_id: &str, fee: Decimal) -> Option<Fill> {
        self.state.lock().await.fill_order(order_id, fee)
    }

    /// The next client call fails with `err`.
    pub async fn inject_failure(&self, err: MarketError) {
        self.state.lock().await.failures.push_back(err);
    }

    pub async fn revoke(&self, account_id: &str) {
        self.state.lock().await.revoked.insert(account_id.to_string());
    }

    /// Pretends the venue already processed a submission under `key`.
    pub async fn record_submission(&self, key: &str, result: SubmissionResult) {
        self.state
            .lock()
            .await
            .submissions
            .insert(key.to_string(), result);
    }

    /// Number of submissions actually executed (duplicates excluded).
    pub async fn executed_submissions(&self) -> usize {
        self.state.lock().await.executed_submissions
    }

    pub async fn listing_count(&self) -> usize {
        self.state.lock().await.listings.len()
    }
}

#[async_trait]
impl MarketClient for PaperMarket {
    async fn fetch_listings(&self, filter: &ListingFilter) -> Result<Vec<ListingView>> {
        let mut state = self.state.lock().await;
        state.check(None)?;
        state.generate_listings();
        state.simulate_sales();

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(state
            .listings
            .values()
            .filter(|listing| filter.matches(&listing.collection))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_open_orders(&self, account_id: &str) -> Result<Vec<OpenOrder>> {
        let mut state = self.state.lock().await;
        state.check(Some(account_id))?;
        Ok(state
            .orders
            .values()
            .filter(|entry| entry.account_id == account_id)
            .map(|entry| entry.order.clone())
            .collect())
    }

    async fn submit(&self, intent: &Intent) -> Result<SubmissionResult> {
        let mut state = self.state.lock().await;
        state.check(Some(&intent.account_id))?;

        if let Some(previous) = state.submissions.get(&intent.idempotency_key) {
            debug!(key = %intent.idempotency_key, "paper market: duplicate submission");
            return Ok(previous.clone());
        }

        let result = state.execute(intent);
        state.executed_submissions += 1;
        state
            .submissions
            .insert(intent.idempotency_key.clone(), result.clone());
        debug!(
            key = %intent.idempotency_key,
            accepted = result.accepted,
            "paper market: submission executed"
        );
        Ok(result)
    }

    async fn lookup_submission(&self, account_id: &str, key: &str) -> Result<SubmissionLookup> {
        let mut state = self.state.lock().await;
        state.check(Some(account_id))?;
        Ok(match state.submissions.get(key) {
            Some(result) => SubmissionLookup::Found(result.clone()),
            None => SubmissionLookup::Unknown,
        })
    }

    async fn fetch_inventory(&self, account_id: &str) -> Result<Vec<InventoryItem>> {
        let mut state = self.state.lock().await;
        state.check(Some(account_id))?;
        let Some(held) = state.inventory.get(account_id) else {
            return Ok(Vec::new());
        };
        Ok(held
            .values()
            .map(|item| InventoryItem {
                listed: state.is_listed(account_id, &item.item_id),
                ..item.clone()
            })
            .collect())
    }

    async fn fetch_fills(&self, account_id: &str) -> Result<Vec<Fill>> {
        let mut state = self.state.lock().await;
        state.check(Some(account_id))?;
        Ok(state.fills.get(account_id).cloned().unwrap_or_default())
    }
}
