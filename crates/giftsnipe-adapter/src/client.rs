/*
[INPUT]:  Account ids, listing filters and intents
[OUTPUT]: Async MarketClient contract used by the trading core
[POS]:    Client layer - the only seam between the core and a venue
[UPDATE]: When the venue contract changes
*/

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Fill, Intent, InventoryItem, ListingFilter, ListingView, OpenOrder, SubmissionLookup, SubmissionResult};

/// Marketplace operations the trading core depends on.
///
/// Implementations must not retry internally; the account loop owns retry and
/// rate limiting. The intent's idempotency key is the client reference of every
/// submission so that `lookup_submission` can find it again after a restart.
#[async_trait]
pub trait MarketClient: Send + Sync {
    async fn fetch_listings(&self, filter: &ListingFilter) -> Result<Vec<ListingView>>;

    async fn fetch_open_orders(&self, account_id: &str) -> Result<Vec<OpenOrder>>;

    async fn submit(&self, intent: &Intent) -> Result<SubmissionResult>;

    async fn lookup_submission(&self, account_id: &str, key: &str) -> Result<SubmissionLookup>;

    /// Items the account holds, listed or not.
    async fn fetch_inventory(&self, account_id: &str) -> Result<Vec<InventoryItem>>;

    async fn fetch_fills(&self, account_id: &str) -> Result<Vec<Fill>>;
}

pub type SharedMarketClient = Arc<dyn MarketClient>;
