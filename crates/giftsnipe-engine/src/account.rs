/*
[INPUT]:  StrategyParams + RuntimeConfig per account, shared MarketClient/Ledger/PermitPool, CancellationToken
[OUTPUT]: Per-account polling loop: reconcile -> fetch -> evaluate -> submit -> record -> sleep
[POS]:    Execution layer - one tokio task per account
[UPDATE]: When changing retry, idempotency or reconciliation guarantees
*/

use std::future::Future;

use chrono::Utc;
use giftsnipe_adapter::{
    Intent, ListingFilter, MarketError, NotificationEvent, SharedMarketClient, SharedNotifier,
    SubmissionLookup, SubmissionResult,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RuntimeConfig, StrategyParams};
use crate::ledger::{Ledger, LedgerError, LedgerResult, TradeAttempt, TradeOutcome, TradeRecord, TradeStatus};
use crate::rate_limit::PermitPool;
use crate::strategy;

const SUBMISSION_TIMEOUT_REASON: &str = "not found after submission timeout";

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account loop cancelled")]
    Cancelled,

    #[error("authorization failed: {0}")]
    Unauthorized(MarketError),

    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("ledger task failed: {0}")]
    Blocking(String),
}

/// State shared by every account loop of one market.
#[derive(Clone)]
pub struct SharedContext {
    pub ledger: Ledger,
    pub permits: PermitPool,
    pub notifier: SharedNotifier,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub intents: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub confirmed: usize,
    pub failed: usize,
    pub still_pending: usize,
}

impl ReconcileReport {
    fn count(&mut self, status: TradeStatus) {
        match status {
            TradeStatus::Confirmed => self.confirmed += 1,
            TradeStatus::Failed => self.failed += 1,
            TradeStatus::Pending => self.still_pending += 1,
        }
    }
}

/// Trading loop of a single account.
pub struct AccountLoop {
    params: StrategyParams,
    runtime: RuntimeConfig,
    filter: ListingFilter,
    client: SharedMarketClient,
    shared: SharedContext,
    shutdown: CancellationToken,
}

impl AccountLoop {
    pub fn new(
        params: StrategyParams,
        runtime: RuntimeConfig,
        client: SharedMarketClient,
        shared: SharedContext,
        shutdown: CancellationToken,
    ) -> Self {
        let filter = ListingFilter {
            collections: params.allow.clone(),
            limit: runtime.search_limit,
        };
        Self {
            params,
            runtime,
            filter,
            client,
            shared,
            shutdown,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.params.account_id
    }

    pub fn spawn(self) -> JoinHandle<Result<(), AccountError>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run until cancelled. Returns an error only when the account must halt.
    pub async fn run(self) -> Result<(), AccountError> {
        info!(
            market = %self.params.market,
            account = %self.params.account_id,
            "account loop starting"
        );

        match self.run_inner().await {
            Ok(()) | Err(AccountError::Cancelled) => {
                info!(
                    market = %self.params.market,
                    account = %self.params.account_id,
                    "account loop stopped"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    market = %self.params.market,
                    account = %self.params.account_id,
                    error = %err,
                    "account loop halted"
                );
                self.notify(NotificationEvent::AccountHalted {
                    market: self.params.market.clone(),
                    account: self.params.account_id.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_inner(&self) -> Result<(), AccountError> {
        let reconciled = self.reconcile_pending().await?;
        if reconciled != ReconcileReport::default() {
            info!(
                market = %self.params.market,
                account = %self.params.account_id,
                confirmed = reconciled.confirmed,
                failed = reconciled.failed,
                still_pending = reconciled.still_pending,
                "startup reconciliation finished"
            );
        }

        let mut hot_remaining = 0u32;
        let mut next_fill_poll = Instant::now();
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            if Instant::now() >= next_fill_poll {
                self.ingest_fills().await?;
                self.reconcile_pending().await?;
                next_fill_poll = Instant::now() + self.runtime.fill_poll_every();
            }

            let report = self.run_cycle().await?;
            if report.intents > 0 {
                hot_remaining = self.runtime.hot_cycles;
            }
            let delay = if hot_remaining > 0 {
                hot_remaining -= 1;
                self.runtime.hot_poll_interval()
            } else {
                self.runtime.poll_interval()
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Resolve every Pending record of this account before trading.
    pub async fn reconcile_pending(&self) -> Result<ReconcileReport, AccountError> {
        let account = self.params.account_id.clone();
        let pending = self.with_ledger(move |ledger| ledger.pending(&account)).await?;

        let mut report = ReconcileReport::default();
        for record in pending {
            let status = self.reconcile_record(&record).await?;
            report.count(status);
        }
        Ok(report)
    }

    /// One fetch/evaluate/submit pass.
    pub async fn run_cycle(&self) -> Result<CycleReport, AccountError> {
        let client = &self.client;
        let filter = &self.filter;
        let account = self.params.account_id.as_str();

        let Ok(listings) = self
            .call("fetch_listings", || client.fetch_listings(filter))
            .await?
        else {
            return Ok(CycleReport::default());
        };
        let Ok(orders) = self
            .call("fetch_open_orders", || client.fetch_open_orders(account))
            .await?
        else {
            return Ok(CycleReport::default());
        };

        let inventory = if self.params.auto_sell.is_some() {
            match self
                .call("fetch_inventory", || client.fetch_inventory(account))
                .await?
            {
                Ok(inventory) => inventory,
                Err(_) => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let intents = strategy::evaluate(&listings, &orders, &inventory, &self.params);
        let mut report = CycleReport {
            intents: intents.len(),
            ..CycleReport::default()
        };
        if !intents.is_empty() {
            debug!(
                market = %self.params.market,
                account = %self.params.account_id,
                listings = listings.len(),
                orders = orders.len(),
                intents = intents.len(),
                "strategy produced intents"
            );
        }

        for intent in &intents {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.execute_intent(intent).await? {
                TradeStatus::Confirmed => report.confirmed += 1,
                TradeStatus::Failed => report.failed += 1,
                TradeStatus::Pending => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Submit one intent at most once per idempotency key.
    ///
    /// Returns the status the intent's key ended up in during this call;
    /// `Pending` means the intent was skipped or its outcome is not known yet.
    /// A submission whose retries ran out on a transient error is looked up
    /// before anything is concluded, since the venue may have executed it.
    pub async fn execute_intent(&self, intent: &Intent) -> Result<TradeStatus, AccountError> {
        let key = intent.idempotency_key.clone();
        let existing = {
            let key = key.clone();
            self.with_ledger(move |ledger| ledger.get(&key)).await?
        };

        match existing {
            Some(record) if record.status == TradeStatus::Pending => {
                let status = self.reconcile_record(&record).await?;
                debug!(
                    market = %self.params.market,
                    account = %self.params.account_id,
                    key = %key,
                    status = %status,
                    "earlier submission reconciled, intent skipped"
                );
                return Ok(TradeStatus::Pending);
            }
            Some(record) => {
                debug!(
                    market = %self.params.market,
                    account = %self.params.account_id,
                    key = %key,
                    status = %record.status,
                    "intent already resolved, skipping"
                );
                return Ok(TradeStatus::Pending);
            }
            None => {}
        }

        let attempt = TradeAttempt::from_intent(&self.params.market, intent, Utc::now());
        let record = self.with_ledger(move |ledger| ledger.record(&attempt)).await?;
        if record.status != TradeStatus::Pending {
            return Ok(TradeStatus::Pending);
        }

        info!(
            market = %self.params.market,
            account = %self.params.account_id,
            key = %key,
            kind = %intent.kind,
            item = %intent.item_id,
            price = %intent.price,
            "submitting intent"
        );

        let client = &self.client;
        match self.call("submit", || client.submit(intent)).await? {
            Ok(result) => self.apply_result(&record, result).await,
            // the venue may have executed it; only a lookup can tell
            Err(err) if err.is_retryable() => {
                warn!(
                    market = %self.params.market,
                    account = %self.params.account_id,
                    key = %key,
                    error = %err,
                    "submission outcome unknown, looking it up"
                );
                self.reconcile_record(&record).await
            }
            Err(err) => {
                self.mark_failed(&record, format!("submission failed: {err}"))
                    .await
            }
        }
    }

    /// Ask the venue about a Pending record and settle it when possible.
    async fn reconcile_record(&self, record: &TradeRecord) -> Result<TradeStatus, AccountError> {
        let client = &self.client;
        let account = self.params.account_id.as_str();
        let key = record.key.as_str();

        match self
            .call("lookup_submission", || client.lookup_submission(account, key))
            .await?
        {
            Ok(SubmissionLookup::Found(result)) => self.apply_result(record, result).await,
            Ok(SubmissionLookup::Unknown) => {
                let expired = (Utc::now() - record.created_at)
                    .to_std()
                    .map(|age| age > self.runtime.submission_timeout())
                    .unwrap_or(false);
                if expired {
                    self.mark_failed(record, SUBMISSION_TIMEOUT_REASON.to_string())
                        .await
                } else {
                    Ok(TradeStatus::Pending)
                }
            }
            Err(_) => Ok(TradeStatus::Pending),
        }
    }

    async fn apply_result(
        &self,
        record: &TradeRecord,
        result: SubmissionResult,
    ) -> Result<TradeStatus, AccountError> {
        if !result.accepted {
            let reason = result.reason.unwrap_or_else(|| "rejected".to_string());
            return self.mark_failed(record, reason).await;
        }

        let outcome = TradeOutcome {
            external_order_id: result.external_order_id,
            fee: result.fee,
        };
        let key = record.key.clone();
        let confirmed = self
            .with_ledger(move |ledger| ledger.confirm(&key, &outcome))
            .await?;

        info!(
            market = %self.params.market,
            account = %self.params.account_id,
            key = %confirmed.key,
            external_order_id = confirmed.external_order_id.as_deref().unwrap_or("-"),
            "trade confirmed"
        );
        self.notify(NotificationEvent::TradeConfirmed {
            market: self.params.market.clone(),
            account: self.params.account_id.clone(),
            key: confirmed.key.clone(),
            action: confirmed.action.as_str().to_string(),
            item_id: confirmed.item_id.clone(),
            price: confirmed.price,
        });
        Ok(TradeStatus::Confirmed)
    }

    async fn mark_failed(&self, record: &TradeRecord, reason: String) -> Result<TradeStatus, AccountError> {
        let key = record.key.clone();
        let stored_reason = reason.clone();
        self.with_ledger(move |ledger| ledger.fail(&key, &stored_reason))
            .await?;

        warn!(
            market = %self.params.market,
            account = %self.params.account_id,
            key = %record.key,
            reason = %reason,
            "trade failed"
        );
        self.notify(NotificationEvent::TradeFailed {
            market: self.params.market.clone(),
            account: self.params.account_id.clone(),
            key: record.key.clone(),
            reason,
        });
        Ok(TradeStatus::Failed)
    }

    /// Record fills reported by the venue. Returns how many were new.
    pub async fn ingest_fills(&self) -> Result<usize, AccountError> {
        let client = &self.client;
        let account = self.params.account_id.as_str();
        let Ok(fills) = self
            .call("fetch_fills", || client.fetch_fills(account))
            .await?
        else {
            return Ok(0);
        };

        let mut recorded = 0;
        for fill in fills {
            let market = self.params.market.clone();
            let account_id = self.params.account_id.clone();
            let stored = fill.clone();
            let is_new = self
                .with_ledger(move |ledger| ledger.record_fill(&market, &account_id, &stored))
                .await?;
            if !is_new {
                continue;
            }
            recorded += 1;
            info!(
                market = %self.params.market,
                account = %self.params.account_id,
                fill_id = %fill.fill_id,
                item = %fill.item_id,
                price = %fill.price,
                fee = %fill.fee,
                "fill recorded"
            );
            self.notify(NotificationEvent::FillRecorded {
                market: self.params.market.clone(),
                account: self.params.account_id.clone(),
                item_id: fill.item_id,
                price: fill.price,
                fee: fill.fee,
            });
        }
        Ok(recorded)
    }

    /// Run one client call under the permit pool, request timeout and bounded retry.
    ///
    /// Outer error: the loop must stop (cancelled or unauthorized).
    /// Inner error: the step failed and should be skipped.
    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        mut request: F,
    ) -> Result<Result<T, MarketError>, AccountError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = giftsnipe_adapter::Result<T>>,
    {
        let timeout = self.runtime.request_timeout();
        let mut attempt = 0u32;
        loop {
            self.shared
                .permits
                .acquire(&self.shutdown)
                .await
                .map_err(|_| AccountError::Cancelled)?;

            let result = match tokio::time::timeout(timeout, request()).await {
                Ok(result) => result,
                Err(_) => Err(MarketError::Timeout {
                    after_ms: self.runtime.request_timeout_ms,
                }),
            };

            let err = match result {
                Ok(value) => return Ok(Ok(value)),
                Err(err) if err.is_auth_error() => return Err(AccountError::Unauthorized(err)),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.runtime.max_retries {
                warn!(
                    market = %self.params.market,
                    account = %self.params.account_id,
                    op,
                    attempts = attempt + 1,
                    error = %err,
                    "market call failed"
                );
                return Ok(Err(err));
            }

            let delay = self
                .runtime
                .retry_delay(attempt)
                .max(err.retry_delay().unwrap_or_default());
            debug!(
                market = %self.params.market,
                account = %self.params.account_id,
                op,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient market error, retrying"
            );
            attempt += 1;
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(AccountError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn with_ledger<T, F>(&self, f: F) -> Result<T, AccountError>
    where
        F: FnOnce(&Ledger) -> LedgerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = self.shared.ledger.clone();
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|err| AccountError::Blocking(err.to_string()))?
            .map_err(AccountError::from)
    }

    fn notify(&self, event: NotificationEvent) {
        self.shared.notifier.notify(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use async_trait::async_trait;
    use giftsnipe_adapter::{
        Fill, IntentKind, InventoryItem, ListingView, LogNotifier, MarketClient, OpenOrder,
        PaperMarket, Side,
    };
    use crate::config::AutoSellConfig;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn params() -> StrategyParams {
        StrategyParams {
            market: "portal".into(),
            account_id: "acc1".into(),
            price_ceiling: dec("100"),
            pricing: PricingConfig::Undercut { delta: dec("1") },
            tolerance: Decimal::ZERO,
            allow: Vec::new(),
            deny: Vec::new(),
            min_margin: None,
            fee_rate: Decimal::ZERO,
            price_step: dec("0.01"),
            min_sell_price: None,
            max_buys_per_cycle: 4,
            auto_sell: None,
        }
    }

    fn runtime() -> RuntimeConfig {
        RuntimeConfig {
            max_retries: 2,
            retry_base_ms: 10,
            retry_cap_ms: 40,
            submission_timeout_secs: 60,
            ..RuntimeConfig::default()
        }
    }

    fn build(market: &PaperMarket, ledger: &Ledger) -> AccountLoop {
        build_with(params(), Arc::new(market.clone()), ledger)
    }

    fn build_with(params: StrategyParams, client: SharedMarketClient, ledger: &Ledger) -> AccountLoop {
        AccountLoop::new(
            params,
            runtime(),
            client,
            SharedContext {
                ledger: ledger.clone(),
                permits: PermitPool::new(100, Duration::from_secs(1)),
                notifier: Arc::new(LogNotifier),
            },
            CancellationToken::new(),
        )
    }

    fn listing(item: &str, price: &str) -> ListingView {
        ListingView {
            item_id: item.into(),
            collection: "Plush Pepe".into(),
            price: dec(price),
            floor_price: Some(dec("100")),
            seller: "bob".into(),
            observed_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn buy_intent(item: &str, price: &str) -> Intent {
        Intent {
            kind: IntentKind::Buy,
            target: item.into(),
            item_id: item.into(),
            collection: "Plush Pepe".into(),
            side: Side::Buy,
            price: dec(price),
            account_id: "acc1".into(),
            idempotency_key: Intent::buy_key("portal", "acc1", item, dec(price)),
        }
    }

    #[tokio::test]
    async fn cycle_buys_and_confirms() {
        let market = PaperMarket::new();
        market.add_listing(listing("g-1", "95")).await;
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        let report = account.run_cycle().await.unwrap();
        assert_eq!(report.intents, 1);
        assert_eq!(report.confirmed, 1);

        let record = ledger.get("portal:acc1:buy:g-1:95").unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Confirmed);
        assert_eq!(record.price, dec("95"));
    }

    #[tokio::test]
    async fn same_intent_twice_submits_once() {
        let market = PaperMarket::new();
        market.add_listing(listing("g-1", "95")).await;
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        let intent = buy_intent("g-1", "95");
        assert_eq!(account.execute_intent(&intent).await.unwrap(), TradeStatus::Confirmed);
        assert_eq!(account.execute_intent(&intent).await.unwrap(), TradeStatus::Pending);
        assert_eq!(market.executed_submissions().await, 1);
    }

    #[tokio::test]
    async fn failed_key_is_terminal() {
        let market = PaperMarket::new();
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        let intent = buy_intent("gone", "95");
        assert_eq!(account.execute_intent(&intent).await.unwrap(), TradeStatus::Failed);

        market.add_listing(listing("gone", "95")).await;
        assert_eq!(account.execute_intent(&intent).await.unwrap(), TradeStatus::Pending);
        assert_eq!(market.executed_submissions().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let market = PaperMarket::new();
        market.add_listing(listing("g-1", "95")).await;
        market.inject_failure(MarketError::Timeout { after_ms: 5 }).await;
        market
            .inject_failure(MarketError::Network("reset".into()))
            .await;
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        let report = account.run_cycle().await.unwrap();
        assert_eq!(report.confirmed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_submission_pending() {
        let market = PaperMarket::new();
        market.add_listing(listing("g-1", "95")).await;
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        for _ in 0..3 {
            market
                .inject_failure(MarketError::Unavailable {
                    status: 503,
                    message: "down".into(),
                })
                .await;
        }
        let intent = buy_intent("g-1", "95");
        let status = account.execute_intent(&intent).await.unwrap();
        assert_eq!(status, TradeStatus::Pending);
        let record = ledger.get(&intent.idempotency_key).unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Pending);
        assert_eq!(market.executed_submissions().await, 0);
    }

    #[tokio::test]
    async fn definite_rejection_marks_submission_failed() {
        let market = PaperMarket::new();
        market.add_listing(listing("g-1", "95")).await;
        market
            .inject_failure(MarketError::Rejected("insufficient balance".into()))
            .await;
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        let intent = buy_intent("g-1", "95");
        assert_eq!(account.execute_intent(&intent).await.unwrap(), TradeStatus::Failed);
        let record = ledger.get(&intent.idempotency_key).unwrap().unwrap();
        assert!(record.reason.unwrap().starts_with("submission failed"));
    }

    /// Executes every submission but never delivers the venue's reply.
    struct LostReplyMarket {
        inner: PaperMarket,
    }

    #[async_trait]
    impl MarketClient for LostReplyMarket {
        async fn fetch_listings(&self, filter: &ListingFilter) -> giftsnipe_adapter::Result<Vec<ListingView>> {
            self.inner.fetch_listings(filter).await
        }

        async fn fetch_open_orders(&self, account_id: &str) -> giftsnipe_adapter::Result<Vec<OpenOrder>> {
            self.inner.fetch_open_orders(account_id).await
        }

        async fn submit(&self, intent: &Intent) -> giftsnipe_adapter::Result<SubmissionResult> {
            self.inner.submit(intent).await?;
            Err(MarketError::Timeout { after_ms: 10 })
        }

        async fn lookup_submission(
            &self,
            account_id: &str,
            key: &str,
        ) -> giftsnipe_adapter::Result<SubmissionLookup> {
            self.inner.lookup_submission(account_id, key).await
        }

        async fn fetch_inventory(&self, account_id: &str) -> giftsnipe_adapter::Result<Vec<InventoryItem>> {
            self.inner.fetch_inventory(account_id).await
        }

        async fn fetch_fills(&self, account_id: &str) -> giftsnipe_adapter::Result<Vec<Fill>> {
            self.inner.fetch_fills(account_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_submission_executed_by_venue_is_confirmed() {
        let market = PaperMarket::new();
        market.add_listing(listing("g-1", "95")).await;
        let ledger = Ledger::in_memory().unwrap();
        let client = Arc::new(LostReplyMarket {
            inner: market.clone(),
        });
        let account = build_with(params(), client, &ledger);

        let intent = buy_intent("g-1", "95");
        assert_eq!(account.execute_intent(&intent).await.unwrap(), TradeStatus::Confirmed);

        let record = ledger.get(&intent.idempotency_key).unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Confirmed);
        assert_eq!(record.external_order_id.as_deref(), Some("paper-buy-1"));
        assert_eq!(market.executed_submissions().await, 1);
        assert_eq!(ledger.compute_pnl("acc1").unwrap().open_positions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_record_with_failing_lookup_is_settled_later() {
        let market = PaperMarket::new();
        let ledger = Ledger::in_memory().unwrap();
        let intent = buy_intent("g-1", "95");
        ledger
            .record(&TradeAttempt::from_intent("portal", &intent, Utc::now()))
            .unwrap();
        market
            .record_submission(
                &intent.idempotency_key,
                SubmissionResult::accepted("ext-1", Decimal::ZERO),
            )
            .await;
        for _ in 0..3 {
            market.inject_failure(MarketError::Network("reset".into())).await;
        }
        let account = build(&market, &ledger);

        let report = account.reconcile_pending().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                still_pending: 1,
                ..ReconcileReport::default()
            }
        );

        // the same intent comes round again once the venue answers
        assert_eq!(account.execute_intent(&intent).await.unwrap(), TradeStatus::Pending);
        let record = ledger.get(&intent.idempotency_key).unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Confirmed);
        assert_eq!(record.external_order_id.as_deref(), Some("ext-1"));
        assert_eq!(market.executed_submissions().await, 0);
    }

    #[tokio::test]
    async fn relisted_item_is_bought_after_rejection() {
        let market = PaperMarket::new();
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        // a rival took g-1 before our buy landed
        assert_eq!(
            account.execute_intent(&buy_intent("g-1", "95")).await.unwrap(),
            TradeStatus::Failed
        );

        market.add_listing(listing("g-1", "80")).await;
        let report = account.run_cycle().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(market.executed_submissions().await, 2);
        let record = ledger.get("portal:acc1:buy:g-1:80").unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Confirmed);
    }

    #[tokio::test]
    async fn bought_item_is_listed_with_markup() {
        let market = PaperMarket::new();
        market.add_listing(listing("g-1", "95")).await;
        let ledger = Ledger::in_memory().unwrap();
        let selling = StrategyParams {
            auto_sell: Some(AutoSellConfig {
                markup_pct: dec("10"),
                max_sell_price: None,
            }),
            ..params()
        };
        let account = build_with(selling, Arc::new(market.clone()), &ledger);

        assert_eq!(account.run_cycle().await.unwrap().confirmed, 1);
        let report = account.run_cycle().await.unwrap();
        assert_eq!(report.confirmed, 1);

        let asks = market.fetch_open_orders("acc1").await.unwrap();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0].side, Side::Sell);
        assert_eq!(asks[0].price, dec("110"));
        let record = ledger.get("portal:acc1:list:g-1:110").unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Confirmed);

        // already listed: nothing more to do
        assert_eq!(account.run_cycle().await.unwrap().intents, 0);
    }

    #[tokio::test]
    async fn unauthorized_is_fatal() {
        let market = PaperMarket::new();
        market.revoke("acc1").await;
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        assert!(matches!(
            account.run().await,
            Err(AccountError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn reconcile_settles_pending_records() {
        let market = PaperMarket::new();
        let ledger = Ledger::in_memory().unwrap();
        let now = Utc::now();

        // accepted by the venue before the crash
        let accepted = buy_intent("g-1", "95");
        ledger
            .record(&TradeAttempt::from_intent("portal", &accepted, now))
            .unwrap();
        market
            .record_submission(
                &accepted.idempotency_key,
                SubmissionResult::accepted("ext-1", Decimal::ZERO),
            )
            .await;

        // never reached the venue, long ago
        let lost = buy_intent("g-2", "90");
        ledger
            .record(&TradeAttempt::from_intent(
                "portal",
                &lost,
                now - ChronoDuration::minutes(10),
            ))
            .unwrap();

        // never reached the venue, just now
        let young = buy_intent("g-3", "80");
        ledger
            .record(&TradeAttempt::from_intent("portal", &young, now))
            .unwrap();

        let account = build(&market, &ledger);
        let report = account.reconcile_pending().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                confirmed: 1,
                failed: 1,
                still_pending: 1
            }
        );

        let lost_record = ledger.get(&lost.idempotency_key).unwrap().unwrap();
        assert_eq!(lost_record.reason.as_deref(), Some(SUBMISSION_TIMEOUT_REASON));
        assert_eq!(market.executed_submissions().await, 0);
    }

    #[tokio::test]
    async fn fills_are_ingested_once() {
        let market = PaperMarket::new();
        let order_id = market
            .add_order("acc1", "g-1", "Plush Pepe", Side::Sell, dec("110"))
            .await;
        market.fill_order(&order_id, dec("2")).await.unwrap();
        let ledger = Ledger::in_memory().unwrap();
        let account = build(&market, &ledger);

        assert_eq!(account.ingest_fills().await.unwrap(), 1);
        assert_eq!(account.ingest_fills().await.unwrap(), 0);
    }
}
