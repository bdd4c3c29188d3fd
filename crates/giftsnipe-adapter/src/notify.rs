/*
[INPUT]:  Trade outcomes, fills and supervisor state changes
[OUTPUT]: NotificationSink trait with log and webhook implementations
[POS]:    Notification layer - fire-and-forget side channel
[UPDATE]: When a new event kind or sink is added
*/

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

/// Events worth telling a human about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    TradeConfirmed {
        market: String,
        account: String,
        key: String,
        action: String,
        item_id: String,
        price: Decimal,
    },
    TradeFailed {
        market: String,
        account: String,
        key: String,
        reason: String,
    },
    FillRecorded {
        market: String,
        account: String,
        item_id: String,
        price: Decimal,
        fee: Decimal,
    },
    AccountHalted {
        market: String,
        account: String,
        reason: String,
    },
    MarketStateChanged {
        market: String,
        from: String,
        to: String,
    },
    RestartPolicyExhausted {
        market: String,
        attempts: usize,
    },
}

impl NotificationEvent {
    pub fn market(&self) -> &str {
        match self {
            NotificationEvent::TradeConfirmed { market, .. }
            | NotificationEvent::TradeFailed { market, .. }
            | NotificationEvent::FillRecorded { market, .. }
            | NotificationEvent::AccountHalted { market, .. }
            | NotificationEvent::MarketStateChanged { market, .. }
            | NotificationEvent::RestartPolicyExhausted { market, .. } => market,
        }
    }
}

/// Delivery must never block or fail the caller.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event: NotificationEvent);
}

pub type SharedNotifier = Arc<dyn NotificationSink>;

/// Writes events to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, event: NotificationEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(market = %event.market(), %payload, "notification"),
            Err(err) => warn!(error = %err, "failed to encode notification"),
        }
    }
}

/// POSTs each event as JSON from a detached task.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: url::Url,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, url::ParseError> {
        let url = url::Url::parse(url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Sends one event and waits for the response. Used by `notify` and tests.
    pub async fn deliver(&self, event: &NotificationEvent) -> Result<(), reqwest::Error> {
        self.client
            .post(self.url.clone())
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl NotificationSink for WebhookNotifier {
    fn notify(&self, event: NotificationEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(market = %event.market(), "no runtime available, webhook notification dropped");
            return;
        };
        let notifier = self.clone();
        handle.spawn(async move {
            if let Err(err) = notifier.deliver(&event).await {
                warn!(market = %event.market(), error = %err, "webhook notification failed");
            }
        });
    }
}

/// Fans every event out to several sinks.
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    sinks: Vec<SharedNotifier>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedNotifier) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutNotifier {
    fn notify(&self, event: NotificationEvent) {
        for sink in &self.sinks {
            sink.notify(event.clone());
        }
    }
}
