/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public marketplace contract surface shared by engine and launcher
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod client;
pub mod error;
pub mod notify;
pub mod paper;
pub mod types;

pub use client::{MarketClient, SharedMarketClient};
pub use error::{MarketError, Result};
pub use notify::{
    FanoutNotifier, LogNotifier, NotificationEvent, NotificationSink, SharedNotifier, WebhookNotifier,
};
pub use paper::{PaperFeedConfig, PaperMarket};

// Re-export all types
pub use types::*;
