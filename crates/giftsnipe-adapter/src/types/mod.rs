/*
[INPUT]:  Domain vocabulary of the marketplace contract
[OUTPUT]: Enums and models exchanged between the core and a market client
[POS]:    Data layer - module wiring
[UPDATE]: When types are added or moved
*/

pub mod enums;
pub mod models;

pub use enums::{IntentKind, Side};
pub use models::{
    Fill, Intent, InventoryItem, ListingFilter, ListingView, OpenOrder, SubmissionLookup, SubmissionResult,
};
