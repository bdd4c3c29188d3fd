/*
[INPUT]:  Confirmed buy and fill TradeRecords of one account
[OUTPUT]: PnLSnapshot with FIFO-matched realized profit and open positions
[POS]:    Persistence layer - derived statistics, never stored
[UPDATE]: When the matching rule or snapshot fields change
*/

use std::collections::{BTreeMap, VecDeque};

use giftsnipe_adapter::Side;
use rust_decimal::Decimal;
use serde::Serialize;

use super::{TradeAction, TradeRecord, TradeStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PnLSnapshot {
    pub account_id: String,
    pub buy_count: usize,
    pub sell_count: usize,
    pub total_bought: Decimal,
    pub total_sold: Decimal,
    pub total_fees: Decimal,
    pub realized_profit: Decimal,
    pub matched_pairs: usize,
    pub open_positions: usize,
    pub open_cost: Decimal,
}

/// Match buys and sells per item in (timestamp, key) order.
///
/// Only Confirmed records count. The input order does not matter.
pub fn fold_pnl(account_id: &str, records: &[TradeRecord]) -> PnLSnapshot {
    let mut sorted: Vec<&TradeRecord> = records
        .iter()
        .filter(|r| r.account_id == account_id && r.status == TradeStatus::Confirmed)
        .collect();
    sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));

    let mut snapshot = PnLSnapshot {
        account_id: account_id.to_string(),
        ..PnLSnapshot::default()
    };
    let mut holdings: BTreeMap<&str, VecDeque<&TradeRecord>> = BTreeMap::new();

    for record in sorted {
        match (record.action, record.side) {
            (TradeAction::Buy, _) | (TradeAction::Fill, Side::Buy) => {
                snapshot.buy_count += 1;
                snapshot.total_bought += record.price;
                snapshot.total_fees += record.fee;
                holdings
                    .entry(record.item_id.as_str())
                    .or_default()
                    .push_back(record);
            }
            (TradeAction::Fill, Side::Sell) => {
                snapshot.sell_count += 1;
                snapshot.total_sold += record.price;
                snapshot.total_fees += record.fee;
                let bought = holdings
                    .get_mut(record.item_id.as_str())
                    .and_then(|queue| queue.pop_front());
                if let Some(buy) = bought {
                    snapshot.matched_pairs += 1;
                    snapshot.realized_profit += record.price - buy.price - buy.fee - record.fee;
                }
            }
            _ => {}
        }
    }

    for buy in holdings.values().flatten() {
        snapshot.open_positions += 1;
        snapshot.open_cost += buy.price + buy.fee;
    }
    snapshot
}
