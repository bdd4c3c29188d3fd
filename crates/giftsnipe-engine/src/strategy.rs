/*
[INPUT]:  Listing snapshot, the account's open orders and inventory, resolved StrategyParams
[OUTPUT]: Ordered list of Intents (cancel/reprice of own orders, then listings, then buys)
[POS]:    Strategy layer - pure decision function, no I/O
[UPDATE]: When changing selection, pricing or outbid rules
*/

use std::collections::{BTreeMap, BTreeSet};

use giftsnipe_adapter::{Intent, IntentKind, InventoryItem, ListingView, OpenOrder, Side};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::{AutoSellConfig, PricingConfig, StrategyParams};

/// Decide what the account should do with the current market snapshot.
///
/// Deterministic: identical inputs yield identical intents in identical order.
/// Own-order actions come first, in ascending order id, then listings of
/// unlisted inventory in item id order, then buy candidates ranked by target
/// price, item id and observation time.
pub fn evaluate(
    listings: &[ListingView],
    open_orders: &[OpenOrder],
    inventory: &[InventoryItem],
    params: &StrategyParams,
) -> Vec<Intent> {
    let cheapest_ask = cheapest_foreign_asks(listings, params);
    let mut intents = manage_open_orders(&cheapest_ask, open_orders, params);
    intents.extend(select_listings(&cheapest_ask, open_orders, inventory, params));
    intents.extend(select_buys(listings, open_orders, params));
    intents
}

/// Cheapest ask per collection from other sellers, keyed case-insensitively.
fn cheapest_foreign_asks(listings: &[ListingView], params: &StrategyParams) -> BTreeMap<String, Decimal> {
    let mut cheapest: BTreeMap<String, Decimal> = BTreeMap::new();
    for listing in listings
        .iter()
        .filter(|l| l.seller != params.account_id && l.price > Decimal::ZERO)
    {
        cheapest
            .entry(listing.collection.to_lowercase())
            .and_modify(|best| *best = (*best).min(listing.price))
            .or_insert(listing.price);
    }
    cheapest
}

fn select_listings(
    cheapest_ask: &BTreeMap<String, Decimal>,
    open_orders: &[OpenOrder],
    inventory: &[InventoryItem],
    params: &StrategyParams,
) -> Vec<Intent> {
    let Some(sell) = &params.auto_sell else {
        return Vec::new();
    };
    let asking: BTreeSet<&str> = open_orders
        .iter()
        .filter(|order| order.side == Side::Sell)
        .map(|order| order.item_id.as_str())
        .collect();

    let mut held: Vec<&InventoryItem> = inventory
        .iter()
        .filter(|item| !item.listed && !asking.contains(item.item_id.as_str()))
        .filter(|item| collection_allowed(&item.collection, params))
        .collect();
    held.sort_by(|a, b| a.item_id.cmp(&b.item_id));

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    held.into_iter()
        .filter(|item| seen.insert(item.item_id.as_str()))
        .filter_map(|item| {
            let floor = item
                .floor_price
                .or_else(|| cheapest_ask.get(&item.collection.to_lowercase()).copied());
            let price = sell_price(floor, item.acquired_price, sell, params)?;
            Some(Intent {
                kind: IntentKind::List,
                target: item.item_id.clone(),
                item_id: item.item_id.clone(),
                collection: item.collection.clone(),
                side: Side::Sell,
                price,
                account_id: params.account_id.clone(),
                idempotency_key: Intent::list_key(&params.market, &params.account_id, &item.item_id, price),
            })
        })
        .collect()
}

/// Asking price for a held item, or None when no positive price can be derived.
pub fn sell_price(
    floor: Option<Decimal>,
    acquired: Option<Decimal>,
    sell: &AutoSellConfig,
    params: &StrategyParams,
) -> Option<Decimal> {
    let step = params.price_step;
    let base = match floor.filter(|f| *f > Decimal::ZERO) {
        Some(floor) => floor * (Decimal::ONE + sell.markup_pct / Decimal::ONE_HUNDRED),
        None => acquired?,
    };
    let mut price = round_down_to_step(base, step);
    if let Some(min) = params.min_sell_price {
        if price < min {
            price = round_down_to_step(min, step);
        }
    }
    if let Some(max) = sell.max_sell_price {
        if price > max {
            price = round_down_to_step(max, step);
        }
    }
    (price > Decimal::ZERO).then_some(price)
}

fn select_buys(
    listings: &[ListingView],
    open_orders: &[OpenOrder],
    params: &StrategyParams,
) -> Vec<Intent> {
    let bidding: BTreeSet<&str> = open_orders
        .iter()
        .filter(|order| order.side == Side::Buy)
        .map(|order| order.item_id.as_str())
        .collect();

    let mut candidates: Vec<(Decimal, &ListingView)> = listings
        .iter()
        .filter(|listing| listing.seller != params.account_id)
        .filter(|listing| listing.price > Decimal::ZERO)
        .filter(|listing| !bidding.contains(listing.item_id.as_str()))
        .filter(|listing| collection_allowed(&listing.collection, params))
        .filter_map(|listing| {
            let target = target_price(listing, params)?;
            (target > Decimal::ZERO && target <= params.price_ceiling && margin_ok(listing, target, params))
                .then_some((target, listing))
        })
        .collect();

    candidates.sort_by(|(pa, a), (pb, b)| {
        pa.cmp(pb)
            .then_with(|| a.item_id.cmp(&b.item_id))
            .then_with(|| a.observed_at.cmp(&b.observed_at))
    });

    let mut seen: BTreeSet<String> = BTreeSet::new();
    candidates
        .into_iter()
        .filter(|(_, listing)| seen.insert(listing.item_id.clone()))
        .take(params.max_buys_per_cycle)
        .map(|(target, listing)| Intent {
            kind: IntentKind::Buy,
            target: listing.item_id.clone(),
            item_id: listing.item_id.clone(),
            collection: listing.collection.clone(),
            side: Side::Buy,
            price: target,
            account_id: params.account_id.clone(),
            idempotency_key: Intent::buy_key(&params.market, &params.account_id, &listing.item_id, target),
        })
        .collect()
}

fn manage_open_orders(
    cheapest_ask: &BTreeMap<String, Decimal>,
    open_orders: &[OpenOrder],
    params: &StrategyParams,
) -> Vec<Intent> {
    let mut ordered: Vec<&OpenOrder> = open_orders.iter().collect();
    ordered.sort_by(|a, b| a.order_id.cmp(&b.order_id));

    let delta = params.pricing.delta();
    ordered
        .into_iter()
        .filter_map(|order| match order.side {
            Side::Buy => manage_bid(order, delta, params),
            Side::Sell => {
                let competing = order
                    .best_competing
                    .or_else(|| cheapest_ask.get(&order.collection.to_lowercase()).copied());
                manage_ask(order, competing, delta, params)
            }
        })
        .collect()
}

fn manage_bid(order: &OpenOrder, delta: Decimal, params: &StrategyParams) -> Option<Intent> {
    if !collection_allowed(&order.collection, params) || order.price > params.price_ceiling {
        return Some(cancel(order, params));
    }
    let competing = order.best_competing?;
    if competing - order.price <= params.tolerance {
        return None;
    }
    let new_price = round_down_to_step(competing + delta, params.price_step);
    (new_price > order.price && new_price <= params.price_ceiling).then(|| reprice(order, new_price, params))
}

fn manage_ask(
    order: &OpenOrder,
    competing: Option<Decimal>,
    delta: Decimal,
    params: &StrategyParams,
) -> Option<Intent> {
    if let Some(min_sell) = params.min_sell_price {
        if order.price < min_sell {
            return Some(cancel(order, params));
        }
    }
    let competing = competing?;
    if order.price - competing <= params.tolerance {
        return None;
    }
    let new_price = round_down_to_step(competing - delta, params.price_step);
    if new_price >= order.price {
        return None;
    }
    let above_min = params.min_sell_price.is_none_or(|min| new_price >= min);
    (above_min && new_price > Decimal::ZERO).then(|| reprice(order, new_price, params))
}

fn cancel(order: &OpenOrder, params: &StrategyParams) -> Intent {
    Intent {
        kind: IntentKind::Cancel,
        target: order.order_id.clone(),
        item_id: order.item_id.clone(),
        collection: order.collection.clone(),
        side: order.side,
        price: order.price,
        account_id: params.account_id.clone(),
        idempotency_key: Intent::cancel_key(&params.market, &params.account_id, &order.order_id),
    }
}

fn reprice(order: &OpenOrder, price: Decimal, params: &StrategyParams) -> Intent {
    Intent {
        kind: IntentKind::Reprice,
        target: order.order_id.clone(),
        item_id: order.item_id.clone(),
        collection: order.collection.clone(),
        side: order.side,
        price,
        account_id: params.account_id.clone(),
        idempotency_key: Intent::reprice_key(
            &params.market,
            &params.account_id,
            &order.order_id,
            price,
        ),
    }
}

fn target_price(listing: &ListingView, params: &StrategyParams) -> Option<Decimal> {
    match &params.pricing {
        PricingConfig::Undercut { .. } => Some(listing.price),
        PricingConfig::FloorRelative { factor, delta } => {
            let floor = listing.floor_price?;
            let raw = (floor * *factor).min(listing.price - *delta);
            Some(round_down_to_step(raw, params.price_step))
        }
    }
}

fn margin_ok(listing: &ListingView, target: Decimal, params: &StrategyParams) -> bool {
    let Some(min_margin) = params.min_margin else {
        return true;
    };
    let Some(floor) = listing.floor_price else {
        return false;
    };
    floor * (Decimal::ONE - params.fee_rate) - target >= min_margin
}

pub fn collection_allowed(collection: &str, params: &StrategyParams) -> bool {
    let listed = |names: &[String]| names.iter().any(|n| n.eq_ignore_ascii_case(collection));
    (params.allow.is_empty() || listed(&params.allow)) && !listed(&params.deny)
}

/// Round `value` down to a multiple of `step`.
pub fn round_down_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let steps = (value / step).round_dp_with_strategy(0, RoundingStrategy::ToNegativeInfinity);
    (steps * step).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn params() -> StrategyParams {
        StrategyParams {
            market: "portal".into(),
            account_id: "acc1".into(),
            price_ceiling: dec("100"),
            pricing: PricingConfig::Undercut { delta: dec("1") },
            tolerance: dec("0"),
            allow: Vec::new(),
            deny: Vec::new(),
            min_margin: None,
            fee_rate: dec("0"),
            price_step: dec("0.01"),
            min_sell_price: None,
            max_buys_per_cycle: 4,
            auto_sell: None,
        }
    }

    fn held(item: &str, floor: Option<&str>, listed: bool) -> InventoryItem {
        InventoryItem {
            item_id: item.into(),
            collection: "Plush Pepe".into(),
            floor_price: floor.map(dec),
            acquired_price: Some(dec("90")),
            listed,
        }
    }

    fn selling(markup: &str, max: Option<&str>) -> StrategyParams {
        StrategyParams {
            auto_sell: Some(AutoSellConfig {
                markup_pct: dec(markup),
                max_sell_price: max.map(dec),
            }),
            ..params()
        }
    }

    fn listing(item: &str, collection: &str, price: &str) -> ListingView {
        ListingView {
            item_id: item.into(),
            collection: collection.into(),
            price: dec(price),
            floor_price: Some(dec("100")),
            seller: "bob".into(),
            observed_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn order(id: &str, item: &str, side: Side, price: &str, competing: Option<&str>) -> OpenOrder {
        OpenOrder {
            order_id: id.into(),
            item_id: item.into(),
            collection: "Plush Pepe".into(),
            side,
            price: dec(price),
            best_competing: competing.map(dec),
        }
    }

    #[test]
    fn buys_listing_under_ceiling_at_ask() {
        let intents = evaluate(&[listing("g-1", "Plush Pepe", "95")], &[], &[], &params());
        assert_eq!(intents.len(), 1);
        let intent = &intents[0];
        assert_eq!(intent.kind, IntentKind::Buy);
        assert_eq!(intent.price, dec("95"));
        assert_eq!(intent.idempotency_key, "portal:acc1:buy:g-1:95");
    }

    #[rstest]
    #[case::above_ceiling(listing("g-1", "Plush Pepe", "101"))]
    #[case::zero_price(listing("g-1", "Plush Pepe", "0"))]
    #[case::own_listing(ListingView { seller: "acc1".into(), ..listing("g-1", "Plush Pepe", "50") })]
    fn skips_ineligible_listings(#[case] candidate: ListingView) {
        assert!(evaluate(&[candidate], &[], &[], &params()).is_empty());
    }

    #[test]
    fn skips_items_with_open_bid() {
        let bids = [order("o-1", "g-1", Side::Buy, "90", None)];
        let intents = evaluate(&[listing("g-1", "Plush Pepe", "95")], &bids, &[], &params());
        assert!(intents.iter().all(|i| i.kind != IntentKind::Buy));
    }

    #[rstest]
    #[case(vec!["plush pepe"], vec![], "Plush Pepe", true)]
    #[case(vec!["Durov Cap"], vec![], "Plush Pepe", false)]
    #[case(vec![], vec!["PLUSH PEPE"], "Plush Pepe", false)]
    #[case(vec![], vec![], "Plush Pepe", true)]
    fn allow_and_deny_lists(
        #[case] allow: Vec<&str>,
        #[case] deny: Vec<&str>,
        #[case] collection: &str,
        #[case] expected: bool,
    ) {
        let p = StrategyParams {
            allow: allow.into_iter().map(String::from).collect(),
            deny: deny.into_iter().map(String::from).collect(),
            ..params()
        };
        assert_eq!(collection_allowed(collection, &p), expected);
    }

    #[test]
    fn floor_relative_rounds_down_and_needs_floor() {
        let p = StrategyParams {
            pricing: PricingConfig::FloorRelative {
                factor: dec("0.877"),
                delta: dec("1"),
            },
            ..params()
        };
        let with_floor = listing("g-1", "Plush Pepe", "95");
        let no_floor = ListingView {
            floor_price: None,
            ..listing("g-2", "Plush Pepe", "95")
        };
        let intents = evaluate(&[with_floor, no_floor], &[], &[], &p);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].item_id, "g-1");
        assert_eq!(intents[0].price, dec("87.7"));
    }

    #[test]
    fn margin_filter_accounts_for_fees() {
        let p = StrategyParams {
            min_margin: Some(dec("5")),
            fee_rate: dec("0.05"),
            ..params()
        };
        // 100 * 0.95 - 90 = 5 passes, 100 * 0.95 - 91 = 4 fails
        let intents = evaluate(
            &[listing("g-1", "Plush Pepe", "90"), listing("g-2", "Plush Pepe", "91")],
            &[],
            &[],
            &p,
        );
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].item_id, "g-1");
    }

    #[test]
    fn candidates_are_ranked_and_capped() {
        let p = StrategyParams {
            max_buys_per_cycle: 2,
            ..params()
        };
        let listings = [
            listing("g-3", "Plush Pepe", "80"),
            listing("g-2", "Plush Pepe", "70"),
            listing("g-1", "Plush Pepe", "80"),
            listing("g-2", "Plush Pepe", "75"),
        ];
        let intents = evaluate(&listings, &[], &[], &p);
        let picked: Vec<_> = intents.iter().map(|i| (i.item_id.as_str(), i.price)).collect();
        assert_eq!(picked, vec![("g-2", dec("70")), ("g-1", dec("80"))]);
    }

    #[test]
    fn bid_over_ceiling_or_disallowed_is_cancelled() {
        let p = StrategyParams {
            deny: vec!["Durov Cap".into()],
            ..params()
        };
        let mut denied = order("o-2", "g-2", Side::Buy, "50", None);
        denied.collection = "durov cap".into();
        let orders = [order("o-1", "g-1", Side::Buy, "120", None), denied];

        let intents = evaluate(&[], &orders, &[], &p);
        assert_eq!(intents.len(), 2);
        assert!(intents.iter().all(|i| i.kind == IntentKind::Cancel));
        assert_eq!(intents[0].target, "o-1");
        assert_eq!(intents[0].idempotency_key, "portal:acc1:cancel:o-1");
    }

    #[rstest]
    #[case::outbid("90", Some("95"), "0", Some("96"))]
    #[case::within_tolerance("90", Some("91"), "2", None)]
    #[case::would_breach_ceiling("90", Some("99.5"), "0", None)]
    #[case::no_competition("90", None, "0", None)]
    #[case::rounded_to_step("90", Some("95.005"), "0", Some("96"))]
    fn bid_reprice(
        #[case] own: &str,
        #[case] competing: Option<&str>,
        #[case] tolerance: &str,
        #[case] expected: Option<&str>,
    ) {
        let p = StrategyParams {
            tolerance: dec(tolerance),
            ..params()
        };
        let intents = evaluate(&[], &[order("o-1", "g-1", Side::Buy, own, competing)], &[], &p);
        match expected {
            Some(price) => {
                assert_eq!(intents.len(), 1);
                assert_eq!(intents[0].kind, IntentKind::Reprice);
                assert_eq!(intents[0].price, dec(price));
            }
            None => assert!(intents.is_empty()),
        }
    }

    #[test]
    fn ask_follows_cheapest_foreign_listing() {
        let p = StrategyParams {
            min_sell_price: Some(dec("100")),
            ..params()
        };
        let listings = [
            listing("g-7", "plush pepe", "108"),
            ListingView {
                seller: "acc1".into(),
                ..listing("g-8", "Plush Pepe", "101")
            },
        ];
        let orders = [order("o-1", "g-1", Side::Sell, "120", None)];
        let intents = evaluate(&listings, &orders, &[], &p);
        let reprices: Vec<_> = intents
            .iter()
            .filter(|i| i.kind == IntentKind::Reprice)
            .collect();
        assert_eq!(reprices.len(), 1);
        assert_eq!(reprices[0].price, dec("107"));
        assert_eq!(reprices[0].idempotency_key, "portal:acc1:reprice:o-1:107");
    }

    #[test]
    fn ask_never_reprices_below_minimum() {
        let p = StrategyParams {
            min_sell_price: Some(dec("100")),
            ..params()
        };
        let orders = [
            order("o-1", "g-1", Side::Sell, "120", Some("100.5")),
            order("o-2", "g-2", Side::Sell, "90", None),
        ];
        let intents = evaluate(&[], &orders, &[], &p);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, IntentKind::Cancel);
        assert_eq!(intents[0].target, "o-2");
    }

    #[test]
    fn ask_reprice_is_rounded_down_to_step() {
        let orders = [order("o-1", "g-1", Side::Sell, "120", Some("100.555"))];
        let intents = evaluate(&[], &orders, &[], &params());
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].price, dec("99.55"));
    }

    #[test]
    fn unlisted_inventory_is_put_up_for_sale() {
        let inventory = [
            held("g-3", Some("100"), true),
            held("g-2", Some("33.333"), false),
            held("g-1", Some("100"), false),
            held("g-4", Some("100"), false),
        ];
        let orders = [order("o-1", "g-4", Side::Sell, "130", None)];
        let intents = evaluate(&[], &orders, &inventory, &selling("10", None));

        let listed: Vec<_> = intents
            .iter()
            .filter(|i| i.kind == IntentKind::List)
            .map(|i| (i.item_id.as_str(), i.side, i.price))
            .collect();
        assert_eq!(
            listed,
            vec![("g-1", Side::Sell, dec("110")), ("g-2", Side::Sell, dec("36.66"))]
        );
        assert_eq!(
            intents.iter().find(|i| i.kind == IntentKind::List).unwrap().idempotency_key,
            "portal:acc1:list:g-1:110"
        );
    }

    #[test]
    fn inventory_is_kept_without_auto_sell() {
        let inventory = [held("g-1", Some("100"), false)];
        assert!(evaluate(&[], &[], &inventory, &params()).is_empty());
    }

    #[test]
    fn missing_floor_falls_back_to_cheapest_ask() {
        let inventory = [held("g-1", None, false)];
        let listings = [listing("g-9", "Plush Pepe", "150")];
        let p = StrategyParams {
            price_ceiling: dec("100"),
            ..selling("0", None)
        };
        let intents = evaluate(&listings, &[], &inventory, &p);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, IntentKind::List);
        assert_eq!(intents[0].price, dec("150"));
    }

    #[rstest]
    #[case::markup_on_floor(Some("100"), Some("90"), None, None, Some("110"))]
    #[case::acquired_without_floor(None, Some("95"), None, None, Some("95"))]
    #[case::nothing_to_price(None, None, None, None, None)]
    #[case::clamped_to_max(Some("100"), None, None, Some("105"), Some("105"))]
    #[case::raised_to_min(Some("10"), None, Some("20"), None, Some("20"))]
    fn sell_price_bounds(
        #[case] floor: Option<&str>,
        #[case] acquired: Option<&str>,
        #[case] min: Option<&str>,
        #[case] max: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let p = StrategyParams {
            min_sell_price: min.map(dec),
            ..selling("10", max)
        };
        let sell = p.auto_sell.clone().unwrap();
        assert_eq!(
            sell_price(floor.map(dec), acquired.map(dec), &sell, &p),
            expected.map(dec)
        );
    }

    #[test]
    fn evaluation_is_deterministic() {
        let listings: Vec<_> = (0..20)
            .map(|i| listing(&format!("g-{i:02}"), "Plush Pepe", &format!("{}", 60 + (i * 7) % 40)))
            .collect();
        let orders = vec![
            order("o-9", "x-1", Side::Sell, "150", None),
            order("o-1", "x-2", Side::Buy, "40", Some("45")),
        ];
        let first = evaluate(&listings, &orders, &[], &params());

        let mut shuffled_orders = orders.clone();
        shuffled_orders.reverse();
        let second = evaluate(&listings, &shuffled_orders, &[], &params());
        assert_eq!(first, second);
        assert_eq!(first[0].target, "o-1");
    }

    #[test]
    fn round_down_examples() {
        assert_eq!(round_down_to_step(dec("87.789"), dec("0.01")), dec("87.78"));
        assert_eq!(round_down_to_step(dec("10"), dec("0.25")), dec("10"));
        assert_eq!(round_down_to_step(dec("10.3"), dec("0.25")), dec("10.25"));
    }
}
