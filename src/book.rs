//! Central limit order book.
//!
//! Each side holds a `BTreeMap` of price levels; within a level orders sit
//! in a FIFO queue, so level position is acceptance order and the book as a
//! whole realizes strict (price, sequence) priority. An id index gives O(1)
//! lookup for cancels and amends.

use crate::config::SelfTradePolicy;
use crate::order::Order;
use crate::types::{AccountId, InstrumentId, OrderId, Price, SeqNum, Side, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// One side of the book.
#[derive(Debug, Clone, Default)]
struct BookSide {
    levels: BTreeMap<Price, VecDeque<Order>>,
    index: HashMap<OrderId, Price>,
}

impl BookSide {
    fn insert(&mut self, order: Order) {
        let price = order.price.expect("resting order must have a price");
        self.index.insert(order.id, price);
        self.levels.entry(price).or_default().push_back(order);
    }

    fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        let price = self.index.remove(&order_id)?;
        let level = self.levels.get_mut(&price)?;
        let pos = level.iter().position(|o| o.id == order_id)?;
        let order = level.remove(pos);
        if level.is_empty() {
            self.levels.remove(&price);
        }
        order
    }

    fn get(&self, order_id: OrderId) -> Option<&Order> {
        let price = self.index.get(&order_id)?;
        self.levels.get(price)?.iter().find(|o| o.id == order_id)
    }

    fn get_mut(&mut self, order_id: OrderId) -> Option<&mut Order> {
        let price = self.index.get(&order_id)?;
        self.levels
            .get_mut(price)?
            .iter_mut()
            .find(|o| o.id == order_id)
    }

    fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn iter_orders(&self) -> impl Iterator<Item = &Order> {
        self.levels.values().flat_map(|level| level.iter())
    }
}

/// A single aggregated price level in a depth view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Price,
    pub qty: Decimal,
    pub order_count: usize,
}

/// Immutable aggregated view of the book, published for readers outside
/// the matching thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub instrument_id: InstrumentId,
    /// Event sequence at which this view was taken.
    pub seq: SeqNum,
    pub taken_at: Timestamp,
    /// Best first (highest bid, lowest ask).
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<Price> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.first().map(|l| l.price)
    }
}

/// A fill between a taker and one resting maker order, always at the
/// maker's price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub maker_order_id: OrderId,
    pub maker_account_id: AccountId,
    pub maker_seq: SeqNum,
    pub taker_order_id: OrderId,
    pub taker_account_id: AccountId,
    pub price: Price,
    pub qty: Decimal,
    pub taker_side: Side,
}

/// Result of running an incoming order through the match loop.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub fills: Vec<Fill>,
    pub remaining_qty: Decimal,
    /// Makers fully consumed by this match, already removed from the book.
    pub filled_makers: Vec<Order>,
    /// Resting orders removed by the CancelResting self-trade policy.
    pub stp_cancelled: Vec<Order>,
    /// Under CancelTaker, set when the taker's remainder was cut because
    /// it reached the account's own resting order.
    pub taker_stopped_on_self: bool,
}

impl MatchOutcome {
    pub fn fully_filled(&self) -> bool {
        self.remaining_qty.is_zero()
    }
}

/// Central limit order book for one instrument.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub instrument_id: InstrumentId,
    bids: BookSide,
    asks: BookSide,
}

impl OrderBook {
    pub fn new(instrument_id: InstrumentId) -> Self {
        Self {
            instrument_id,
            bids: BookSide::default(),
            asks: BookSide::default(),
        }
    }

    fn side(&self, side: Side) -> &BookSide {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BookSide {
        match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        }
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.bids.levels.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.asks.levels.keys().next().copied()
    }

    /// Best price on the side an incoming `taker_side` order would hit.
    pub fn best_opposing(&self, taker_side: Side) -> Option<Price> {
        match taker_side {
            Side::Buy => self.best_ask(),
            Side::Sell => self.best_bid(),
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.value() - bid.value()),
            _ => None,
        }
    }

    /// Rest a non-marketable order on its side.
    pub fn insert(&mut self, order: Order) {
        debug_assert!(order.price.is_some());
        self.side_mut(order.side).insert(order);
    }

    pub fn remove(&mut self, order_id: OrderId) -> Option<Order> {
        self.bids
            .remove(order_id)
            .or_else(|| self.asks.remove(order_id))
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        self.bids.get(order_id).or_else(|| self.asks.get(order_id))
    }

    pub fn get_mut(&mut self, order_id: OrderId) -> Option<&mut Order> {
        if self.bids.contains(order_id) {
            self.bids.get_mut(order_id)
        } else {
            self.asks.get_mut(order_id)
        }
    }

    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    pub fn iter_orders(&self) -> impl Iterator<Item = &Order> {
        self.bids.iter_orders().chain(self.asks.iter_orders())
    }

    /// Best bid must stay strictly below best ask once matching settles.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    fn crosses(taker_side: Side, limit: Option<Price>, level: Price) -> bool {
        match (taker_side, limit) {
            (_, None) => true,
            (Side::Buy, Some(p)) => p >= level,
            (Side::Sell, Some(p)) => p <= level,
        }
    }

    /// Quantity an order could execute right now, respecting the self-trade
    /// policy. Used for the FOK pre-scan so a fill-or-kill either executes
    /// in full or touches nothing.
    pub fn fillable_qty(
        &self,
        taker_side: Side,
        limit: Option<Price>,
        account_id: AccountId,
        policy: SelfTradePolicy,
        up_to: Decimal,
    ) -> Decimal {
        let opposing = self.side(taker_side.opposite());
        let mut available = Decimal::ZERO;

        let levels: Box<dyn Iterator<Item = (&Price, &VecDeque<Order>)>> = match taker_side {
            Side::Buy => Box::new(opposing.levels.iter()),
            Side::Sell => Box::new(opposing.levels.iter().rev()),
        };

        'outer: for (price, level) in levels {
            if !Self::crosses(taker_side, limit, *price) {
                break;
            }
            for resting in level {
                if resting.account_id == account_id {
                    match policy {
                        // the remainder would be cut here, nothing past
                        // the own order is reachable
                        SelfTradePolicy::CancelTaker => break 'outer,
                        // the own order would be cancelled and skipped
                        SelfTradePolicy::CancelResting => continue,
                    }
                }
                available += resting.remaining_qty;
                if available >= up_to {
                    return up_to;
                }
            }
        }
        available.min(up_to)
    }

    /// Highest-notional price an order for `qty` could fill at right now.
    /// A sell fills downward from the best bid, so the bid is its worst
    /// price; a buy walks up the asks, so its worst price is the deepest
    /// level the quantity reaches. Used to price margin checks so that no
    /// fill can require more margin than was verified at acceptance.
    pub fn worst_fill_price(&self, taker_side: Side, qty: Decimal) -> Option<Price> {
        match taker_side {
            Side::Sell => self.best_bid(),
            Side::Buy => {
                let mut available = Decimal::ZERO;
                let mut worst = None;
                for (price, level) in self.asks.levels.iter() {
                    worst = Some(*price);
                    available += level.iter().map(|o| o.remaining_qty).sum::<Decimal>();
                    if available >= qty {
                        break;
                    }
                }
                worst
            }
        }
    }

    /// Match an incoming order against the opposing side. Fills are at the
    /// maker's price; makers are consumed strictly in (price, seq) order.
    /// The caller decides what happens to any remainder.
    pub fn match_order(&mut self, order: &mut Order, policy: SelfTradePolicy) -> MatchOutcome {
        let mut fills = Vec::new();
        let mut filled_makers = Vec::new();
        let mut stp_cancelled = Vec::new();
        let mut taker_stopped_on_self = false;

        let taker_side = order.side;
        let limit = match order.order_type {
            crate::order::OrderType::Limit => order.price,
            _ => None,
        };

        'matching: while !order.remaining_qty.is_zero() {
            let opposing = self.side_mut(taker_side.opposite());
            let best_price = match taker_side {
                Side::Buy => opposing.levels.keys().next().copied(),
                Side::Sell => opposing.levels.keys().next_back().copied(),
            };

            let Some(level_price) = best_price else {
                break; // no liquidity
            };
            if !Self::crosses(taker_side, limit, level_price) {
                break; // price doesn't cross
            }

            // walk the level FIFO, applying STP before each fill
            loop {
                let level = match opposing.levels.get_mut(&level_price) {
                    Some(level) if !level.is_empty() => level,
                    _ => {
                        opposing.levels.remove(&level_price);
                        continue 'matching;
                    }
                };

                let maker_front = &level[0];
                if maker_front.account_id == order.account_id {
                    match policy {
                        SelfTradePolicy::CancelTaker => {
                            taker_stopped_on_self = true;
                            break 'matching;
                        }
                        SelfTradePolicy::CancelResting => {
                            let own_id = level[0].id;
                            let own = opposing.remove(own_id).expect("own order indexed");
                            stp_cancelled.push(own);
                            continue;
                        }
                    }
                }

                let maker = &mut level[0];
                let fill_qty = order.remaining_qty.min(maker.remaining_qty);

                fills.push(Fill {
                    maker_order_id: maker.id,
                    maker_account_id: maker.account_id,
                    maker_seq: maker.seq,
                    taker_order_id: order.id,
                    taker_account_id: order.account_id,
                    price: level_price,
                    qty: fill_qty,
                    taker_side,
                });

                order.fill(fill_qty);
                maker.fill(fill_qty);

                if maker.remaining_qty.is_zero() {
                    let maker_id = maker.id;
                    let done = opposing.remove(maker_id).expect("maker indexed");
                    filled_makers.push(done);
                }

                if order.remaining_qty.is_zero() {
                    break 'matching;
                }
            }
        }

        MatchOutcome {
            fills,
            remaining_qty: order.remaining_qty,
            filled_makers,
            stp_cancelled,
            taker_stopped_on_self,
        }
    }

    /// Orders whose expire time has passed.
    pub fn expired_orders(&self, now: Timestamp) -> Vec<OrderId> {
        self.iter_orders()
            .filter(|o| o.is_expired_at(now))
            .map(|o| o.id)
            .collect()
    }

    fn side_levels(side: &BookSide, best_first_descending: bool, max: usize) -> Vec<DepthLevel> {
        let collect = |iter: &mut dyn Iterator<Item = (&Price, &VecDeque<Order>)>| {
            iter.take(max)
                .map(|(price, level)| DepthLevel {
                    price: *price,
                    qty: level.iter().map(|o| o.remaining_qty).sum(),
                    order_count: level.len(),
                })
                .collect()
        };
        if best_first_descending {
            collect(&mut side.levels.iter().rev())
        } else {
            collect(&mut side.levels.iter())
        }
    }

    /// Aggregate the book into an owned depth view.
    pub fn snapshot(&self, seq: SeqNum, now: Timestamp, max_levels: usize) -> DepthSnapshot {
        DepthSnapshot {
            instrument_id: self.instrument_id,
            seq,
            taken_at: now,
            bids: Self::side_levels(&self.bids, true, max_levels),
            asks: Self::side_levels(&self.asks, false, max_levels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{OrderStatus, OrderType, TimeInForce};
    use rust_decimal_macros::dec;

    fn resting(
        id: u64,
        account: u64,
        side: Side,
        price: Decimal,
        qty: Decimal,
        seq: u64,
    ) -> Order {
        Order {
            id: OrderId(id),
            account_id: AccountId(account),
            instrument_id: InstrumentId(1),
            side,
            order_type: OrderType::Limit,
            qty,
            remaining_qty: qty,
            filled_qty: Decimal::ZERO,
            cancelled_qty: Decimal::ZERO,
            price: Some(Price::new_unchecked(price)),
            time_in_force: TimeInForce::GTC,
            reduce_only: false,
            expire_at: None,
            seq: SeqNum(seq),
            status: OrderStatus::Open,
            created_at: Timestamp::from_millis(seq as i64),
        }
    }

    fn taker(id: u64, account: u64, side: Side, price: Option<Decimal>, qty: Decimal) -> Order {
        Order {
            id: OrderId(id),
            account_id: AccountId(account),
            instrument_id: InstrumentId(1),
            side,
            order_type: if price.is_some() {
                OrderType::Limit
            } else {
                OrderType::Market
            },
            qty,
            remaining_qty: qty,
            filled_qty: Decimal::ZERO,
            cancelled_qty: Decimal::ZERO,
            price: price.map(Price::new_unchecked),
            time_in_force: TimeInForce::GTC,
            reduce_only: false,
            expire_at: None,
            seq: SeqNum(id),
            status: OrderStatus::Open,
            created_at: Timestamp::from_millis(id as i64),
        }
    }

    #[test]
    fn empty_book() {
        let book = OrderBook::new(InstrumentId(1));
        assert!(book.is_empty());
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
    }

    #[test]
    fn insert_and_best_prices() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 1, Side::Buy, dec!(50000), dec!(1), 1));
        book.insert(resting(2, 2, Side::Sell, dec!(50100), dec!(1), 2));

        assert_eq!(book.best_bid().unwrap().value(), dec!(50000));
        assert_eq!(book.best_ask().unwrap().value(), dec!(50100));
        assert_eq!(book.spread().unwrap(), dec!(100));
        assert!(!book.is_crossed());
    }

    #[test]
    fn sequence_priority_within_level() {
        let mut book = OrderBook::new(InstrumentId(1));
        // same price, inserted in acceptance order
        book.insert(resting(1, 1, Side::Sell, dec!(50000), dec!(1), 10));
        book.insert(resting(2, 2, Side::Sell, dec!(50000), dec!(1), 11));
        book.insert(resting(3, 3, Side::Sell, dec!(49900), dec!(1), 12));

        let mut buy = taker(4, 9, Side::Buy, None, dec!(2.5));
        let outcome = book.match_order(&mut buy, SelfTradePolicy::CancelTaker);

        // best price first, then FIFO at the worse level
        assert_eq!(outcome.fills.len(), 3);
        assert_eq!(outcome.fills[0].maker_order_id, OrderId(3));
        assert_eq!(outcome.fills[1].maker_order_id, OrderId(1));
        assert_eq!(outcome.fills[2].maker_order_id, OrderId(2));
        assert_eq!(outcome.fills[2].qty, dec!(0.5));
    }

    #[test]
    fn fills_at_maker_price() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 1, Side::Sell, dec!(50000), dec!(1), 1));

        let mut buy = taker(2, 9, Side::Buy, Some(dec!(50100)), dec!(0.5));
        let outcome = book.match_order(&mut buy, SelfTradePolicy::CancelTaker);

        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(outcome.fills[0].price.value(), dec!(50000));
        assert!(outcome.fully_filled());
    }

    #[test]
    fn limit_does_not_cross_through_its_price() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 1, Side::Sell, dec!(50000), dec!(1), 1));

        let mut buy = taker(2, 9, Side::Buy, Some(dec!(49900)), dec!(1));
        let outcome = book.match_order(&mut buy, SelfTradePolicy::CancelTaker);

        assert!(outcome.fills.is_empty());
        assert_eq!(outcome.remaining_qty, dec!(1));
    }

    #[test]
    fn cancel_taker_stops_at_own_order() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 7, Side::Sell, dec!(50000), dec!(1), 1));
        book.insert(resting(2, 9, Side::Sell, dec!(50100), dec!(1), 2)); // own
        book.insert(resting(3, 8, Side::Sell, dec!(50200), dec!(1), 3));

        let mut buy = taker(4, 9, Side::Buy, None, dec!(3));
        let outcome = book.match_order(&mut buy, SelfTradePolicy::CancelTaker);

        assert_eq!(outcome.fills.len(), 1);
        assert!(outcome.taker_stopped_on_self);
        assert_eq!(outcome.remaining_qty, dec!(2));
        // own order still resting
        assert!(book.get(OrderId(2)).is_some());
        assert!(book.get(OrderId(3)).is_some());
    }

    #[test]
    fn cancel_resting_removes_own_and_continues() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 9, Side::Sell, dec!(50000), dec!(1), 1)); // own
        book.insert(resting(2, 7, Side::Sell, dec!(50100), dec!(1), 2));

        let mut buy = taker(3, 9, Side::Buy, None, dec!(1));
        let outcome = book.match_order(&mut buy, SelfTradePolicy::CancelResting);

        assert_eq!(outcome.stp_cancelled.len(), 1);
        assert_eq!(outcome.stp_cancelled[0].id, OrderId(1));
        assert_eq!(outcome.fills.len(), 1);
        assert_eq!(outcome.fills[0].maker_order_id, OrderId(2));
        assert!(book.get(OrderId(1)).is_none());
    }

    #[test]
    fn fillable_qty_respects_limit_and_self() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 7, Side::Sell, dec!(50000), dec!(1), 1));
        book.insert(resting(2, 9, Side::Sell, dec!(50100), dec!(2), 2)); // own
        book.insert(resting(3, 8, Side::Sell, dec!(50200), dec!(2), 3));

        // CancelTaker: scan stops at the own order
        let q = book.fillable_qty(
            Side::Buy,
            None,
            AccountId(9),
            SelfTradePolicy::CancelTaker,
            dec!(5),
        );
        assert_eq!(q, dec!(1));

        // CancelResting: own order is skipped, the rest counts
        let q = book.fillable_qty(
            Side::Buy,
            None,
            AccountId(9),
            SelfTradePolicy::CancelResting,
            dec!(5),
        );
        assert_eq!(q, dec!(3));

        // limit stops the scan below the worst level
        let q = book.fillable_qty(
            Side::Buy,
            Some(Price::new_unchecked(dec!(50000))),
            AccountId(5),
            SelfTradePolicy::CancelTaker,
            dec!(5),
        );
        assert_eq!(q, dec!(1));
    }

    #[test]
    fn worst_fill_price_walks_the_reachable_levels() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 1, Side::Buy, dec!(49900), dec!(1), 1));
        book.insert(resting(2, 2, Side::Sell, dec!(50000), dec!(1), 2));
        book.insert(resting(3, 3, Side::Sell, dec!(50200), dec!(1), 3));

        // a sell's worst price is the best bid, regardless of quantity
        assert_eq!(
            book.worst_fill_price(Side::Sell, dec!(5)).unwrap().value(),
            dec!(49900)
        );

        // a small buy stops at the best ask
        assert_eq!(
            book.worst_fill_price(Side::Buy, dec!(1)).unwrap().value(),
            dec!(50000)
        );
        // a deeper buy reaches the second level
        assert_eq!(
            book.worst_fill_price(Side::Buy, dec!(1.5)).unwrap().value(),
            dec!(50200)
        );
        // quantity beyond all liquidity still prices at the deepest level
        assert_eq!(
            book.worst_fill_price(Side::Buy, dec!(10)).unwrap().value(),
            dec!(50200)
        );

        let empty = OrderBook::new(InstrumentId(1));
        assert!(empty.worst_fill_price(Side::Buy, dec!(1)).is_none());
    }

    #[test]
    fn remove_and_get() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 1, Side::Buy, dec!(50000), dec!(1), 1));
        assert_eq!(book.order_count(), 1);
        assert!(book.get(OrderId(1)).is_some());

        let removed = book.remove(OrderId(1));
        assert!(removed.is_some());
        assert!(book.is_empty());
        assert!(book.remove(OrderId(1)).is_none());
    }

    #[test]
    fn depth_snapshot_aggregates_levels() {
        let mut book = OrderBook::new(InstrumentId(1));
        book.insert(resting(1, 1, Side::Buy, dec!(50000), dec!(1), 1));
        book.insert(resting(2, 2, Side::Buy, dec!(50000), dec!(2), 2));
        book.insert(resting(3, 3, Side::Buy, dec!(49900), dec!(1), 3));
        book.insert(resting(4, 4, Side::Sell, dec!(50100), dec!(1), 4));

        let snap = book.snapshot(SeqNum(10), Timestamp::from_millis(0), 10);
        assert_eq!(snap.bids.len(), 2);
        assert_eq!(snap.bids[0].price.value(), dec!(50000));
        assert_eq!(snap.bids[0].qty, dec!(3));
        assert_eq!(snap.bids[0].order_count, 2);
        assert_eq!(snap.bids[1].price.value(), dec!(49900));
        assert_eq!(snap.best_ask().unwrap().value(), dec!(50100));
    }

    #[test]
    fn expired_orders_found() {
        let mut book = OrderBook::new(InstrumentId(1));
        let mut gtd = resting(1, 1, Side::Buy, dec!(50000), dec!(1), 1);
        gtd.expire_at = Some(Timestamp::from_millis(100));
        book.insert(gtd);
        book.insert(resting(2, 2, Side::Buy, dec!(49000), dec!(1), 2));

        assert!(book.expired_orders(Timestamp::from_millis(50)).is_empty());
        assert_eq!(
            book.expired_orders(Timestamp::from_millis(100)),
            vec![OrderId(1)]
        );
    }
}
