//! Order types and lifecycle bookkeeping.
//!
//! Orders enter as submit intents, get a sequence number at acceptance,
//! and from then on every quantity move is tracked so that
//! `qty == filled + remaining + cancelled` always holds.

use crate::types::{
    AccountId, IdempotencyKey, InstrumentId, OrderId, Price, SeqNum, Side, Timestamp,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order time in force options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till canceled. Remains on book until filled or canceled.
    GTC,
    /// Good till date. As GTC, but expires at the given time.
    GTD,
    /// Immediate or cancel. Fill what is possible, cancel the rest.
    IOC,
    /// Fill or kill. Fill entirely or reject entirely, no partial fills.
    FOK,
    /// Post only. Reject if any part would take liquidity.
    PostOnly,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::GTC
    }
}

/// Order type. The enum is closed: anything else is rejected at the
/// submission boundary, not silently coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Limit order at a specified price.
    Limit,
    /// Market order. Executes at best available prices; any remainder
    /// after available liquidity is cancelled, never rested.
    Market,
    /// Stop order. Parked off-book until mark price touches the trigger,
    /// then enters as a market order.
    Stop { trigger: Price },
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Accepted, nothing executed yet.
    Open,
    /// Some quantity executed, remainder live.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Cancelled with no or partial execution.
    Cancelled,
    /// Rejected at validation or risk check, never accepted.
    Rejected,
    /// Removed at its expire time.
    Expired,
}

/// A trading order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    pub remaining_qty: Decimal,
    pub filled_qty: Decimal,
    pub cancelled_qty: Decimal,
    pub price: Option<Price>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub expire_at: Option<Timestamp>,
    /// Priority sequence, assigned exactly once at acceptance.
    pub seq: SeqNum,
    pub status: OrderStatus,
    pub created_at: Timestamp,
}

impl Order {
    pub fn is_live(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    /// Record an execution against the remaining quantity.
    pub fn fill(&mut self, qty: Decimal) {
        debug_assert!(qty <= self.remaining_qty, "cannot fill more than remaining");
        self.remaining_qty -= qty;
        self.filled_qty += qty;
        self.status = if self.remaining_qty.is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    /// Move the whole remaining quantity to cancelled.
    pub fn cancel_remaining(&mut self, terminal: OrderStatus) {
        self.cancelled_qty += self.remaining_qty;
        self.remaining_qty = Decimal::ZERO;
        self.status = terminal;
    }

    /// Shrink the order by `delta` without losing queue priority.
    pub fn reduce_qty(&mut self, delta: Decimal) {
        debug_assert!(delta <= self.remaining_qty);
        self.qty -= delta;
        self.remaining_qty -= delta;
    }

    /// Quantity conservation check, used by tests and debug assertions.
    pub fn conserves_qty(&self) -> bool {
        self.qty == self.filled_qty + self.remaining_qty + self.cancelled_qty
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expire_at.map_or(false, |t| now >= t)
    }
}

/// Request to place a new order. Everything a client controls; ids and
/// sequence numbers are assigned by the engine at acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOrder {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: Decimal,
    /// Required for limit orders, ignored for market and stop entry.
    pub price: Option<Price>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    /// Required when `time_in_force` is GTD.
    pub expire_at: Option<Timestamp>,
    /// Optional dedup key. Resubmitting with the same key returns the
    /// original outcome instead of placing a second order.
    pub idempotency_key: Option<IdempotencyKey>,
}

impl SubmitOrder {
    pub fn limit(
        account_id: AccountId,
        instrument_id: InstrumentId,
        side: Side,
        qty: Decimal,
        price: Price,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            account_id,
            instrument_id,
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(price),
            time_in_force,
            reduce_only: false,
            expire_at: None,
            idempotency_key: None,
        }
    }

    pub fn market(
        account_id: AccountId,
        instrument_id: InstrumentId,
        side: Side,
        qty: Decimal,
    ) -> Self {
        Self {
            account_id,
            instrument_id,
            side,
            order_type: OrderType::Market,
            qty,
            price: None,
            time_in_force: TimeInForce::IOC,
            reduce_only: false,
            expire_at: None,
            idempotency_key: None,
        }
    }

    pub fn stop(
        account_id: AccountId,
        instrument_id: InstrumentId,
        side: Side,
        qty: Decimal,
        trigger: Price,
    ) -> Self {
        Self {
            account_id,
            instrument_id,
            side,
            order_type: OrderType::Stop { trigger },
            qty,
            price: None,
            time_in_force: TimeInForce::GTC,
            reduce_only: false,
            expire_at: None,
            idempotency_key: None,
        }
    }

    pub fn with_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }

    pub fn expiring_at(mut self, at: Timestamp) -> Self {
        self.time_in_force = TimeInForce::GTD;
        self.expire_at = Some(at);
        self
    }
}

/// Request to cancel a live order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelOrder {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub order_id: OrderId,
}

/// Request to amend a live order. A pure quantity decrease keeps queue
/// priority; any price change or quantity increase is a cancel-replace
/// and the order goes to the back of its level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AmendOrder {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub order_id: OrderId,
    pub new_qty: Option<Decimal>,
    pub new_price: Option<Price>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_order(qty: Decimal) -> Order {
        Order {
            id: OrderId(1),
            account_id: AccountId(1),
            instrument_id: InstrumentId(1),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty,
            remaining_qty: qty,
            filled_qty: Decimal::ZERO,
            cancelled_qty: Decimal::ZERO,
            price: Some(Price::new_unchecked(dec!(50000))),
            time_in_force: TimeInForce::GTC,
            reduce_only: false,
            expire_at: None,
            seq: SeqNum(1),
            status: OrderStatus::Open,
            created_at: Timestamp::from_millis(0),
        }
    }

    #[test]
    fn fill_moves_qty_and_status() {
        let mut order = open_order(dec!(2));
        order.fill(dec!(0.5));
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.remaining_qty, dec!(1.5));
        assert!(order.conserves_qty());

        order.fill(dec!(1.5));
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(order.conserves_qty());
    }

    #[test]
    fn cancel_after_partial_fill_conserves() {
        let mut order = open_order(dec!(2));
        order.fill(dec!(0.7));
        order.cancel_remaining(OrderStatus::Cancelled);
        assert_eq!(order.filled_qty, dec!(0.7));
        assert_eq!(order.cancelled_qty, dec!(1.3));
        assert_eq!(order.remaining_qty, Decimal::ZERO);
        assert!(order.conserves_qty());
    }

    #[test]
    fn reduce_qty_keeps_conservation() {
        let mut order = open_order(dec!(3));
        order.fill(dec!(1));
        order.reduce_qty(dec!(1));
        assert_eq!(order.qty, dec!(2));
        assert_eq!(order.remaining_qty, dec!(1));
        assert!(order.conserves_qty());
    }

    #[test]
    fn gtd_expiry_check() {
        let mut order = open_order(dec!(1));
        order.expire_at = Some(Timestamp::from_millis(1_000));
        assert!(!order.is_expired_at(Timestamp::from_millis(999)));
        assert!(order.is_expired_at(Timestamp::from_millis(1_000)));
    }
}
