// 11.0: every state change produces an event. the feed is per instrument,
// gap-free and sequence numbered, so a consumer that replays it from the
// start reconstructs the externally visible state.

use crate::ledger::{FundingCharge, LedgerUpdate};
use crate::order::OrderStatus;
use crate::risk::PositionHealth;
use crate::types::{
    AccountId, InstrumentId, OrderId, Price, Quote, SeqNum, Side, SignedQty, Timestamp, TradeId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub instrument_id: InstrumentId,
    pub seq: SeqNum,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // order lifecycle
    OrderAccepted(OrderAcceptedEvent),
    OrderStatusChanged(OrderStatusChangedEvent),

    // executions
    TradeExecuted(TradeEvent),
    LedgerUpdated(LedgerUpdate),

    // prices and funding
    MarkPriceUpdated(MarkPriceUpdatedEvent),
    FundingApplied(FundingAppliedEvent),

    // risk
    PositionStateChanged(PositionStateChangedEvent),
    LiquidationOrderPlaced(LiquidationOrderPlacedEvent),
    LiquidationEscalated(LiquidationEscalatedEvent),

    // instrument lifecycle
    InstrumentHalted(InstrumentHaltedEvent),
    InstrumentResumed,
    InstrumentUpdated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAcceptedEvent {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub side: Side,
    pub qty: Decimal,
    pub price: Option<Price>,
    /// Priority sequence assigned at acceptance.
    pub order_seq: SeqNum,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusChangedEvent {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub status: OrderStatus,
    pub reason: StatusReason,
    pub filled_qty: Decimal,
    pub cancelled_qty: Decimal,
}

/// Why an order left (or partially left) the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusReason {
    Filled,
    UserRequested,
    SelfTradePrevention,
    PostOnlyWouldTake,
    FillOrKillUnfillable,
    ImmediateOrCancelRemainder,
    MarketRemainder,
    InsufficientMargin,
    Expired,
    Replaced,
    StopTriggered,
    Liquidation,
    InstrumentHalted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub trade_id: TradeId,
    pub maker_order_id: OrderId,
    pub maker_account_id: AccountId,
    pub taker_order_id: OrderId,
    pub taker_account_id: AccountId,
    pub price: Price,
    pub qty: Decimal,
    pub taker_side: Side,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPriceUpdatedEvent {
    pub price: Price,
    pub observed_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingAppliedEvent {
    pub rate: Decimal,
    pub charges: Vec<FundingCharge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionStateChangedEvent {
    pub account_id: AccountId,
    pub health: PositionHealth,
    pub margin_ratio: Decimal,
    pub equity: Quote,
    pub maintenance: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationOrderPlacedEvent {
    pub account_id: AccountId,
    pub order_id: OrderId,
    pub side: Side,
    pub qty: Decimal,
    pub attempt: u32,
}

/// The order book could not absorb the liquidation; the position is handed
/// to the deleveraging queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEscalatedEvent {
    pub account_id: AccountId,
    pub remaining_size: SignedQty,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentHaltedEvent {
    pub reason: HaltReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    OracleStale,
    Administrative,
}

/// Per-instrument append-only event buffer. Sequence numbers are dense:
/// `seq` of the nth appended event is n, counting from 1, even after old
/// events are dropped to honor the cap.
#[derive(Debug)]
pub struct EventLog {
    instrument_id: InstrumentId,
    events: VecDeque<Event>,
    next_seq: u64,
    cap: usize,
}

impl EventLog {
    pub fn new(instrument_id: InstrumentId, cap: usize) -> Self {
        Self {
            instrument_id,
            events: VecDeque::new(),
            next_seq: 1,
            cap,
        }
    }

    pub fn append(&mut self, timestamp: Timestamp, payload: EventPayload) -> SeqNum {
        let seq = SeqNum(self.next_seq);
        self.next_seq += 1;
        self.events.push_back(Event {
            instrument_id: self.instrument_id,
            seq,
            timestamp,
            payload,
        });
        while self.events.len() > self.cap {
            self.events.pop_front();
        }
        seq
    }

    /// Sequence the next appended event will get.
    pub fn next_seq(&self) -> SeqNum {
        SeqNum(self.next_seq)
    }

    /// Oldest sequence still retained.
    pub fn first_retained(&self) -> Option<SeqNum> {
        self.events.front().map(|e| e.seq)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Events at or after `from`, for replay.
    pub fn events_from(&self, from: SeqNum) -> impl Iterator<Item = &Event> {
        self.events.iter().skip_while(move |e| e.seq < from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn payload() -> EventPayload {
        EventPayload::MarkPriceUpdated(MarkPriceUpdatedEvent {
            price: Price::new_unchecked(dec!(50000)),
            observed_at: Timestamp::from_millis(0),
        })
    }

    #[test]
    fn sequence_is_dense_and_monotone() {
        let mut log = EventLog::new(InstrumentId(1), 100);
        for _ in 0..5 {
            log.append(Timestamp::from_millis(0), payload());
        }
        let seqs: Vec<u64> = log.events().map(|e| e.seq.0).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.next_seq(), SeqNum(6));
    }

    #[test]
    fn cap_drops_oldest_without_renumbering() {
        let mut log = EventLog::new(InstrumentId(1), 3);
        for _ in 0..5 {
            log.append(Timestamp::from_millis(0), payload());
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.first_retained(), Some(SeqNum(3)));
        let seqs: Vec<u64> = log.events().map(|e| e.seq.0).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn events_from_skips_earlier() {
        let mut log = EventLog::new(InstrumentId(1), 100);
        for _ in 0..5 {
            log.append(Timestamp::from_millis(0), payload());
        }
        let seqs: Vec<u64> = log.events_from(SeqNum(3)).map(|e| e.seq.0).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn events_serialize() {
        let mut log = EventLog::new(InstrumentId(1), 10);
        log.append(Timestamp::from_millis(1), payload());
        let event = log.events().next().unwrap();
        let json = serde_json::to_string(event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.seq, SeqNum(1));
    }
}
