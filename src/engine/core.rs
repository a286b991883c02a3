// 8.0: per-instrument engine. Single writer: one engine instance owns the
// book, the stop queue and the event log for its instrument, so every
// method takes &mut self and there is no internal locking. The shared
// ledger and market view are the only cross-instrument state it touches.

use crate::book::{DepthSnapshot, OrderBook};
use crate::config::{ExchangeConfig, SelfTradePolicy};
use crate::engine::results::{EngineError, ExecutionReport};
use crate::events::{Event, EventLog, EventPayload, HaltReason, InstrumentHaltedEvent};
use crate::instrument::Instrument;
use crate::ledger::{Ledger, MarketView};
use crate::order::Order;
use crate::types::{AccountId, IdempotencyKey, OrderId, Price, SeqNum, Timestamp, TradeId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::info;

/// 8.1: engine state for one instrument.
pub struct InstrumentEngine {
    pub(super) instrument: Instrument,
    pub(super) book: OrderBook,
    /// Stop orders parked off-book until their trigger is touched.
    pub(super) stops: Vec<Order>,
    pub(super) halted: Option<HaltReason>,
    pub(super) events: EventLog,
    pub(super) ledger: Arc<Ledger>,
    pub(super) view: Arc<dyn MarketView>,
    pub(super) self_trade_policy: SelfTradePolicy,
    pub(super) last_mark: Option<Price>,
    /// Cached outcomes for deduped submits. Only successful executions are
    /// cached; a rejected submit may be retried with the same key. Bounded
    /// like the event log: past the cap the oldest entries are dropped.
    pub(super) idempotency: HashMap<(AccountId, IdempotencyKey), ExecutionReport>,
    idempotency_order: VecDeque<(AccountId, IdempotencyKey)>,
    /// Terminal orders kept for cancel acknowledgements, oldest-first
    /// eviction past the cap.
    pub(super) finished: HashMap<OrderId, Order>,
    finished_order: VecDeque<OrderId>,
    max_order_history: usize,
    pub(super) next_order_id: u64,
    pub(super) next_trade_id: u64,
    pub(super) next_order_seq: SeqNum,
}

impl InstrumentEngine {
    pub fn new(
        instrument: Instrument,
        config: &ExchangeConfig,
        ledger: Arc<Ledger>,
        view: Arc<dyn MarketView>,
    ) -> Self {
        let instrument_id = instrument.id;
        Self {
            instrument,
            book: OrderBook::new(instrument_id),
            stops: Vec::new(),
            halted: None,
            events: EventLog::new(instrument_id, config.max_events_per_instrument),
            ledger,
            view,
            self_trade_policy: config.self_trade_policy,
            last_mark: None,
            idempotency: HashMap::new(),
            idempotency_order: VecDeque::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            max_order_history: config.max_order_history,
            next_order_id: 1,
            next_trade_id: 1,
            next_order_seq: SeqNum(1),
        }
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halted
    }

    pub fn last_mark(&self) -> Option<Price> {
        self.last_mark
    }

    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        self.book
            .get(order_id)
            .or_else(|| self.stops.iter().find(|o| o.id == order_id))
            .or_else(|| self.finished.get(&order_id))
    }

    pub fn open_order_count(&self) -> usize {
        self.book.order_count() + self.stops.len()
    }

    /// Suspend trading. The first halt reason wins; an already halted
    /// instrument keeps its original reason.
    pub fn halt(&mut self, reason: HaltReason, now: Timestamp) {
        if self.halted.is_some() {
            return;
        }
        self.halted = Some(reason);
        info!(
            instrument = self.instrument.id.0,
            ?reason,
            "instrument halted"
        );
        self.emit(
            now,
            EventPayload::InstrumentHalted(InstrumentHaltedEvent { reason }),
        );
    }

    pub fn resume(&mut self, now: Timestamp) {
        if self.halted.take().is_some() {
            info!(instrument = self.instrument.id.0, "instrument resumed");
            self.emit(now, EventPayload::InstrumentResumed);
        }
    }

    /// Swap in an updated spec at a cycle boundary. A spec carrying a
    /// non-active status halts the instrument; a spec going back to active
    /// clears an administrative halt but never an oracle one.
    pub fn update_instrument(&mut self, instrument: Instrument, now: Timestamp) {
        let active = instrument.is_active();
        self.instrument = instrument;
        self.emit(now, EventPayload::InstrumentUpdated);
        if !active {
            self.halt(HaltReason::Administrative, now);
        } else if self.halted == Some(HaltReason::Administrative) {
            self.resume(now);
        }
    }

    pub fn depth(&self, now: Timestamp, max_levels: usize) -> DepthSnapshot {
        self.book.snapshot(self.events.next_seq(), now, max_levels)
    }

    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.events()
    }

    pub fn events_from(&self, from: SeqNum) -> impl Iterator<Item = &Event> {
        self.events.events_from(from)
    }

    pub fn first_retained_event(&self) -> Option<SeqNum> {
        self.events.first_retained()
    }

    pub(crate) fn emit(&mut self, now: Timestamp, payload: EventPayload) -> SeqNum {
        self.events.append(now, payload)
    }

    /// Retain a terminal order, evicting the oldest past the cap.
    pub(super) fn record_finished(&mut self, order: Order) {
        if self.finished.len() >= self.max_order_history {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
        self.finished_order.push_back(order.id);
        self.finished.insert(order.id, order);
    }

    /// Cache a deduped submit outcome, evicting the oldest past the cap.
    pub(super) fn cache_report(
        &mut self,
        account_id: AccountId,
        key: IdempotencyKey,
        report: ExecutionReport,
    ) {
        if self.idempotency.len() >= self.max_order_history {
            if let Some(oldest) = self.idempotency_order.pop_front() {
                self.idempotency.remove(&oldest);
            }
        }
        self.idempotency_order.push_back((account_id, key));
        self.idempotency.insert((account_id, key), report);
    }

    pub(super) fn alloc_order_id(&mut self) -> OrderId {
        let id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        id
    }

    pub(super) fn alloc_trade_id(&mut self) -> TradeId {
        let id = TradeId(self.next_trade_id);
        self.next_trade_id += 1;
        id
    }

    pub(super) fn alloc_order_seq(&mut self) -> Result<SeqNum, EngineError> {
        let seq = self.next_order_seq;
        self.next_order_seq = seq.next().ok_or(EngineError::SequenceExhausted)?;
        Ok(seq)
    }
}
