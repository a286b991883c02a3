// 8.2: order intents. submit, cancel, amend, stop triggering, expiry.
// Everything in here is driven from the instrument's single writer, so
// each intent runs to completion before the next one starts.

use crate::book::Fill;
use crate::engine::core::InstrumentEngine;
use crate::engine::results::{CancelOutcome, EngineError, ExecutionReport};
use crate::events::{
    EventPayload, LiquidationOrderPlacedEvent, MarkPriceUpdatedEvent, OrderAcceptedEvent,
    OrderStatusChangedEvent, StatusReason, TradeEvent,
};
use crate::ledger::{LedgerError, TradeLeg};
use crate::oracle::PricePoint;
use crate::order::{
    AmendOrder, CancelOrder, Order, OrderStatus, OrderType, SubmitOrder, TimeInForce,
};
use crate::types::{AccountId, Price, Side, Timestamp};
use rust_decimal::Decimal;
use tracing::debug;

fn accepted_event(order: &Order) -> EventPayload {
    EventPayload::OrderAccepted(OrderAcceptedEvent {
        order_id: order.id,
        account_id: order.account_id,
        side: order.side,
        qty: order.qty,
        price: order.price,
        order_seq: order.seq,
        reduce_only: order.reduce_only,
    })
}

fn status_event(order: &Order, reason: StatusReason) -> EventPayload {
    EventPayload::OrderStatusChanged(OrderStatusChangedEvent {
        order_id: order.id,
        account_id: order.account_id,
        status: order.status,
        reason,
        filled_qty: order.filled_qty,
        cancelled_qty: order.cancelled_qty,
    })
}

fn report_for(order: &Order, fills: Vec<Fill>) -> ExecutionReport {
    ExecutionReport {
        order_id: order.id,
        status: order.status,
        filled_qty: order.filled_qty,
        remaining_qty: order.remaining_qty,
        avg_price: ExecutionReport::average_price(&fills),
        fills,
    }
}

impl InstrumentEngine {
    /// 8.2.1: place a new order. A repeated submit carrying the same
    /// idempotency key returns the original outcome without executing.
    pub fn submit(
        &mut self,
        intent: SubmitOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        if let Some(key) = intent.idempotency_key {
            if let Some(report) = self.idempotency.get(&(intent.account_id, key)) {
                debug!(
                    instrument = self.instrument.id.0,
                    account = intent.account_id.0,
                    key = key.0,
                    "duplicate submit, replaying cached outcome"
                );
                return Ok(report.clone());
            }
        }
        let report = self.submit_inner(&intent, now, false)?;
        if let Some(key) = intent.idempotency_key {
            self.cache_report(intent.account_id, key, report.clone());
        }
        Ok(report)
    }

    fn submit_inner(
        &mut self,
        intent: &SubmitOrder,
        now: Timestamp,
        liquidation: bool,
    ) -> Result<ExecutionReport, EngineError> {
        // liquidation orders are the one thing a halted instrument accepts
        if !liquidation {
            if self.is_halted() {
                return Err(EngineError::InstrumentHalted(self.instrument.id));
            }
            if !self.instrument.is_active() {
                return Err(EngineError::InstrumentNotTradable(self.instrument.id));
            }
        }

        self.instrument.validate_qty(intent.qty)?;
        match intent.order_type {
            OrderType::Limit => {
                let price = intent.price.ok_or(EngineError::MissingPrice)?;
                self.instrument.validate_price(price)?;
            }
            OrderType::Market => {}
            OrderType::Stop { trigger } => self.instrument.validate_price(trigger)?,
        }
        if intent.time_in_force == TimeInForce::GTD && intent.expire_at.is_none() {
            return Err(EngineError::MissingExpiry);
        }

        if intent.reduce_only && !liquidation {
            self.check_reduce_only(intent)?;
        }

        // margin at acceptance, priced at the worst fill the order could
        // see: a buy never fills above its limit, a sell limit can fill up
        // at the best bid, and a market order walks the book. Settlement
        // can then never require more margin than was verified here.
        // Reduce-only never needs new margin.
        if !intent.reduce_only && !liquidation {
            let ref_price = match (intent.order_type, intent.price, intent.side) {
                (OrderType::Limit, Some(limit), Side::Buy) => Some(limit),
                (OrderType::Limit, Some(limit), Side::Sell) => Some(
                    self.book
                        .best_opposing(Side::Sell)
                        .filter(|bid| *bid > limit)
                        .unwrap_or(limit),
                ),
                _ => self
                    .book
                    .worst_fill_price(intent.side, intent.qty)
                    .or_else(|| self.view.mark_price(self.instrument.id)),
            };
            let ref_price = ref_price
                .ok_or(EngineError::Ledger(LedgerError::NoMarkPrice(self.instrument.id)))?;
            self.ledger.check_initial_margin(
                intent.account_id,
                &self.instrument,
                intent.side,
                intent.qty,
                ref_price,
                self.view.as_ref(),
            )?;
        }

        if intent.time_in_force == TimeInForce::PostOnly {
            let limit = intent.price.ok_or(EngineError::MissingPrice)?;
            let would_take = match self.book.best_opposing(intent.side) {
                Some(best) => match intent.side {
                    Side::Buy => limit >= best,
                    Side::Sell => limit <= best,
                },
                None => false,
            };
            if would_take {
                return Err(EngineError::WouldTakeLiquidity);
            }
        }

        // fill-or-kill pre-scan: all or nothing, the book is untouched on
        // the nothing path
        if intent.time_in_force == TimeInForce::FOK {
            let limit = match intent.order_type {
                OrderType::Limit => intent.price,
                _ => None,
            };
            let fillable = self.book.fillable_qty(
                intent.side,
                limit,
                intent.account_id,
                self.self_trade_policy,
                intent.qty,
            );
            if fillable < intent.qty {
                return Err(EngineError::Unfillable);
            }
        }

        let order = Order {
            id: self.alloc_order_id(),
            account_id: intent.account_id,
            instrument_id: self.instrument.id,
            side: intent.side,
            order_type: intent.order_type,
            qty: intent.qty,
            remaining_qty: intent.qty,
            filled_qty: Decimal::ZERO,
            cancelled_qty: Decimal::ZERO,
            price: intent.price,
            time_in_force: intent.time_in_force,
            reduce_only: intent.reduce_only || liquidation,
            expire_at: intent.expire_at,
            seq: self.alloc_order_seq()?,
            status: OrderStatus::Open,
            created_at: now,
        };

        self.emit(now, accepted_event(&order));

        // stops park off-book until the mark touches the trigger
        if matches!(order.order_type, OrderType::Stop { .. }) {
            let report = report_for(&order, Vec::new());
            self.stops.push(order);
            return Ok(report);
        }

        self.execute(order, now)
    }

    /// Run an order through the match loop, settle its fills, and dispose
    /// of the remainder per time in force.
    fn execute(
        &mut self,
        mut order: Order,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        let outcome = self.book.match_order(&mut order, self.self_trade_policy);

        for fill in &outcome.fills {
            self.settle_fill(fill, now)?;
        }
        for maker in outcome.filled_makers {
            self.emit(now, status_event(&maker, StatusReason::Filled));
            self.record_finished(maker);
        }
        for mut own in outcome.stp_cancelled {
            own.cancel_remaining(OrderStatus::Cancelled);
            self.emit(now, status_event(&own, StatusReason::SelfTradePrevention));
            self.record_finished(own);
        }

        if order.remaining_qty.is_zero() {
            self.emit(now, status_event(&order, StatusReason::Filled));
        } else if outcome.taker_stopped_on_self {
            order.cancel_remaining(OrderStatus::Cancelled);
            self.emit(now, status_event(&order, StatusReason::SelfTradePrevention));
        } else if order.order_type == OrderType::Market {
            // market remainders are cancelled, never rested
            order.cancel_remaining(OrderStatus::Cancelled);
            self.emit(now, status_event(&order, StatusReason::MarketRemainder));
        } else if order.time_in_force == TimeInForce::IOC {
            order.cancel_remaining(OrderStatus::Cancelled);
            self.emit(
                now,
                status_event(&order, StatusReason::ImmediateOrCancelRemainder),
            );
        } else {
            self.book.insert(order.clone());
        }

        let report = report_for(&order, outcome.fills);
        if !order.is_live() {
            self.record_finished(order);
        }
        Ok(report)
    }

    fn settle_fill(&mut self, fill: &Fill, now: Timestamp) -> Result<(), EngineError> {
        let (buy_account, sell_account) = match fill.taker_side {
            Side::Buy => (fill.taker_account_id, fill.maker_account_id),
            Side::Sell => (fill.maker_account_id, fill.taker_account_id),
        };
        let buy = TradeLeg {
            account_id: buy_account,
            side: Side::Buy,
            qty: fill.qty,
            price: fill.price,
        };
        let sell = TradeLeg {
            account_id: sell_account,
            side: Side::Sell,
            qty: fill.qty,
            price: fill.price,
        };
        let (buy_update, sell_update) =
            self.ledger.settle_trade(&self.instrument, buy, sell, now)?;

        let trade_id = self.alloc_trade_id();
        self.emit(
            now,
            EventPayload::TradeExecuted(TradeEvent {
                trade_id,
                maker_order_id: fill.maker_order_id,
                maker_account_id: fill.maker_account_id,
                taker_order_id: fill.taker_order_id,
                taker_account_id: fill.taker_account_id,
                price: fill.price,
                qty: fill.qty,
                taker_side: fill.taker_side,
            }),
        );
        self.emit(now, EventPayload::LedgerUpdated(buy_update));
        self.emit(now, EventPayload::LedgerUpdated(sell_update));
        Ok(())
    }

    fn check_reduce_only(&self, intent: &SubmitOrder) -> Result<(), EngineError> {
        let account = self.ledger.account_snapshot(intent.account_id)?;
        let position = account.position(self.instrument.id);
        let reduces = position
            .and_then(|p| p.size.side())
            .map(|held| held == intent.side.opposite())
            .unwrap_or(false);
        let within = position
            .map(|p| intent.qty <= p.size.abs())
            .unwrap_or(false);
        if !(reduces && within) {
            return Err(EngineError::WouldIncreasePosition);
        }
        Ok(())
    }

    /// 8.2.2: cancel a live order. Allowed while halted.
    pub fn cancel(
        &mut self,
        intent: CancelOrder,
        now: Timestamp,
    ) -> Result<CancelOutcome, EngineError> {
        if let Some(order) = self.book.get(intent.order_id) {
            if order.account_id != intent.account_id {
                return Err(EngineError::NotOrderOwner(intent.order_id));
            }
            let mut order = self.book.remove(intent.order_id).expect("order indexed");
            let had_fills = !order.filled_qty.is_zero();
            order.cancel_remaining(OrderStatus::Cancelled);
            self.emit(now, status_event(&order, StatusReason::UserRequested));
            self.record_finished(order);
            return Ok(if had_fills {
                CancelOutcome::PartiallyFilledThenCancelled
            } else {
                CancelOutcome::Cancelled
            });
        }

        if let Some(idx) = self.stops.iter().position(|o| o.id == intent.order_id) {
            if self.stops[idx].account_id != intent.account_id {
                return Err(EngineError::NotOrderOwner(intent.order_id));
            }
            let mut order = self.stops.remove(idx);
            order.cancel_remaining(OrderStatus::Cancelled);
            self.emit(now, status_event(&order, StatusReason::UserRequested));
            self.record_finished(order);
            return Ok(CancelOutcome::Cancelled);
        }

        if let Some(order) = self.finished.get(&intent.order_id) {
            if order.account_id != intent.account_id {
                return Err(EngineError::NotOrderOwner(intent.order_id));
            }
            return Ok(CancelOutcome::AlreadyFilled);
        }

        Err(EngineError::OrderNotFound(intent.order_id))
    }

    /// 8.2.3: amend a resting order. A pure quantity decrease shrinks the
    /// order in place and keeps its queue position; any price change or
    /// quantity increase is a cancel-replace and the remainder re-enters
    /// with a fresh sequence at the back of its level.
    pub fn amend(
        &mut self,
        intent: AmendOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        if self.is_halted() {
            return Err(EngineError::InstrumentHalted(self.instrument.id));
        }
        let existing = self
            .book
            .get(intent.order_id)
            .ok_or(EngineError::OrderNotFound(intent.order_id))?;
        if existing.account_id != intent.account_id {
            return Err(EngineError::NotOrderOwner(intent.order_id));
        }

        let current_price = existing.price;
        let current_qty = existing.qty;
        let filled = existing.filled_qty;
        let side = existing.side;

        let new_qty = intent.new_qty.unwrap_or(current_qty);
        let new_price = intent.new_price.or(current_price);
        if new_qty <= filled {
            return Err(EngineError::InvalidAmend);
        }
        self.instrument.validate_qty(new_qty - filled)?;
        let new_price_checked = new_price.ok_or(EngineError::MissingPrice)?;
        self.instrument.validate_price(new_price_checked)?;

        if new_price == current_price && new_qty < current_qty {
            let delta = current_qty - new_qty;
            let order = self.book.get_mut(intent.order_id).expect("order present");
            if delta > order.remaining_qty {
                return Err(EngineError::InvalidAmend);
            }
            order.reduce_qty(delta);
            let snapshot = order.clone();
            self.emit(now, status_event(&snapshot, StatusReason::Replaced));
            return Ok(report_for(&snapshot, Vec::new()));
        }
        if new_price == current_price && new_qty == current_qty {
            let snapshot = existing.clone();
            return Ok(report_for(&snapshot, Vec::new()));
        }

        // margin for the replacement, checked before the original is
        // touched so a failed amend leaves the book unchanged. Priced the
        // same way submission will price it, so the resubmit below cannot
        // fail on margin after the original is already gone.
        let replacement_qty = new_qty - filled;
        let existing = self.book.get(intent.order_id).expect("order present");
        if !existing.reduce_only {
            let ref_price = match side {
                Side::Buy => new_price_checked,
                Side::Sell => self
                    .book
                    .best_opposing(Side::Sell)
                    .filter(|bid| *bid > new_price_checked)
                    .unwrap_or(new_price_checked),
            };
            self.ledger.check_initial_margin(
                intent.account_id,
                &self.instrument,
                side,
                replacement_qty,
                ref_price,
                self.view.as_ref(),
            )?;
        }

        let mut old = self.book.remove(intent.order_id).expect("order present");
        old.cancel_remaining(OrderStatus::Cancelled);
        self.emit(now, status_event(&old, StatusReason::Replaced));
        let replacement = SubmitOrder {
            account_id: intent.account_id,
            instrument_id: self.instrument.id,
            side,
            order_type: OrderType::Limit,
            qty: replacement_qty,
            price: Some(new_price_checked),
            time_in_force: old.time_in_force,
            reduce_only: old.reduce_only,
            expire_at: old.expire_at,
            idempotency_key: None,
        };
        self.record_finished(old);
        self.submit_inner(&replacement, now, false)
    }

    /// 8.2.4: apply a mark price observation: record it, emit it, and fire
    /// any stops it triggers. A halted instrument records the price but
    /// keeps its stops parked.
    pub fn apply_mark_price(
        &mut self,
        point: PricePoint,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        self.last_mark = Some(point.price);
        self.emit(
            now,
            EventPayload::MarkPriceUpdated(MarkPriceUpdatedEvent {
                price: point.price,
                observed_at: point.observed_at,
            }),
        );
        if self.is_halted() {
            return Ok(());
        }
        self.trigger_stops(point.price, now)
    }

    fn trigger_stops(&mut self, mark: Price, now: Timestamp) -> Result<(), EngineError> {
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < self.stops.len() {
            let triggered = match self.stops[idx].order_type {
                OrderType::Stop { trigger } => match self.stops[idx].side {
                    // buy stop fires when the mark rises to the trigger,
                    // sell stop when it falls to it
                    Side::Buy => mark >= trigger,
                    Side::Sell => mark <= trigger,
                },
                _ => false,
            };
            if triggered {
                due.push(self.stops.remove(idx));
            } else {
                idx += 1;
            }
        }

        for mut order in due {
            order.order_type = OrderType::Market;
            order.time_in_force = TimeInForce::IOC;
            self.emit(now, status_event(&order, StatusReason::StopTriggered));

            // margin was not reserved while parked; check at trigger time,
            // priced at the worst level the market order can reach
            if !order.reduce_only {
                let ref_price = self
                    .book
                    .worst_fill_price(order.side, order.remaining_qty)
                    .or(self.last_mark);
                let margin_ok = match ref_price {
                    Some(p) => self
                        .ledger
                        .check_initial_margin(
                            order.account_id,
                            &self.instrument,
                            order.side,
                            order.remaining_qty,
                            p,
                            self.view.as_ref(),
                        )
                        .is_ok(),
                    None => false,
                };
                if !margin_ok {
                    order.cancel_remaining(OrderStatus::Rejected);
                    self.emit(now, status_event(&order, StatusReason::InsufficientMargin));
                    self.record_finished(order);
                    continue;
                }
            }
            self.execute(order, now)?;
        }
        Ok(())
    }

    /// 8.2.5: remove orders whose expire time has passed. Runs at cycle
    /// boundaries.
    pub fn expire_due(&mut self, now: Timestamp) {
        for order_id in self.book.expired_orders(now) {
            if let Some(mut order) = self.book.remove(order_id) {
                order.cancel_remaining(OrderStatus::Expired);
                self.emit(now, status_event(&order, StatusReason::Expired));
                self.record_finished(order);
            }
        }
        let mut idx = 0;
        while idx < self.stops.len() {
            if self.stops[idx].is_expired_at(now) {
                let mut order = self.stops.remove(idx);
                order.cancel_remaining(OrderStatus::Expired);
                self.emit(now, status_event(&order, StatusReason::Expired));
                self.record_finished(order);
            } else {
                idx += 1;
            }
        }
    }

    /// 8.2.6: reduce-only market order placed by the risk engine. Bypasses
    /// the halt gate and the margin check: it only sheds exposure.
    pub fn submit_liquidation(
        &mut self,
        account_id: AccountId,
        side: Side,
        qty: Decimal,
        attempt: u32,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        let intent =
            SubmitOrder::market(account_id, self.instrument.id, side, qty).reduce_only();
        let report = self.submit_inner(&intent, now, true)?;
        self.emit(
            now,
            EventPayload::LiquidationOrderPlaced(LiquidationOrderPlacedEvent {
                account_id,
                order_id: report.order_id,
                side,
                qty,
                attempt,
            }),
        );
        Ok(report)
    }
}
