//! Exchange assembly: the shared market view, the per-instrument unit
//! (engine plus risk sweep), and the single-threaded facade over both.
//!
//! Concurrency model: each instrument has exactly one writer. A unit owns
//! its engine and risk state outright; the ledger and market view are the
//! only shared pieces, and both are internally synchronized. The facade
//! here drives units inline; `pipeline` moves each unit onto its own
//! thread without changing any of this logic.

use crate::config::{ConfigError, ExchangeConfig};
use crate::engine::{CancelOutcome, EngineError, ExecutionReport, InstrumentEngine};
use crate::events::{
    Event, EventPayload, FundingAppliedEvent, HaltReason, LiquidationEscalatedEvent,
    PositionStateChangedEvent,
};
use crate::funding::{clamp_rate, FundingParams};
use crate::instrument::{Instrument, InstrumentError, InstrumentRegistry, InstrumentStatus};
use crate::ledger::{Account, FundingCharge, Ledger, LedgerError, MarketView, PositionMargin};
use crate::oracle::{MarkPriceCache, OracleAdapter, OracleError, PricePoint};
use crate::order::{AmendOrder, CancelOrder, SubmitOrder};
use crate::risk::{PositionHealth, RiskAction, RiskEngine};
use crate::types::{AccountId, InstrumentId, MarginMode, Price, Quote, SeqNum, Timestamp};
use crate::book::DepthSnapshot;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Mark prices and instrument specs, shared read-mostly across all
/// instrument workers and the ledger.
#[derive(Default)]
pub struct SharedMarketView {
    marks: MarkPriceCache,
    instruments: DashMap<InstrumentId, Instrument>,
}

impl SharedMarketView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_instrument(&self, instrument: Instrument) {
        self.instruments.insert(instrument.id, instrument);
    }

    pub fn record_mark(&self, id: InstrumentId, point: PricePoint) {
        self.marks.update(id, point);
    }

    pub fn latest_mark(&self, id: InstrumentId) -> Option<PricePoint> {
        self.marks.latest(id)
    }

    pub fn fresh_mark(
        &self,
        id: InstrumentId,
        now: Timestamp,
        staleness_ms: i64,
    ) -> Result<Price, OracleError> {
        self.marks.fresh(id, now, staleness_ms)
    }
}

impl MarketView for SharedMarketView {
    fn mark_price(&self, id: InstrumentId) -> Option<Price> {
        self.marks.latest(id).map(|point| point.price)
    }

    fn instrument(&self, id: InstrumentId) -> Option<Instrument> {
        self.instruments.get(&id).map(|entry| entry.value().clone())
    }
}

/// One instrument's full processing state: matching engine plus risk
/// engine, driven by a single writer.
pub struct InstrumentUnit {
    config: ExchangeConfig,
    funding: FundingParams,
    engine: InstrumentEngine,
    risk: RiskEngine,
    ledger: Arc<Ledger>,
    view: Arc<SharedMarketView>,
}

impl InstrumentUnit {
    pub(crate) fn new(
        instrument: Instrument,
        config: &ExchangeConfig,
        ledger: Arc<Ledger>,
        view: Arc<SharedMarketView>,
    ) -> Self {
        let instrument_id = instrument.id;
        let engine = InstrumentEngine::new(
            instrument,
            config,
            Arc::clone(&ledger),
            Arc::clone(&view) as Arc<dyn MarketView>,
        );
        Self {
            config: config.clone(),
            funding: FundingParams::default(),
            engine,
            risk: RiskEngine::new(
                instrument_id,
                config.liquidation_backoff,
                config.liquidation_buffer,
            ),
            ledger,
            view,
        }
    }

    pub fn instrument_id(&self) -> InstrumentId {
        self.engine.instrument().id
    }

    pub fn engine(&self) -> &InstrumentEngine {
        &self.engine
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn submit(
        &mut self,
        intent: SubmitOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        self.engine.submit(intent, now)
    }

    pub fn cancel(
        &mut self,
        intent: CancelOrder,
        now: Timestamp,
    ) -> Result<CancelOutcome, EngineError> {
        self.engine.cancel(intent, now)
    }

    pub fn amend(
        &mut self,
        intent: AmendOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        self.engine.amend(intent, now)
    }

    pub fn depth(&self, now: Timestamp) -> DepthSnapshot {
        self.engine.depth(now, self.config.depth_levels)
    }

    pub fn events_from(&self, from: SeqNum) -> Vec<Event> {
        self.engine.events_from(from).cloned().collect()
    }

    /// A fresh mark observation: record it, re-check staleness, fire
    /// stops, then sweep every position's health.
    pub fn on_mark_price(
        &mut self,
        point: PricePoint,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        let id = self.instrument_id();
        self.view.record_mark(id, point);
        self.enforce_staleness(now);
        self.engine.apply_mark_price(point, now)?;
        self.risk_sweep(point.price, now)
    }

    /// Halt when the best available observation is stale; clear an oracle
    /// halt once a fresh one arrives. Administrative halts are untouched.
    pub fn enforce_staleness(&mut self, now: Timestamp) {
        let id = self.instrument_id();
        match self
            .view
            .fresh_mark(id, now, self.config.oracle_staleness_ms)
        {
            Ok(_) => {
                if self.engine.halt_reason() == Some(HaltReason::OracleStale) {
                    self.engine.resume(now);
                }
            }
            Err(OracleError::Stale { .. }) => {
                self.engine.halt(HaltReason::OracleStale, now);
            }
            // nothing observed yet: no positions can exist either
            Err(OracleError::NoPrice(_)) => {}
        }
    }

    fn risk_sweep(&mut self, mark: Price, now: Timestamp) -> Result<(), EngineError> {
        let id = self.instrument_id();
        let mm_rate = self.engine.instrument().maintenance_margin_rate;
        let lot_size = self.engine.instrument().lot_size;

        let positions = self.ledger.positions_in(id);
        let open: HashSet<AccountId> = positions.iter().map(|(a, _)| *a).collect();

        // tracked accounts whose position is gone end their episode
        for account_id in self.risk.tracked_accounts() {
            if !open.contains(&account_id) {
                if let Some(action) = self.risk.position_closed(account_id) {
                    self.apply_risk_action(action, now)?;
                }
            }
        }

        for (account_id, _) in positions {
            let margin = self
                .ledger
                .position_health(account_id, id, self.view.as_ref())?;
            let Some(margin) = margin else { continue };
            let actions = self
                .risk
                .evaluate(account_id, &margin, mark, mm_rate, lot_size, now);
            for action in actions {
                self.apply_risk_action(action, now)?;
            }
        }
        Ok(())
    }

    fn apply_risk_action(
        &mut self,
        action: RiskAction,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        match action {
            RiskAction::StateChanged {
                account_id,
                health,
                margin,
            } => {
                self.emit_position_state(account_id, health, &margin, now);
            }
            RiskAction::PlaceLiquidation {
                account_id,
                side,
                qty,
                attempt,
            } => {
                self.engine
                    .submit_liquidation(account_id, side, qty, attempt, now)?;
            }
            RiskAction::Escalate {
                account_id,
                remaining_size,
                attempts,
            } => {
                warn!(
                    instrument = self.instrument_id().0,
                    account = account_id.0,
                    remaining = %remaining_size,
                    "handing position to the deleveraging queue"
                );
                self.engine.emit(
                    now,
                    EventPayload::LiquidationEscalated(LiquidationEscalatedEvent {
                        account_id,
                        remaining_size,
                        attempts,
                    }),
                );
            }
        }
        Ok(())
    }

    fn emit_position_state(
        &mut self,
        account_id: AccountId,
        health: PositionHealth,
        margin: &PositionMargin,
        now: Timestamp,
    ) {
        self.engine.emit(
            now,
            EventPayload::PositionStateChanged(PositionStateChangedEvent {
                account_id,
                health,
                margin_ratio: margin.ratio,
                equity: margin.equity,
                maintenance: margin.maintenance,
            }),
        );
    }

    /// Apply a funding rate to every holder of the instrument.
    pub fn apply_funding(
        &mut self,
        rate: Decimal,
        now: Timestamp,
    ) -> Result<Vec<FundingCharge>, EngineError> {
        let clamped = clamp_rate(rate, &self.funding);
        let id = self.instrument_id();
        let charges = self.ledger.apply_funding(id, clamped, self.view.as_ref())?;
        self.engine.emit(
            now,
            EventPayload::FundingApplied(FundingAppliedEvent {
                rate: clamped,
                charges: charges.clone(),
            }),
        );
        Ok(charges)
    }

    /// Cycle boundary: swap in a staged spec if one applied, then expire
    /// due orders.
    pub fn end_cycle(&mut self, now: Timestamp, updated: Option<Instrument>) {
        if let Some(instrument) = updated {
            self.view.publish_instrument(instrument.clone());
            self.engine.update_instrument(instrument, now);
        }
        self.engine.expire_due(now);
    }
}

/// Single-threaded exchange facade. Owns the registry, the shared ledger
/// and view, the oracle, and one unit per listed instrument.
pub struct Exchange {
    config: ExchangeConfig,
    registry: InstrumentRegistry,
    ledger: Arc<Ledger>,
    view: Arc<SharedMarketView>,
    oracle: Arc<dyn OracleAdapter>,
    units: HashMap<InstrumentId, InstrumentUnit>,
}

impl Exchange {
    pub fn new(
        config: ExchangeConfig,
        oracle: Arc<dyn OracleAdapter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let ledger = Arc::new(Ledger::new(config.default_margin_mode));
        Ok(Self {
            registry: InstrumentRegistry::new(),
            ledger,
            view: Arc::new(SharedMarketView::new()),
            oracle,
            units: HashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn view(&self) -> &SharedMarketView {
        &self.view
    }

    fn unit_mut(&mut self, id: InstrumentId) -> Result<&mut InstrumentUnit, EngineError> {
        self.units
            .get_mut(&id)
            .ok_or(EngineError::Validation(InstrumentError::NotFound(id)))
    }

    fn unit(&self, id: InstrumentId) -> Result<&InstrumentUnit, EngineError> {
        self.units
            .get(&id)
            .ok_or(EngineError::Validation(InstrumentError::NotFound(id)))
    }

    /// List a new instrument and spin up its unit.
    pub fn list_instrument(&mut self, instrument: Instrument) {
        self.registry.list(instrument.clone());
        self.view.publish_instrument(instrument.clone());
        let unit = InstrumentUnit::new(
            instrument,
            &self.config,
            Arc::clone(&self.ledger),
            Arc::clone(&self.view),
        );
        self.units.insert(unit.instrument_id(), unit);
    }

    /// Stage a parameter change; it applies at the next `end_cycle`.
    pub fn stage_instrument_update(
        &mut self,
        instrument: Instrument,
    ) -> Result<(), InstrumentError> {
        self.registry.stage_update(instrument)
    }

    /// Stage a status change (halt, resume, delist) for the next cycle.
    pub fn stage_instrument_status(
        &mut self,
        id: InstrumentId,
        status: InstrumentStatus,
    ) -> Result<(), InstrumentError> {
        self.registry.stage_status(id, status)
    }

    // account passthroughs

    pub fn open_account(&self, id: AccountId, now: Timestamp) {
        self.ledger.open_account(id, now);
    }

    pub fn deposit(&self, id: AccountId, amount: Quote) -> Result<Quote, LedgerError> {
        self.ledger.deposit(id, amount)
    }

    pub fn withdraw(&self, id: AccountId, amount: Quote) -> Result<Quote, LedgerError> {
        self.ledger.withdraw(id, amount, self.view.as_ref())
    }

    pub fn set_margin_mode(&self, id: AccountId, mode: MarginMode) -> Result<(), LedgerError> {
        self.ledger.set_margin_mode(id, mode)
    }

    pub fn account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.ledger.account_snapshot(id)
    }

    // trading

    pub fn submit(
        &mut self,
        intent: SubmitOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        let unit = self.unit_mut(intent.instrument_id)?;
        unit.submit(intent, now)
    }

    pub fn cancel(
        &mut self,
        intent: CancelOrder,
        now: Timestamp,
    ) -> Result<CancelOutcome, EngineError> {
        let unit = self.unit_mut(intent.instrument_id)?;
        unit.cancel(intent, now)
    }

    pub fn amend(
        &mut self,
        intent: AmendOrder,
        now: Timestamp,
    ) -> Result<ExecutionReport, EngineError> {
        let unit = self.unit_mut(intent.instrument_id)?;
        unit.amend(intent, now)
    }

    // market data and risk

    /// Poll the oracle for every instrument and run the mark sweep on
    /// whatever it returns. Instruments with no new observation still get
    /// their staleness re-checked.
    pub fn poll_oracle(&mut self, now: Timestamp) -> Result<(), EngineError> {
        for unit in self.units.values_mut() {
            match self.oracle.poll(unit.instrument_id()) {
                Some(point) => unit.on_mark_price(point, now)?,
                None => unit.enforce_staleness(now),
            }
        }
        Ok(())
    }

    /// Push one mark observation directly, bypassing the oracle adapter.
    pub fn apply_mark(
        &mut self,
        id: InstrumentId,
        point: PricePoint,
        now: Timestamp,
    ) -> Result<(), EngineError> {
        self.unit_mut(id)?.on_mark_price(point, now)
    }

    pub fn apply_funding(
        &mut self,
        id: InstrumentId,
        rate: Decimal,
        now: Timestamp,
    ) -> Result<Vec<FundingCharge>, EngineError> {
        self.unit_mut(id)?.apply_funding(rate, now)
    }

    /// Cycle boundary: apply staged registry changes and run unit
    /// housekeeping.
    pub fn end_cycle(&mut self, now: Timestamp) {
        let changed: HashSet<InstrumentId> =
            self.registry.apply_staged(now).into_iter().collect();
        for (id, unit) in self.units.iter_mut() {
            let updated = if changed.contains(id) {
                self.registry.get(*id).ok().cloned()
            } else {
                None
            };
            unit.end_cycle(now, updated);
        }
    }

    pub fn depth(&self, id: InstrumentId, now: Timestamp) -> Result<DepthSnapshot, EngineError> {
        Ok(self.unit(id)?.depth(now))
    }

    pub fn events(&self, id: InstrumentId) -> Result<Vec<Event>, EngineError> {
        Ok(self.unit(id)?.events_from(SeqNum(1)))
    }

    pub fn events_from(
        &self,
        id: InstrumentId,
        from: SeqNum,
    ) -> Result<Vec<Event>, EngineError> {
        Ok(self.unit(id)?.events_from(from))
    }

    pub fn engine(&self, id: InstrumentId) -> Result<&InstrumentEngine, EngineError> {
        Ok(self.unit(id)?.engine())
    }

    pub fn risk(&self, id: InstrumentId) -> Result<&RiskEngine, EngineError> {
        Ok(self.unit(id)?.risk())
    }

    /// Break the facade apart for the threaded pipeline: shared pieces
    /// plus one owned unit per instrument.
    pub(crate) fn into_parts(
        self,
    ) -> (
        ExchangeConfig,
        InstrumentRegistry,
        Arc<Ledger>,
        Arc<SharedMarketView>,
        Arc<dyn OracleAdapter>,
        Vec<InstrumentUnit>,
    ) {
        (
            self.config,
            self.registry,
            self.ledger,
            self.view,
            self.oracle,
            self.units.into_values().collect(),
        )
    }
}
