//! Account ledger: balances, positions, margin accounting.
//!
//! Accounts are sharded behind per-account mutexes in a concurrent map, so
//! instrument workers settle trades in parallel as long as they touch
//! different accounts. A trade settles both legs atomically: both account
//! locks are taken in id order, both legs are computed, and only then is
//! either committed.

use crate::instrument::Instrument;
use crate::margin::{
    calculate_margin_requirement, evaluate_margin_status, free_margin, margin_ratio,
    position_requirement, MarginStatus,
};
use crate::position::{increase_position, reduce_position, Position};
use crate::types::{
    AccountId, InstrumentId, MarginMode, Price, Quote, Side, SignedQty, Timestamp,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Read-only market data the ledger needs for valuation: mark prices and
/// instrument specs. Implemented over the oracle cache and the registry.
pub trait MarketView: Send + Sync {
    fn mark_price(&self, id: InstrumentId) -> Option<Price>;
    fn instrument(&self, id: InstrumentId) -> Option<Instrument>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Quote,
    pub margin_mode: MarginMode,
    pub positions: HashMap<InstrumentId, Position>,
    pub total_deposited: Quote,
    pub total_withdrawn: Quote,
    pub realized_pnl: Quote,
    pub created_at: Timestamp,
}

impl Account {
    pub fn new(id: AccountId, margin_mode: MarginMode, timestamp: Timestamp) -> Self {
        Self {
            id,
            balance: Quote::zero(),
            margin_mode,
            positions: HashMap::new(),
            total_deposited: Quote::zero(),
            total_withdrawn: Quote::zero(),
            realized_pnl: Quote::zero(),
            created_at: timestamp,
        }
    }

    pub fn position(&self, instrument_id: InstrumentId) -> Option<&Position> {
        self.positions.get(&instrument_id)
    }

    /// Equity across the whole account at the given marks: balance plus
    /// position collateral plus unrealized pnl.
    pub fn equity(&self, view: &dyn MarketView) -> Quote {
        let mut equity = self.balance;
        for position in self.positions.values() {
            equity = equity.add(position.collateral);
            if let Some(mark) = view.mark_price(position.instrument_id) {
                equity = equity.add(position.unrealized_pnl(mark));
            }
        }
        equity
    }

    /// Total maintenance requirement across all positions.
    pub fn maintenance_requirement(&self, view: &dyn MarketView) -> Quote {
        let mut total = Quote::zero();
        for position in self.positions.values() {
            if let (Some(mark), Some(instrument)) = (
                view.mark_price(position.instrument_id),
                view.instrument(position.instrument_id),
            ) {
                let req = position_requirement(position, mark, &instrument);
                total = total.add(req.maintenance);
            }
        }
        total
    }

    /// Total initial requirement across all positions. The warning boundary
    /// for cross health sits here.
    fn initial_requirement(&self, view: &dyn MarketView) -> Quote {
        let mut total = Quote::zero();
        for position in self.positions.values() {
            if let (Some(mark), Some(instrument)) = (
                view.mark_price(position.instrument_id),
                view.instrument(position.instrument_id),
            ) {
                let req = position_requirement(position, mark, &instrument);
                total = total.add(req.initial);
            }
        }
        total
    }

    /// Initial margin tied up by cross positions. Isolated collateral has
    /// already left the balance.
    fn cross_margin_used(&self, view: &dyn MarketView) -> Quote {
        let mut used = Quote::zero();
        for position in self.positions.values() {
            if position.margin_mode != MarginMode::Cross {
                continue;
            }
            if let (Some(mark), Some(instrument)) = (
                view.mark_price(position.instrument_id),
                view.instrument(position.instrument_id),
            ) {
                let req = position_requirement(position, mark, &instrument);
                used = used.add(req.initial);
            }
        }
        used
    }
}

/// One side of a trade, from the settling account's point of view.
#[derive(Debug, Clone, Copy)]
pub struct TradeLeg {
    pub account_id: AccountId,
    pub side: Side,
    pub qty: Decimal,
    pub price: Price,
}

/// Balance-affecting outcome of one settled leg, emitted to the event feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerUpdate {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub balance: Quote,
    pub position_size: SignedQty,
    pub entry_price: Option<Price>,
    pub realized_pnl: Quote,
    /// Loss beyond the position's isolated collateral that the account did
    /// not absorb. Nonzero only after a liquidation fills worse than the
    /// remaining collateral.
    pub bad_debt: Quote,
}

/// A funding payment applied to one account. Positive = account paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingCharge {
    pub account_id: AccountId,
    pub instrument_id: InstrumentId,
    pub payment: Quote,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("Account {0:?} not found")]
    AccountNotFound(AccountId),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Quote, available: Quote },

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Quote, available: Quote },

    #[error("Margin mode can only change while the account is flat")]
    PositionsOpen(AccountId),

    #[error("No mark price for instrument {0:?}")]
    NoMarkPrice(InstrumentId),
}

/// Sharded account ledger.
pub struct Ledger {
    shards: DashMap<AccountId, Arc<Mutex<Account>>>,
    default_margin_mode: MarginMode,
}

impl Ledger {
    pub fn new(default_margin_mode: MarginMode) -> Self {
        Self {
            shards: DashMap::new(),
            default_margin_mode,
        }
    }

    pub fn open_account(&self, id: AccountId, now: Timestamp) {
        self.shards
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(Account::new(id, self.default_margin_mode, now))));
    }

    fn shard(&self, id: AccountId) -> Result<Arc<Mutex<Account>>, LedgerError> {
        self.shards
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(LedgerError::AccountNotFound(id))
    }

    fn lock(shard: &Arc<Mutex<Account>>) -> MutexGuard<'_, Account> {
        // a poisoned account lock means a panic mid-settlement; the state
        // is still internally consistent because legs commit atomically
        shard.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn deposit(&self, id: AccountId, amount: Quote) -> Result<Quote, LedgerError> {
        let shard = self.shard(id)?;
        let mut account = Self::lock(&shard);
        account.balance = account.balance.add(amount);
        account.total_deposited = account.total_deposited.add(amount);
        Ok(account.balance)
    }

    /// Withdraw up to the balance not backing open positions.
    pub fn withdraw(
        &self,
        id: AccountId,
        amount: Quote,
        view: &dyn MarketView,
    ) -> Result<Quote, LedgerError> {
        let shard = self.shard(id)?;
        let mut account = Self::lock(&shard);

        let margin_used = account.cross_margin_used(view);
        let available = account.balance.sub(margin_used);
        if amount.value() > available.value() {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available,
            });
        }
        account.balance = account.balance.sub(amount);
        account.total_withdrawn = account.total_withdrawn.add(amount);
        Ok(account.balance)
    }

    /// Switch margin mode. Only allowed while the account holds no
    /// positions, so no open exposure changes its backing rules mid-flight.
    pub fn set_margin_mode(&self, id: AccountId, mode: MarginMode) -> Result<(), LedgerError> {
        let shard = self.shard(id)?;
        let mut account = Self::lock(&shard);
        if !account.positions.is_empty() {
            return Err(LedgerError::PositionsOpen(id));
        }
        account.margin_mode = mode;
        Ok(())
    }

    pub fn account_snapshot(&self, id: AccountId) -> Result<Account, LedgerError> {
        let shard = self.shard(id)?;
        let account = Self::lock(&shard);
        Ok(account.clone())
    }

    /// Check whether the account can take on `qty` more exposure at
    /// `ref_price` before the order is accepted. An order that only reduces
    /// the existing position requires no new margin.
    pub fn check_initial_margin(
        &self,
        id: AccountId,
        instrument: &Instrument,
        side: Side,
        qty: Decimal,
        ref_price: Price,
        view: &dyn MarketView,
    ) -> Result<(), LedgerError> {
        let shard = self.shard(id)?;
        let account = Self::lock(&shard);

        let opening_qty = match account.position(instrument.id) {
            Some(position) if position.side() == Some(side.opposite()) => {
                (qty - position.size.abs()).max(Decimal::ZERO)
            }
            _ => qty,
        };
        if opening_qty.is_zero() {
            return Ok(());
        }

        let required = calculate_margin_requirement(
            SignedQty::from_side(side, opening_qty),
            ref_price,
            instrument,
        )
        .initial;

        let available = match account.margin_mode {
            MarginMode::Isolated => account.balance,
            MarginMode::Cross => {
                free_margin(account.equity(view), account.cross_margin_used(view))
            }
        };

        if available.value() < required.value() {
            return Err(LedgerError::InsufficientMargin {
                required,
                available,
            });
        }
        Ok(())
    }

    /// Settle both legs of a trade atomically. Locks are taken in account
    /// id order; a self-trade never reaches here, so the ids differ.
    pub fn settle_trade(
        &self,
        instrument: &Instrument,
        buy: TradeLeg,
        sell: TradeLeg,
        now: Timestamp,
    ) -> Result<(LedgerUpdate, LedgerUpdate), LedgerError> {
        debug_assert_eq!(buy.side, Side::Buy);
        debug_assert_eq!(sell.side, Side::Sell);
        debug_assert_ne!(buy.account_id, sell.account_id);

        let first_shard;
        let second_shard;
        let buy_first = buy.account_id < sell.account_id;
        if buy_first {
            first_shard = self.shard(buy.account_id)?;
            second_shard = self.shard(sell.account_id)?;
        } else {
            first_shard = self.shard(sell.account_id)?;
            second_shard = self.shard(buy.account_id)?;
        }

        let mut first = Self::lock(&first_shard);
        let mut second = Self::lock(&second_shard);
        let (buy_account, sell_account) = if buy_first {
            (&mut *first, &mut *second)
        } else {
            (&mut *second, &mut *first)
        };

        // compute both legs on copies before committing either
        let mut buy_copy = buy_account.clone();
        let mut sell_copy = sell_account.clone();
        let buy_update = Self::apply_leg(&mut buy_copy, instrument, buy, now)?;
        let sell_update = Self::apply_leg(&mut sell_copy, instrument, sell, now)?;

        *buy_account = buy_copy;
        *sell_account = sell_copy;

        debug!(
            instrument = instrument.id.0,
            buyer = buy.account_id.0,
            seller = sell.account_id.0,
            qty = %buy.qty,
            price = %buy.price.value(),
            "trade settled"
        );

        Ok((buy_update, sell_update))
    }

    fn apply_leg(
        account: &mut Account,
        instrument: &Instrument,
        leg: TradeLeg,
        now: Timestamp,
    ) -> Result<LedgerUpdate, LedgerError> {
        let signed = SignedQty::from_side(leg.side, leg.qty);
        let existing = account.positions.get(&instrument.id).cloned();

        let mut realized = Quote::zero();
        let mut bad_debt = Quote::zero();

        match existing {
            None => {
                let position = Self::open_position(account, instrument, signed, leg.price, now)?;
                account.positions.insert(instrument.id, position);
            }
            Some(position) if position.side() == Some(leg.side) => {
                let collateral =
                    Self::reserve_for(account, instrument, signed, leg.price)?;
                let updated =
                    increase_position(&position, signed.value(), leg.price, collateral, now);
                account.positions.insert(instrument.id, updated);
            }
            Some(position) => {
                let close_qty = leg.qty.min(position.size.abs());
                let update = reduce_position(&position, close_qty, leg.price, now);

                // losses come out of the returned collateral first; in
                // isolated mode the account never pays past the collateral
                let mut net = update.collateral_returned.add(update.realized_pnl);
                if position.margin_mode == MarginMode::Isolated && net.is_negative() {
                    bad_debt = net.abs();
                    net = Quote::zero();
                }
                account.balance = account.balance.add(net);
                account.realized_pnl = account.realized_pnl.add(update.realized_pnl);
                realized = update.realized_pnl;

                match update.new_position {
                    Some(remaining) => {
                        account.positions.insert(instrument.id, remaining);
                    }
                    None => {
                        account.positions.remove(&instrument.id);
                        let flip_qty = leg.qty - close_qty;
                        if flip_qty > Decimal::ZERO {
                            let flip_signed = SignedQty::from_side(leg.side, flip_qty);
                            let position = Self::open_position(
                                account, instrument, flip_signed, leg.price, now,
                            )?;
                            account.positions.insert(instrument.id, position);
                        }
                    }
                }
            }
        }

        let position = account.positions.get(&instrument.id);
        Ok(LedgerUpdate {
            account_id: account.id,
            instrument_id: instrument.id,
            balance: account.balance,
            position_size: position.map(|p| p.size).unwrap_or_else(SignedQty::zero),
            entry_price: position.map(|p| p.entry_price),
            realized_pnl: realized,
            bad_debt,
        })
    }

    fn open_position(
        account: &mut Account,
        instrument: &Instrument,
        signed: SignedQty,
        price: Price,
        now: Timestamp,
    ) -> Result<Position, LedgerError> {
        let collateral = Self::reserve_for(account, instrument, signed, price)?;
        Ok(Position::new(
            instrument.id,
            signed,
            price,
            collateral,
            account.margin_mode,
            now,
        ))
    }

    /// In isolated mode, move initial margin out of the balance into the
    /// position. Cross positions keep collateral in the wallet.
    fn reserve_for(
        account: &mut Account,
        instrument: &Instrument,
        signed: SignedQty,
        price: Price,
    ) -> Result<Quote, LedgerError> {
        match account.margin_mode {
            MarginMode::Cross => Ok(Quote::zero()),
            MarginMode::Isolated => {
                let required = calculate_margin_requirement(signed, price, instrument).initial;
                if required.value() > account.balance.value() {
                    return Err(LedgerError::InsufficientMargin {
                        required,
                        available: account.balance,
                    });
                }
                account.balance = account.balance.sub(required);
                Ok(required)
            }
        }
    }

    /// Apply a funding payment to every holder of the instrument.
    /// payment = size * mark * rate; positive size (longs) pay when the
    /// rate is positive. Isolated positions pay out of their collateral,
    /// cross positions out of the wallet.
    pub fn apply_funding(
        &self,
        instrument_id: InstrumentId,
        rate: Decimal,
        view: &dyn MarketView,
    ) -> Result<Vec<FundingCharge>, LedgerError> {
        let mark = view
            .mark_price(instrument_id)
            .ok_or(LedgerError::NoMarkPrice(instrument_id))?;

        let mut charges = Vec::new();
        for entry in self.shards.iter() {
            let mut account = Self::lock(entry.value());
            let Some(position) = account.positions.get(&instrument_id).cloned() else {
                continue;
            };
            let payment = Quote::new(position.size.value() * mark.value() * rate);
            if payment.value().is_zero() {
                continue;
            }
            match position.margin_mode {
                MarginMode::Isolated => {
                    let position = account
                        .positions
                        .get_mut(&instrument_id)
                        .expect("position present");
                    position.collateral = position.collateral.sub(payment);
                }
                MarginMode::Cross => {
                    account.balance = account.balance.sub(payment);
                }
            }
            charges.push(FundingCharge {
                account_id: account.id,
                instrument_id,
                payment,
            });
        }
        Ok(charges)
    }

    /// Clone out every open position in the instrument, for the risk sweep.
    pub fn positions_in(&self, instrument_id: InstrumentId) -> Vec<(AccountId, Position)> {
        let mut out = Vec::new();
        for entry in self.shards.iter() {
            let account = Self::lock(entry.value());
            if let Some(position) = account.positions.get(&instrument_id) {
                out.push((account.id, position.clone()));
            }
        }
        out
    }

    /// Margin health of one account's position in one instrument. The
    /// warning boundary is the instrument's own initial requirement: a
    /// position funded below initial but above maintenance reads Warning.
    pub fn position_health(
        &self,
        id: AccountId,
        instrument_id: InstrumentId,
        view: &dyn MarketView,
    ) -> Result<Option<PositionMargin>, LedgerError> {
        let shard = self.shard(id)?;
        let account = Self::lock(&shard);

        let Some(position) = account.positions.get(&instrument_id) else {
            return Ok(None);
        };
        let mark = view
            .mark_price(instrument_id)
            .ok_or(LedgerError::NoMarkPrice(instrument_id))?;
        let instrument = view
            .instrument(instrument_id)
            .ok_or(LedgerError::NoMarkPrice(instrument_id))?;

        // isolated positions stand alone; cross positions share the whole
        // account's equity and requirements
        let (equity, initial, maintenance) = match position.margin_mode {
            MarginMode::Isolated => {
                let req = position_requirement(position, mark, &instrument);
                (position.isolated_equity(mark), req.initial, req.maintenance)
            }
            MarginMode::Cross => (
                account.equity(view),
                account.initial_requirement(view),
                account.maintenance_requirement(view),
            ),
        };

        let ratio = margin_ratio(equity, maintenance);
        let warning_ratio = margin_ratio(initial, maintenance);
        Ok(Some(PositionMargin {
            size: position.size,
            equity,
            maintenance,
            ratio,
            status: evaluate_margin_status(ratio, warning_ratio),
        }))
    }
}

/// Snapshot of one position's margin health.
#[derive(Debug, Clone)]
pub struct PositionMargin {
    pub size: SignedQty,
    pub equity: Quote,
    pub maintenance: Quote,
    pub ratio: Decimal,
    pub status: MarginStatus,
}
