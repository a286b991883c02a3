//! Instrument definitions and the registry.
//!
//! An instrument is the static contract spec for one tradable market:
//! tick size, lot size, leverage cap, margin rates, status. The registry
//! stages parameter changes and applies them only between processing
//! cycles so a matching pass never sees a half-updated instrument.

use crate::types::{InstrumentId, Price, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Instrument trading status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentStatus {
    /// Open for trading.
    Active,
    /// Trading suspended. Orders are rejected, cancels and reduce-only
    /// liquidation orders still go through.
    Halted,
    /// Permanently closed.
    Delisted,
}

impl Default for InstrumentStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Static contract spec for one market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    /// Human-readable symbol (e.g., "BTC-PERP").
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// Minimum price increment. Prices must be exact multiples.
    pub tick_size: Decimal,
    /// Minimum quantity increment. Quantities must be exact multiples.
    pub lot_size: Decimal,
    /// Minimum order quantity.
    pub min_order_qty: Decimal,
    /// Maximum leverage, as a multiplier (e.g., 20 = 20x).
    pub max_leverage: Decimal,
    /// Initial margin rate, fraction of notional required to open.
    pub initial_margin_rate: Decimal,
    /// Maintenance margin rate, fraction of notional below which the
    /// position becomes liquidatable.
    pub maintenance_margin_rate: Decimal,
    pub status: InstrumentStatus,
}

impl Instrument {
    /// A default BTC perpetual spec, used by tests and the simulator.
    pub fn btc_perp() -> Self {
        Self {
            id: InstrumentId(1),
            symbol: "BTC-PERP".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USD".to_string(),
            tick_size: Decimal::new(1, 1),    // $0.1
            lot_size: Decimal::new(1, 4),     // 0.0001 BTC
            min_order_qty: Decimal::new(1, 4),
            max_leverage: Decimal::from(20),
            initial_margin_rate: Decimal::new(5, 2),       // 5%
            maintenance_margin_rate: Decimal::new(25, 3),  // 2.5%
            status: InstrumentStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == InstrumentStatus::Active
    }

    /// Validate an order quantity against min size and lot alignment.
    pub fn validate_qty(&self, qty: Decimal) -> Result<(), InstrumentError> {
        if qty <= Decimal::ZERO {
            return Err(InstrumentError::NonPositiveQty(qty));
        }
        if qty < self.min_order_qty {
            return Err(InstrumentError::OrderTooSmall {
                qty,
                minimum: self.min_order_qty,
            });
        }
        let remainder = qty % self.lot_size;
        if !remainder.is_zero() {
            return Err(InstrumentError::InvalidLot {
                qty,
                lot_size: self.lot_size,
            });
        }
        Ok(())
    }

    /// Validate a price against tick alignment. Misaligned prices are
    /// rejected, never rounded: rounding would move a resting order to a
    /// level the trader did not ask for.
    pub fn validate_price(&self, price: Price) -> Result<(), InstrumentError> {
        let remainder = price.value() % self.tick_size;
        if !remainder.is_zero() {
            return Err(InstrumentError::InvalidTick {
                price: price.value(),
                tick_size: self.tick_size,
            });
        }
        Ok(())
    }

    /// Initial margin required for a given notional, honoring the stricter
    /// of the margin rate and the leverage cap.
    pub fn initial_margin(&self, notional: Decimal) -> Decimal {
        let leverage_floor = notional / self.max_leverage;
        (notional * self.initial_margin_rate).max(leverage_floor)
    }

    /// Maintenance margin required for a given notional.
    pub fn maintenance_margin(&self, notional: Decimal) -> Decimal {
        notional * self.maintenance_margin_rate
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InstrumentError {
    #[error("Order quantity {0} must be positive")]
    NonPositiveQty(Decimal),

    #[error("Order quantity {qty} below minimum {minimum}")]
    OrderTooSmall { qty: Decimal, minimum: Decimal },

    #[error("Quantity {qty} not aligned to lot size {lot_size}")]
    InvalidLot { qty: Decimal, lot_size: Decimal },

    #[error("Price {price} not aligned to tick size {tick_size}")]
    InvalidTick { price: Decimal, tick_size: Decimal },

    #[error("Instrument {0:?} not found")]
    NotFound(InstrumentId),

    #[error("Instrument {0:?} is not active")]
    NotActive(InstrumentId),
}

/// A staged parameter change, applied at the next cycle boundary.
#[derive(Debug, Clone)]
enum StagedChange {
    Replace(Instrument),
    SetStatus(InstrumentStatus),
}

/// Registry of listed instruments.
///
/// Reads are immediate; writes are staged and take effect only when
/// `apply_staged` runs between processing cycles, so in-flight matching
/// always sees a consistent spec.
#[derive(Debug, Default)]
pub struct InstrumentRegistry {
    instruments: HashMap<InstrumentId, Instrument>,
    staged: Vec<(InstrumentId, StagedChange)>,
    last_applied: Option<Timestamp>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// List a new instrument. Takes effect immediately: nothing can have
    /// been trading it yet.
    pub fn list(&mut self, instrument: Instrument) {
        self.instruments.insert(instrument.id, instrument);
    }

    pub fn get(&self, id: InstrumentId) -> Result<&Instrument, InstrumentError> {
        self.instruments.get(&id).ok_or(InstrumentError::NotFound(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = InstrumentId> + '_ {
        self.instruments.keys().copied()
    }

    /// Stage a full parameter replacement for an existing instrument.
    pub fn stage_update(&mut self, instrument: Instrument) -> Result<(), InstrumentError> {
        if !self.instruments.contains_key(&instrument.id) {
            return Err(InstrumentError::NotFound(instrument.id));
        }
        self.staged
            .push((instrument.id, StagedChange::Replace(instrument)));
        Ok(())
    }

    /// Stage a status change (halt, resume, delist).
    pub fn stage_status(
        &mut self,
        id: InstrumentId,
        status: InstrumentStatus,
    ) -> Result<(), InstrumentError> {
        if !self.instruments.contains_key(&id) {
            return Err(InstrumentError::NotFound(id));
        }
        self.staged.push((id, StagedChange::SetStatus(status)));
        Ok(())
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Apply all staged changes in the order they were staged. Returns the
    /// ids whose spec changed.
    pub fn apply_staged(&mut self, now: Timestamp) -> Vec<InstrumentId> {
        let mut changed = Vec::new();
        for (id, change) in self.staged.drain(..) {
            match change {
                StagedChange::Replace(instrument) => {
                    self.instruments.insert(id, instrument);
                }
                StagedChange::SetStatus(status) => {
                    if let Some(instrument) = self.instruments.get_mut(&id) {
                        instrument.status = status;
                    }
                }
            }
            if !changed.contains(&id) {
                changed.push(id);
            }
        }
        if !changed.is_empty() {
            self.last_applied = Some(now);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn validate_qty_ok() {
        let spec = Instrument::btc_perp();
        assert!(spec.validate_qty(dec!(0.001)).is_ok());
        assert!(spec.validate_qty(dec!(1.0)).is_ok());
    }

    #[test]
    fn validate_qty_too_small() {
        let spec = Instrument::btc_perp();
        let result = spec.validate_qty(dec!(0.00001));
        assert!(matches!(result, Err(InstrumentError::OrderTooSmall { .. })));
    }

    #[test]
    fn validate_qty_lot_misaligned() {
        let spec = Instrument::btc_perp();
        let result = spec.validate_qty(dec!(0.00015));
        assert!(matches!(result, Err(InstrumentError::InvalidLot { .. })));
    }

    #[test]
    fn validate_price_rejects_off_tick() {
        let spec = Instrument::btc_perp();
        let off = Price::new_unchecked(dec!(50000.123));
        assert!(matches!(
            spec.validate_price(off),
            Err(InstrumentError::InvalidTick { .. })
        ));
        let on = Price::new_unchecked(dec!(50000.1));
        assert!(spec.validate_price(on).is_ok());
    }

    #[test]
    fn initial_margin_honors_leverage_cap() {
        let mut spec = Instrument::btc_perp();
        spec.initial_margin_rate = dec!(0.01); // 1%, looser than 20x cap
        // 20x cap requires 5% of notional, which dominates
        assert_eq!(spec.initial_margin(dec!(10000)), dec!(500));
    }

    #[test]
    fn staged_update_invisible_until_applied() {
        let mut registry = InstrumentRegistry::new();
        registry.list(Instrument::btc_perp());

        let mut updated = Instrument::btc_perp();
        updated.maintenance_margin_rate = dec!(0.05);
        registry.stage_update(updated).unwrap();

        assert_eq!(
            registry.get(InstrumentId(1)).unwrap().maintenance_margin_rate,
            dec!(0.025)
        );

        let changed = registry.apply_staged(Timestamp::from_millis(0));
        assert_eq!(changed, vec![InstrumentId(1)]);
        assert_eq!(
            registry.get(InstrumentId(1)).unwrap().maintenance_margin_rate,
            dec!(0.05)
        );
    }

    #[test]
    fn staged_halt_applies_at_boundary() {
        let mut registry = InstrumentRegistry::new();
        registry.list(Instrument::btc_perp());
        registry
            .stage_status(InstrumentId(1), InstrumentStatus::Halted)
            .unwrap();
        assert!(registry.get(InstrumentId(1)).unwrap().is_active());
        registry.apply_staged(Timestamp::from_millis(0));
        assert_eq!(
            registry.get(InstrumentId(1)).unwrap().status,
            InstrumentStatus::Halted
        );
    }

    #[test]
    fn unknown_instrument_rejected() {
        let mut registry = InstrumentRegistry::new();
        assert!(matches!(
            registry.stage_status(InstrumentId(9), InstrumentStatus::Halted),
            Err(InstrumentError::NotFound(_))
        ));
    }
}
