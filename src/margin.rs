//! Margin requirement and margin ratio calculation.
//!
//! Initial margin (IM) is required to open a position; maintenance margin
//! (MM) is the minimum to keep it open. Both come from the instrument's
//! margin rates. Health is expressed as a margin ratio:
//! equity / maintenance requirement, liquidatable below 1.0.

use crate::instrument::Instrument;
use crate::position::Position;
use crate::types::{Price, Quote, SignedQty};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
pub struct MarginRequirement {
    pub initial: Quote,
    pub maintenance: Quote,
}

pub fn notional_value(size: SignedQty, price: Price) -> Quote {
    Quote::new(size.abs() * price.value())
}

/// Margin requirement for holding `size` at `mark_price`.
pub fn calculate_margin_requirement(
    size: SignedQty,
    mark_price: Price,
    instrument: &Instrument,
) -> MarginRequirement {
    let notional = notional_value(size, mark_price).value();
    MarginRequirement {
        initial: Quote::new(instrument.initial_margin(notional)),
        maintenance: Quote::new(instrument.maintenance_margin(notional)),
    }
}

/// Margin requirement of a position at the current mark.
pub fn position_requirement(position: &Position, mark_price: Price, instrument: &Instrument) -> MarginRequirement {
    calculate_margin_requirement(position.size, mark_price, instrument)
}

/// equity / maintenance requirement. A flat position has no requirement
/// and reports the maximum ratio.
pub fn margin_ratio(equity: Quote, maintenance: Quote) -> Decimal {
    if maintenance.value() <= Decimal::ZERO {
        return Decimal::MAX;
    }
    equity.value() / maintenance.value()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginStatus {
    Healthy,
    Warning,
    Liquidatable,
}

/// Classify a margin ratio. `warning_ratio` is the initial-margin
/// threshold expressed over maintenance (initial / maintenance), so a
/// position funded below initial but above maintenance reads Warning;
/// below 1.0 it is liquidatable.
pub fn evaluate_margin_status(ratio: Decimal, warning_ratio: Decimal) -> MarginStatus {
    if ratio < Decimal::ONE {
        MarginStatus::Liquidatable
    } else if ratio < warning_ratio {
        MarginStatus::Warning
    } else {
        MarginStatus::Healthy
    }
}

/// Equity left over for new exposure.
pub fn free_margin(equity: Quote, margin_used: Quote) -> Quote {
    equity.sub(margin_used)
}
