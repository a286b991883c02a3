// 8.0.2: result types and errors for engine operations.

use crate::book::Fill;
use crate::instrument::InstrumentError;
use crate::ledger::LedgerError;
use crate::oracle::OracleError;
use crate::order::OrderStatus;
use crate::types::{InstrumentId, OrderId, Price};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What happened to a submitted order, returned synchronously to the caller.
/// The same report is cached under the order's idempotency key, so a retried
/// submit observes the original outcome instead of executing twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub remaining_qty: Decimal,
    pub avg_price: Option<Price>,
    pub fills: Vec<Fill>,
}

impl ExecutionReport {
    pub fn average_price(fills: &[Fill]) -> Option<Price> {
        let total: Decimal = fills.iter().map(|f| f.qty).sum();
        if total.is_zero() {
            return None;
        }
        let notional: Decimal = fills.iter().map(|f| f.price.value() * f.qty).sum();
        Price::new(notional / total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The order was live and is now cancelled in full.
    Cancelled,
    /// The order had partial fills; the unfilled remainder is cancelled.
    PartiallyFilledThenCancelled,
    /// Nothing left to cancel; the order already terminated.
    AlreadyFilled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Order validation failed: {0}")]
    Validation(#[from] InstrumentError),

    #[error("Limit order requires a price")]
    MissingPrice,

    #[error("GTD order requires an expire time")]
    MissingExpiry,

    #[error("Order {0:?} not found")]
    OrderNotFound(OrderId),

    #[error("Order {0:?} belongs to another account")]
    NotOrderOwner(OrderId),

    #[error("Instrument {0:?} is halted")]
    InstrumentHalted(InstrumentId),

    #[error("Instrument {0:?} is not tradable")]
    InstrumentNotTradable(InstrumentId),

    #[error("Post-only order would take liquidity")]
    WouldTakeLiquidity,

    #[error("Fill-or-kill order cannot be filled in full")]
    Unfillable,

    #[error("Reduce-only order would increase position")]
    WouldIncreasePosition,

    #[error("Amended quantity conflicts with the order's filled quantity")]
    InvalidAmend,

    #[error("Order sequence space exhausted")]
    SequenceExhausted,

    #[error("Instrument {0:?} worker is not running")]
    WorkerUnavailable(InstrumentId),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}
