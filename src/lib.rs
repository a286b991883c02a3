// exchange-core: matching and risk engine for a derivatives venue.
// risk-first architecture: margin math and liquidation take priority.
// all computation is deterministic with no external I/O.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, Side, SignedQty, Price, Quote, SeqNum
//   2.x  order.rs: order lifecycle, submit/cancel/amend intents
//   3.x  book.rs: CLOB with (price, sequence) priority and the match loop
//   4.x  instrument.rs: contract specs, validation, staged registry
//   5.x  funding.rs: funding payment math
//   6.x  position.rs + margin.rs: position math, IM/MM, margin status
//   7.x  config.rs: policy knobs: STP, backoff, thresholds
//   8.x  engine/: per-instrument engine: intents, matching, stops
//   9.x  ledger.rs: sharded accounts, atomic two-leg settlement
//   10.x risk.rs: health lifecycle, liquidation sizing, backoff
//   11.x events.rs: sequenced per-instrument event feed
//   12.x oracle.rs: mark price adapters and staleness
//   13.x exchange.rs + pipeline.rs: assembly, single-writer workers

pub mod book;
pub mod config;
pub mod engine;
pub mod events;
pub mod exchange;
pub mod funding;
pub mod instrument;
pub mod ledger;
pub mod margin;
pub mod oracle;
pub mod order;
pub mod pipeline;
pub mod position;
pub mod risk;
pub mod types;

// re exports for convenience
pub use book::{DepthLevel, DepthSnapshot, Fill, MatchOutcome, OrderBook};
pub use config::{BackoffPolicy, ConfigError, ExchangeConfig, SelfTradePolicy};
pub use engine::{CancelOutcome, EngineError, ExecutionReport, InstrumentEngine};
pub use events::{Event, EventLog, EventPayload, HaltReason, StatusReason};
pub use exchange::{Exchange, InstrumentUnit, SharedMarketView};
pub use funding::{calculate_funding_payment, clamp_rate, FundingParams};
pub use instrument::{Instrument, InstrumentError, InstrumentRegistry, InstrumentStatus};
pub use ledger::{
    Account, FundingCharge, Ledger, LedgerError, LedgerUpdate, MarketView, PositionMargin,
    TradeLeg,
};
pub use margin::{
    calculate_margin_requirement, evaluate_margin_status, margin_ratio, MarginRequirement,
    MarginStatus,
};
pub use oracle::{MarkPriceCache, OracleAdapter, OracleError, PricePoint, StaticOracle};
pub use order::{
    AmendOrder, CancelOrder, Order, OrderStatus, OrderType, SubmitOrder, TimeInForce,
};
pub use pipeline::TradingPipeline;
pub use position::{
    calculate_realized_pnl, calculate_unrealized_pnl, increase_position, reduce_position,
    Position, PositionUpdate,
};
pub use risk::{liquidation_close_qty, PositionHealth, RiskAction, RiskEngine};
pub use types::{
    AccountId, IdempotencyKey, InstrumentId, MarginMode, OrderId, Price, Quote, SeqNum, Side,
    SignedQty, Timestamp, TradeId,
};
