// 8.0: per-instrument matching engine. One engine instance is the single
// writer for its instrument: book, stops, idempotency cache, event log.
// Deterministic and event-driven with no external I/O.

mod core;
mod intents;
mod results;

pub use core::InstrumentEngine;
pub use results::{CancelOutcome, EngineError, ExecutionReport};
