// Oracle integration.
//
// The engine is agnostic to where mark prices come from. An adapter pushes
// observations into the cache; the engine only ever reads the cache and
// decides freshness against its staleness threshold. A stale mark halts
// the instrument rather than letting risk decisions run on old data.

use crate::types::{InstrumentId, Price, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A single mark price observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: Price,
    pub observed_at: Timestamp,
}

impl PricePoint {
    pub fn new(price: Price, observed_at: Timestamp) -> Self {
        Self { price, observed_at }
    }

    pub fn is_stale(&self, now: Timestamp, staleness_ms: i64) -> bool {
        now.as_millis() - self.observed_at.as_millis() > staleness_ms
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("No mark price observed yet for instrument {0:?}")]
    NoPrice(InstrumentId),

    #[error("Mark price for instrument {id:?} is stale: observed {observed_at:?}, now {now:?}")]
    Stale {
        id: InstrumentId,
        observed_at: Timestamp,
        now: Timestamp,
    },
}

/// Source of mark prices. Implement this to integrate an oracle network,
/// an index aggregator, or a test fixture.
pub trait OracleAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Latest observation for the instrument, if the source has one.
    fn poll(&self, id: InstrumentId) -> Option<PricePoint>;
}

/// Last-observed mark price per instrument, shared between the oracle
/// poller and the instrument workers.
#[derive(Debug, Default)]
pub struct MarkPriceCache {
    prices: DashMap<InstrumentId, PricePoint>,
}

impl MarkPriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, id: InstrumentId, point: PricePoint) {
        self.prices.insert(id, point);
    }

    /// Last-known observation regardless of age. Valuation of already-open
    /// positions keeps using this while the instrument sits halted.
    pub fn latest(&self, id: InstrumentId) -> Option<PricePoint> {
        self.prices.get(&id).map(|entry| *entry.value())
    }

    /// Observation only if it passes the staleness threshold. Anything
    /// that opens new risk goes through here.
    pub fn fresh(
        &self,
        id: InstrumentId,
        now: Timestamp,
        staleness_ms: i64,
    ) -> Result<Price, OracleError> {
        let point = self.latest(id).ok_or(OracleError::NoPrice(id))?;
        if point.is_stale(now, staleness_ms) {
            return Err(OracleError::Stale {
                id,
                observed_at: point.observed_at,
                now,
            });
        }
        Ok(point.price)
    }
}

/// Fixed-price adapter for tests and the simulator.
#[derive(Debug, Default)]
pub struct StaticOracle {
    prices: DashMap<InstrumentId, PricePoint>,
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: InstrumentId, price: Price, observed_at: Timestamp) {
        self.prices.insert(id, PricePoint::new(price, observed_at));
    }
}

impl OracleAdapter for StaticOracle {
    fn name(&self) -> &str {
        "static"
    }

    fn poll(&self, id: InstrumentId) -> Option<PricePoint> {
        self.prices.get(&id).map(|entry| *entry.value())
    }
}
