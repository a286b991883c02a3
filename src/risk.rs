//! Risk engine: position health tracking and liquidation.
//!
//! Every position moves through a small lifecycle driven only by mark
//! price sweeps: Healthy -> Warning -> Liquidatable -> Liquidating ->
//! Closed. Liquidating is a latch: once an episode starts, the position
//! stays in it until the episode ends, even if the mark briefly recovers.
//! A surviving, reduced position starts a fresh lifecycle afterwards.

use crate::config::BackoffPolicy;
use crate::ledger::PositionMargin;
use crate::margin::MarginStatus;
use crate::types::{AccountId, InstrumentId, Price, Side, SignedQty, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Lifecycle state of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionHealth {
    Healthy,
    Warning,
    Liquidatable,
    /// Liquidation episode in progress. Latched until the episode ends.
    Liquidating,
    Closed,
}

/// What the risk sweep wants the engine to do.
#[derive(Debug, Clone)]
pub enum RiskAction {
    /// The position's health changed; emit it to the feed.
    StateChanged {
        account_id: AccountId,
        health: PositionHealth,
        margin: PositionMargin,
    },
    /// Place a reduce-only liquidation order against the book.
    PlaceLiquidation {
        account_id: AccountId,
        side: Side,
        qty: Decimal,
        attempt: u32,
    },
    /// The book could not absorb the liquidation within the retry budget;
    /// hand the remainder to the deleveraging queue.
    Escalate {
        account_id: AccountId,
        remaining_size: SignedQty,
        attempts: u32,
    },
}

#[derive(Debug, Clone)]
struct TrackedPosition {
    health: PositionHealth,
    attempts: u32,
    next_attempt_at: Timestamp,
    escalated: bool,
}

/// Quantity to close so the survivor sits `buffer` above maintenance.
///
/// After closing q near the mark, the remaining requirement is
/// (size - q) * mark * mm_rate; solving equity >= buffer * requirement
/// gives q >= size - equity / (mark * mm_rate * buffer). Rounded up to
/// the lot and clamped to the full size. Non-positive equity closes
/// everything.
pub fn liquidation_close_qty(
    size_abs: Decimal,
    equity: Decimal,
    mark: Price,
    maintenance_margin_rate: Decimal,
    buffer: Decimal,
    lot_size: Decimal,
) -> Decimal {
    if equity <= Decimal::ZERO {
        return size_abs;
    }
    let sustainable = equity / (mark.value() * maintenance_margin_rate * buffer);
    let mut close = size_abs - sustainable;
    if close <= Decimal::ZERO {
        close = lot_size;
    }
    // round up to lot alignment
    let lots = (close / lot_size).ceil();
    (lots * lot_size).min(size_abs).max(lot_size.min(size_abs))
}

/// Per-instrument risk engine. Mark-price driven: order flow never moves
/// a position's health, only sweeps do.
#[derive(Debug)]
pub struct RiskEngine {
    instrument_id: InstrumentId,
    tracked: HashMap<AccountId, TrackedPosition>,
    backoff: BackoffPolicy,
    liquidation_buffer: Decimal,
}

impl RiskEngine {
    pub fn new(
        instrument_id: InstrumentId,
        backoff: BackoffPolicy,
        liquidation_buffer: Decimal,
    ) -> Self {
        Self {
            instrument_id,
            tracked: HashMap::new(),
            backoff,
            liquidation_buffer,
        }
    }

    pub fn health_of(&self, account_id: AccountId) -> Option<PositionHealth> {
        self.tracked.get(&account_id).map(|t| t.health)
    }

    pub fn is_liquidating(&self, account_id: AccountId) -> bool {
        matches!(self.health_of(account_id), Some(PositionHealth::Liquidating))
    }

    /// The position is gone (fully closed or flipped away). Ends any
    /// episode and forgets the account.
    pub fn position_closed(&mut self, account_id: AccountId) -> Option<RiskAction> {
        self.tracked.remove(&account_id).map(|t| {
            if t.health == PositionHealth::Liquidating {
                info!(
                    instrument = self.instrument_id.0,
                    account = account_id.0,
                    "liquidation episode closed"
                );
            }
            RiskAction::StateChanged {
                account_id,
                health: PositionHealth::Closed,
                margin: PositionMargin {
                    size: SignedQty::zero(),
                    equity: crate::types::Quote::zero(),
                    maintenance: crate::types::Quote::zero(),
                    ratio: Decimal::MAX,
                    status: MarginStatus::Healthy,
                },
            }
        })
    }

    /// Evaluate one position against its current margin health. Called for
    /// every open position on each mark price sweep.
    pub fn evaluate(
        &mut self,
        account_id: AccountId,
        margin: &PositionMargin,
        mark: Price,
        maintenance_margin_rate: Decimal,
        lot_size: Decimal,
        now: Timestamp,
    ) -> Vec<RiskAction> {
        let mut actions = Vec::new();

        let current = self.tracked.get(&account_id).cloned();
        let latched = matches!(
            current.as_ref().map(|t| t.health),
            Some(PositionHealth::Liquidating)
        );

        if latched {
            self.evaluate_liquidating(account_id, margin, mark, maintenance_margin_rate, lot_size, now, &mut actions);
            return actions;
        }

        let target = match margin.status {
            MarginStatus::Healthy => PositionHealth::Healthy,
            MarginStatus::Warning => PositionHealth::Warning,
            MarginStatus::Liquidatable => PositionHealth::Liquidating,
        };

        let previous = current.map(|t| t.health);
        if previous == Some(target) {
            return actions;
        }

        if target == PositionHealth::Liquidating {
            // pass through Liquidatable on the way into the episode
            actions.push(RiskAction::StateChanged {
                account_id,
                health: PositionHealth::Liquidatable,
                margin: margin.clone(),
            });
            warn!(
                instrument = self.instrument_id.0,
                account = account_id.0,
                ratio = %margin.ratio,
                "position liquidatable, starting episode"
            );
            self.tracked.insert(
                account_id,
                TrackedPosition {
                    health: PositionHealth::Liquidating,
                    attempts: 1,
                    next_attempt_at: now.plus_ms(self.backoff.delay_for_attempt(0)),
                    escalated: false,
                },
            );
            actions.push(RiskAction::StateChanged {
                account_id,
                health: PositionHealth::Liquidating,
                margin: margin.clone(),
            });
            actions.push(self.liquidation_order(
                account_id,
                margin,
                mark,
                maintenance_margin_rate,
                lot_size,
                1,
            ));
        } else {
            self.tracked.insert(
                account_id,
                TrackedPosition {
                    health: target,
                    attempts: 0,
                    next_attempt_at: now,
                    escalated: false,
                },
            );
            actions.push(RiskAction::StateChanged {
                account_id,
                health: target,
                margin: margin.clone(),
            });
        }

        actions
    }

    fn evaluate_liquidating(
        &mut self,
        account_id: AccountId,
        margin: &PositionMargin,
        mark: Price,
        maintenance_margin_rate: Decimal,
        lot_size: Decimal,
        now: Timestamp,
        actions: &mut Vec<RiskAction>,
    ) {
        // episode over: a partial close restored the ratio. The survivor
        // re-enters the lifecycle on the next sweep.
        if margin.status != MarginStatus::Liquidatable {
            if let Some(action) = self.position_closed(account_id) {
                actions.push(action);
            }
            return;
        }

        let tracked = self.tracked.get_mut(&account_id).expect("latched entry");
        if now < tracked.next_attempt_at {
            return;
        }

        if tracked.attempts >= self.backoff.max_attempts {
            if !tracked.escalated {
                tracked.escalated = true;
                warn!(
                    instrument = self.instrument_id.0,
                    account = account_id.0,
                    attempts = tracked.attempts,
                    "liquidation liquidity exhausted, escalating"
                );
                actions.push(RiskAction::Escalate {
                    account_id,
                    remaining_size: margin.size,
                    attempts: tracked.attempts,
                });
            }
            return;
        }

        tracked.attempts += 1;
        let attempt = tracked.attempts;
        tracked.next_attempt_at = now.plus_ms(self.backoff.delay_for_attempt(attempt - 1));
        actions.push(self.liquidation_order(
            account_id,
            margin,
            mark,
            maintenance_margin_rate,
            lot_size,
            attempt,
        ));
    }

    fn liquidation_order(
        &self,
        account_id: AccountId,
        margin: &PositionMargin,
        mark: Price,
        maintenance_margin_rate: Decimal,
        lot_size: Decimal,
        attempt: u32,
    ) -> RiskAction {
        let qty = liquidation_close_qty(
            margin.size.abs(),
            margin.equity.value(),
            mark,
            maintenance_margin_rate,
            self.liquidation_buffer,
            lot_size,
        );
        // closing a long sells, closing a short buys
        let side = match margin.size.side() {
            Some(Side::Buy) => Side::Sell,
            _ => Side::Buy,
        };
        RiskAction::PlaceLiquidation {
            account_id,
            side,
            qty,
            attempt,
        }
    }

    /// Every account the sweep currently tracks.
    pub fn tracked_accounts(&self) -> Vec<AccountId> {
        self.tracked.keys().copied().collect()
    }

    /// Accounts currently in a liquidation episode, for diagnostics.
    pub fn liquidating_accounts(&self) -> Vec<AccountId> {
        let mut out: Vec<AccountId> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.health == PositionHealth::Liquidating)
            .map(|(id, _)| *id)
            .collect();
        out.sort_by_key(|id| id.0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Quote;
    use rust_decimal_macros::dec;

    fn margin(size: Decimal, equity: Decimal, maintenance: Decimal) -> PositionMargin {
        let ratio = if maintenance.is_zero() {
            Decimal::MAX
        } else {
            equity / maintenance
        };
        // warning boundary at 2, the IM/MM ratio of the test instrument
        let status = if ratio < Decimal::ONE {
            MarginStatus::Liquidatable
        } else if ratio < dec!(2) {
            MarginStatus::Warning
        } else {
            MarginStatus::Healthy
        };
        PositionMargin {
            size: SignedQty::new(size),
            equity: Quote::new(equity),
            maintenance: Quote::new(maintenance),
            ratio,
            status,
        }
    }

    fn engine() -> RiskEngine {
        RiskEngine::new(InstrumentId(1), BackoffPolicy::default(), dec!(1.1))
    }

    const MM_RATE: Decimal = dec!(0.025);
    const LOT: Decimal = dec!(0.0001);

    fn mark(p: Decimal) -> Price {
        Price::new_unchecked(p)
    }

    #[test]
    fn close_qty_restores_buffered_maintenance() {
        // 1 BTC long, equity 1000, mark 48000: requirement 1200, ratio < 1
        let q = liquidation_close_qty(dec!(1), dec!(1000), mark(dec!(48000)), MM_RATE, dec!(1.1), LOT);
        assert!(q > Decimal::ZERO && q < dec!(1));
        // survivor meets buffered maintenance
        let remaining = dec!(1) - q;
        let requirement = remaining * dec!(48000) * MM_RATE * dec!(1.1);
        assert!(dec!(1000) >= requirement);
    }

    #[test]
    fn close_qty_full_when_insolvent() {
        let q = liquidation_close_qty(dec!(2), dec!(-50), mark(dec!(48000)), MM_RATE, dec!(1.1), LOT);
        assert_eq!(q, dec!(2));
    }

    #[test]
    fn close_qty_never_exceeds_size() {
        let q = liquidation_close_qty(dec!(0.5), dec!(1), mark(dec!(48000)), MM_RATE, dec!(1.1), LOT);
        assert!(q <= dec!(0.5));
    }

    #[test]
    fn healthy_to_warning_to_liquidating() {
        let mut engine = engine();
        let now = Timestamp::from_millis(0);

        let actions = engine.evaluate(
            AccountId(1),
            &margin(dec!(1), dec!(3000), dec!(1250)),
            mark(dec!(50000)),
            MM_RATE,
            LOT,
            now,
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(engine.health_of(AccountId(1)), Some(PositionHealth::Healthy));

        let actions = engine.evaluate(
            AccountId(1),
            &margin(dec!(1), dec!(1400), dec!(1250)),
            mark(dec!(50000)),
            MM_RATE,
            LOT,
            now,
        );
        assert!(matches!(
            actions[0],
            RiskAction::StateChanged {
                health: PositionHealth::Warning,
                ..
            }
        ));

        let actions = engine.evaluate(
            AccountId(1),
            &margin(dec!(1), dec!(1000), dec!(1200)),
            mark(dec!(48000)),
            MM_RATE,
            LOT,
            now,
        );
        // Liquidatable, then Liquidating, then an order
        assert_eq!(actions.len(), 3);
        assert!(matches!(
            actions[2],
            RiskAction::PlaceLiquidation {
                side: Side::Sell,
                attempt: 1,
                ..
            }
        ));
        assert!(engine.is_liquidating(AccountId(1)));
    }

    #[test]
    fn liquidating_latch_holds_through_recovery_blip() {
        let mut engine = engine();
        let now = Timestamp::from_millis(0);

        engine.evaluate(
            AccountId(1),
            &margin(dec!(1), dec!(1000), dec!(1200)),
            mark(dec!(48000)),
            MM_RATE,
            LOT,
            now,
        );
        assert!(engine.is_liquidating(AccountId(1)));

        // ratio recovers above 1: episode ends as Closed, not Healthy
        let actions = engine.evaluate(
            AccountId(1),
            &margin(dec!(1), dec!(1500), dec!(1250)),
            mark(dec!(50000)),
            MM_RATE,
            LOT,
            Timestamp::from_millis(1_000),
        );
        assert!(matches!(
            actions[0],
            RiskAction::StateChanged {
                health: PositionHealth::Closed,
                ..
            }
        ));
        assert_eq!(engine.health_of(AccountId(1)), None);
    }

    #[test]
    fn retries_respect_backoff_then_escalate() {
        let mut engine = RiskEngine::new(
            InstrumentId(1),
            BackoffPolicy {
                max_attempts: 2,
                base_delay_ms: 100,
            },
            dec!(1.1),
        );
        let bad = margin(dec!(1), dec!(500), dec!(1200));
        let m = mark(dec!(48000));

        let actions = engine.evaluate(AccountId(1), &bad, m, MM_RATE, LOT, Timestamp::from_millis(0));
        assert!(matches!(actions.last(), Some(RiskAction::PlaceLiquidation { attempt: 1, .. })));

        // too early for a retry
        let actions = engine.evaluate(AccountId(1), &bad, m, MM_RATE, LOT, Timestamp::from_millis(50));
        assert!(actions.is_empty());

        // second attempt after the delay
        let actions = engine.evaluate(AccountId(1), &bad, m, MM_RATE, LOT, Timestamp::from_millis(150));
        assert!(matches!(actions.last(), Some(RiskAction::PlaceLiquidation { attempt: 2, .. })));

        // attempts exhausted: escalate exactly once
        let actions = engine.evaluate(AccountId(1), &bad, m, MM_RATE, LOT, Timestamp::from_millis(1_000));
        assert!(matches!(actions.last(), Some(RiskAction::Escalate { attempts: 2, .. })));
        let actions = engine.evaluate(AccountId(1), &bad, m, MM_RATE, LOT, Timestamp::from_millis(2_000));
        assert!(actions.is_empty());
    }

    #[test]
    fn closing_a_short_buys() {
        let mut engine = engine();
        let actions = engine.evaluate(
            AccountId(1),
            &margin(dec!(-1), dec!(1000), dec!(1200)),
            mark(dec!(48000)),
            MM_RATE,
            LOT,
            Timestamp::from_millis(0),
        );
        assert!(matches!(
            actions.last(),
            Some(RiskAction::PlaceLiquidation {
                side: Side::Buy,
                ..
            })
        ));
    }

    #[test]
    fn position_closed_ends_tracking() {
        let mut engine = engine();
        engine.evaluate(
            AccountId(1),
            &margin(dec!(1), dec!(1000), dec!(1200)),
            mark(dec!(48000)),
            MM_RATE,
            LOT,
            Timestamp::from_millis(0),
        );
        let action = engine.position_closed(AccountId(1));
        assert!(matches!(
            action,
            Some(RiskAction::StateChanged {
                health: PositionHealth::Closed,
                ..
            })
        ));
        assert_eq!(engine.health_of(AccountId(1)), None);
    }
}
