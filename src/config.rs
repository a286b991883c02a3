// 7.0 config.rs: all engine-wide policy knobs in one place.

use crate::types::MarginMode;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// What happens when an incoming order would match the same account's
/// resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelfTradePolicy {
    /// Cut the incoming order's remainder. The resting order keeps its
    /// place in the queue.
    CancelTaker,
    /// Cancel the resting order and let the incoming order keep matching.
    CancelResting,
}

impl Default for SelfTradePolicy {
    fn default() -> Self {
        Self::CancelTaker
    }
}

/// Bounded retry schedule for liquidation order resubmission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Attempts before escalating to the deleveraging queue.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay_ms: i64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> i64 {
        self.base_delay_ms.saturating_mul(1_i64 << attempt.min(16))
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub self_trade_policy: SelfTradePolicy,
    /// Margin mode applied to accounts that have not chosen one.
    pub default_margin_mode: MarginMode,
    /// Mark price older than this halts the instrument.
    pub oracle_staleness_ms: i64,
    /// Liquidation closes enough quantity to push the margin ratio this
    /// far above 1.0, not just back to the threshold.
    pub liquidation_buffer: Decimal,
    pub liquidation_backoff: BackoffPolicy,
    /// Events retained per instrument before the oldest are dropped.
    pub max_events_per_instrument: usize,
    /// Terminal orders and deduped submit outcomes retained per
    /// instrument before the oldest are dropped.
    pub max_order_history: usize,
    /// Price levels per side in published depth views.
    pub depth_levels: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            self_trade_policy: SelfTradePolicy::default(),
            default_margin_mode: MarginMode::Isolated,
            oracle_staleness_ms: 5_000,
            liquidation_buffer: dec!(1.1),
            liquidation_backoff: BackoffPolicy::default(),
            max_events_per_instrument: 100_000,
            max_order_history: 100_000,
            depth_levels: 25,
        }
    }
}

impl ExchangeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.oracle_staleness_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "oracle_staleness_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.liquidation_buffer < Decimal::ONE {
            return Err(ConfigError::Invalid {
                field: "liquidation_buffer",
                reason: "must be at least 1.0".to_string(),
            });
        }
        if self.liquidation_backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "liquidation_backoff.max_attempts",
                reason: "need at least one attempt".to_string(),
            });
        }
        if self.max_order_history == 0 {
            return Err(ConfigError::Invalid {
                field: "max_order_history",
                reason: "must be positive".to_string(),
            });
        }
        if self.depth_levels == 0 {
            return Err(ConfigError::Invalid {
                field: "depth_levels",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid config field {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}
