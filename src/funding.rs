// 5.0: funding payments. at discrete funding events longs pay shorts or
// vice versa; the rate arrives from outside, the engine only applies it.

use crate::types::{Price, Quote, SignedQty};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingParams {
    /// Absolute cap on a single funding rate.
    pub max_rate: Decimal,
}

impl Default for FundingParams {
    fn default() -> Self {
        Self {
            max_rate: dec!(0.01),
        }
    }
}

/// Clamp an externally supplied rate to the configured band.
pub fn clamp_rate(rate: Decimal, params: &FundingParams) -> Decimal {
    rate.max(-params.max_rate).min(params.max_rate)
}

// 5.1: how much a position pays or receives. size * mark * rate.
// positive = pays, negative = receives.
pub fn calculate_funding_payment(
    position_size: SignedQty,
    mark_price: Price,
    funding_rate: Decimal,
) -> Quote {
    Quote::new(position_size.value() * mark_price.value() * funding_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rate_clamped_to_band() {
        let params = FundingParams::default();
        assert_eq!(clamp_rate(dec!(0.05), &params), dec!(0.01));
        assert_eq!(clamp_rate(dec!(-0.05), &params), dec!(-0.01));
        assert_eq!(clamp_rate(dec!(0.0006), &params), dec!(0.0006));
    }

    #[test]
    fn funding_payment_long_pays() {
        let payment = calculate_funding_payment(
            SignedQty::new(dec!(1)),
            Price::new_unchecked(dec!(50000)),
            dec!(0.001),
        );
        // 1 * 50000 * 0.001 = 50 paid
        assert_eq!(payment.value(), dec!(50));
    }

    #[test]
    fn funding_payment_short_receives() {
        let payment = calculate_funding_payment(
            SignedQty::new(dec!(-1)),
            Price::new_unchecked(dec!(50000)),
            dec!(0.001),
        );
        assert_eq!(payment.value(), dec!(-50));
    }
}
