// 4.0: open position tracking. pnl = size * (mark - entry).
// 4.1 has increase/reduce logic at the bottom.

use crate::types::{InstrumentId, MarginMode, Price, Quote, Side, SignedQty, Timestamp};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: InstrumentId,
    pub size: SignedQty,
    pub entry_price: Price,
    /// Collateral assigned to the position. In cross mode this stays zero
    /// and the account wallet backs the position instead.
    pub collateral: Quote,
    pub margin_mode: MarginMode,
    pub opened_at: Timestamp,
    pub updated_at: Timestamp,
    pub realized_pnl: Quote,
}

impl Position {
    pub fn new(
        instrument_id: InstrumentId,
        size: SignedQty,
        entry_price: Price,
        collateral: Quote,
        margin_mode: MarginMode,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            instrument_id,
            size,
            entry_price,
            collateral,
            margin_mode,
            opened_at: timestamp,
            updated_at: timestamp,
            realized_pnl: Quote::zero(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_zero()
    }

    pub fn side(&self) -> Option<Side> {
        self.size.side()
    }

    // 4.1: paper gains/losses based on current mark
    pub fn unrealized_pnl(&self, mark_price: Price) -> Quote {
        calculate_unrealized_pnl(self.size, self.entry_price, mark_price)
    }

    pub fn notional_value(&self, mark_price: Price) -> Quote {
        Quote::new(self.size.abs() * mark_price.value())
    }

    // 4.2: isolated equity. collateral + pnl. cross equity adds the wallet
    // and is computed in the ledger.
    pub fn isolated_equity(&self, mark_price: Price) -> Quote {
        self.collateral.add(self.unrealized_pnl(mark_price))
    }
}

// 4.3: the pnl formula. size * (mark - entry)
pub fn calculate_unrealized_pnl(size: SignedQty, entry_price: Price, mark_price: Price) -> Quote {
    Quote::new(size.value() * (mark_price.value() - entry_price.value()))
}

pub fn calculate_realized_pnl(close_size: SignedQty, entry_price: Price, exit_price: Price) -> Quote {
    Quote::new(close_size.value() * (exit_price.value() - entry_price.value()))
}

#[derive(Debug, Clone)]
pub struct PositionUpdate {
    pub new_position: Option<Position>,
    pub realized_pnl: Quote,
    pub collateral_returned: Quote,
}

// 4.4: adds to existing position. averages the entry price
pub fn increase_position(
    position: &Position,
    delta_qty: Decimal,
    fill_price: Price,
    additional_collateral: Quote,
    timestamp: Timestamp,
) -> Position {
    debug_assert!(
        (delta_qty > Decimal::ZERO) == position.size.is_long() || position.is_empty(),
        "increase must be same direction as existing position"
    );

    let old_size = position.size.value();
    let new_size_value = old_size + delta_qty;
    let new_size = SignedQty::new(new_size_value);

    // weighted average entry price
    let new_entry = if new_size_value.abs() > Decimal::ZERO {
        let weighted_sum =
            old_size.abs() * position.entry_price.value() + delta_qty.abs() * fill_price.value();
        Price::new_unchecked(weighted_sum / new_size_value.abs())
    } else {
        position.entry_price
    };

    Position {
        instrument_id: position.instrument_id,
        size: new_size,
        entry_price: new_entry,
        collateral: position.collateral.add(additional_collateral),
        margin_mode: position.margin_mode,
        opened_at: position.opened_at,
        updated_at: timestamp,
        realized_pnl: position.realized_pnl,
    }
}

pub fn reduce_position(
    position: &Position,
    reduce_qty: Decimal,
    fill_price: Price,
    timestamp: Timestamp,
) -> PositionUpdate {
    debug_assert!(reduce_qty > Decimal::ZERO, "reduce quantity must be positive");

    let position_abs = position.size.abs();
    let reduce_qty = reduce_qty.min(position_abs);

    // pnl for the closed portion keeps the original direction's sign
    let close_size = SignedQty::new(position.size.value().signum() * reduce_qty);
    let realized = calculate_realized_pnl(close_size, position.entry_price, fill_price);

    let reduce_fraction = reduce_qty / position_abs;
    let collateral_returned = Quote::new(position.collateral.value() * reduce_fraction);

    let remaining_abs = position_abs - reduce_qty;
    if remaining_abs.is_zero() {
        return PositionUpdate {
            new_position: None,
            realized_pnl: realized,
            collateral_returned: position.collateral,
        };
    }

    let new_position = Position {
        instrument_id: position.instrument_id,
        size: SignedQty::new(position.size.value().signum() * remaining_abs),
        entry_price: position.entry_price, // entry unchanged on reduction
        collateral: position.collateral.sub(collateral_returned),
        margin_mode: position.margin_mode,
        opened_at: position.opened_at,
        updated_at: timestamp,
        realized_pnl: position.realized_pnl.add(realized),
    };

    PositionUpdate {
        new_position: Some(new_position),
        realized_pnl: realized,
        collateral_returned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_position() -> Position {
        Position::new(
            InstrumentId(1),
            SignedQty::new(dec!(1)), // 1 BTC long
            Price::new_unchecked(dec!(50000)),
            Quote::new(dec!(5000)),
            MarginMode::Isolated,
            Timestamp::from_millis(0),
        )
    }

    #[test]
    fn unrealized_pnl_long_profit() {
        let pos = test_position();
        let mark = Price::new_unchecked(dec!(52000));
        assert_eq!(pos.unrealized_pnl(mark).value(), dec!(2000));
    }

    #[test]
    fn unrealized_pnl_long_loss() {
        let pos = test_position();
        let mark = Price::new_unchecked(dec!(48000));
        assert_eq!(pos.unrealized_pnl(mark).value(), dec!(-2000));
    }

    #[test]
    fn unrealized_pnl_short_profit() {
        let pos = Position::new(
            InstrumentId(1),
            SignedQty::new(dec!(-1)),
            Price::new_unchecked(dec!(50000)),
            Quote::new(dec!(5000)),
            MarginMode::Isolated,
            Timestamp::from_millis(0),
        );
        let mark = Price::new_unchecked(dec!(48000));
        assert_eq!(pos.unrealized_pnl(mark).value(), dec!(2000));
    }

    #[test]
    fn isolated_equity() {
        let pos = test_position();
        let mark = Price::new_unchecked(dec!(52000));
        // collateral 5000 + pnl 2000
        assert_eq!(pos.isolated_equity(mark).value(), dec!(7000));
    }

    #[test]
    fn increase_position_averages_entry() {
        let pos = test_position(); // 1 BTC @ 50000
        let new_pos = increase_position(
            &pos,
            dec!(1),
            Price::new_unchecked(dec!(52000)),
            Quote::new(dec!(5200)),
            Timestamp::from_millis(1000),
        );

        assert_eq!(new_pos.size.value(), dec!(2));
        // (1 * 50000 + 1 * 52000) / 2 = 51000
        assert_eq!(new_pos.entry_price.value(), dec!(51000));
        assert_eq!(new_pos.collateral.value(), dec!(10200));
    }

    #[test]
    fn reduce_position_partial() {
        let pos = Position::new(
            InstrumentId(1),
            SignedQty::new(dec!(2)),
            Price::new_unchecked(dec!(50000)),
            Quote::new(dec!(10000)),
            MarginMode::Isolated,
            Timestamp::from_millis(0),
        );

        let update = reduce_position(
            &pos,
            dec!(1),
            Price::new_unchecked(dec!(52000)),
            Timestamp::from_millis(1000),
        );

        let new_pos = update.new_position.unwrap();
        assert_eq!(new_pos.size.value(), dec!(1));
        assert_eq!(new_pos.entry_price.value(), dec!(50000)); // entry unchanged
        assert_eq!(new_pos.collateral.value(), dec!(5000));
        assert_eq!(update.realized_pnl.value(), dec!(2000));
        assert_eq!(update.collateral_returned.value(), dec!(5000));
    }

    #[test]
    fn reduce_position_full_close() {
        let pos = test_position();
        let update = reduce_position(
            &pos,
            dec!(1),
            Price::new_unchecked(dec!(51000)),
            Timestamp::from_millis(1000),
        );

        assert!(update.new_position.is_none());
        assert_eq!(update.realized_pnl.value(), dec!(1000));
        assert_eq!(update.collateral_returned.value(), dec!(5000));
    }

}
