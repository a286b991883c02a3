//! Property-based tests for the core math and the order book.
//!
//! These tests verify invariants hold under random inputs.

use exchange_core::*;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// Strategies for generating test data
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..1_000_000i64).prop_map(|x| Decimal::new(x, 2)) // $0.01 to $10,000
}

fn qty_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000i64).prop_map(|x| Decimal::new(x, 4)) // 0.0001 to 1.0
}

fn order(id: u64, account: u64, side: Side, price: Decimal, qty: Decimal) -> Order {
    Order {
        id: OrderId(id),
        account_id: AccountId(account),
        instrument_id: InstrumentId(1),
        side,
        order_type: OrderType::Limit,
        qty,
        remaining_qty: qty,
        filled_qty: Decimal::ZERO,
        cancelled_qty: Decimal::ZERO,
        price: Some(Price::new_unchecked(price)),
        time_in_force: TimeInForce::GTC,
        reduce_only: false,
        expire_at: None,
        seq: SeqNum(id),
        status: OrderStatus::Open,
        created_at: Timestamp::from_millis(id as i64),
    }
}

proptest! {
    /// Unrealized PnL is zero when mark = entry.
    #[test]
    fn pnl_zero_at_entry(
        qty in qty_strategy(),
        entry in price_strategy(),
    ) {
        let size = SignedQty::new(qty);
        let entry_price = Price::new_unchecked(entry);

        let pnl = calculate_unrealized_pnl(size, entry_price, entry_price);
        prop_assert_eq!(pnl.value(), Decimal::ZERO);
    }

    /// PnL sign is correct for longs: profit when mark > entry.
    #[test]
    fn pnl_sign_long(
        qty in qty_strategy(),
        entry in price_strategy(),
        delta in -500i64..=500i64,
    ) {
        let size = SignedQty::new(qty);
        let entry_price = Price::new_unchecked(entry);
        let mark_val = entry + Decimal::new(delta, 2);

        if mark_val > Decimal::ZERO {
            let mark = Price::new_unchecked(mark_val);
            let pnl = calculate_unrealized_pnl(size, entry_price, mark);

            if mark_val > entry {
                prop_assert!(pnl.value() > Decimal::ZERO);
            } else if mark_val < entry {
                prop_assert!(pnl.value() < Decimal::ZERO);
            }
        }
    }

    /// PnL sign is correct for shorts: profit when mark < entry.
    #[test]
    fn pnl_sign_short(
        qty in qty_strategy(),
        entry in price_strategy(),
        delta in -500i64..=500i64,
    ) {
        let size = SignedQty::new(-qty);
        let entry_price = Price::new_unchecked(entry);
        let mark_val = entry + Decimal::new(delta, 2);

        if mark_val > Decimal::ZERO {
            let mark = Price::new_unchecked(mark_val);
            let pnl = calculate_unrealized_pnl(size, entry_price, mark);

            if mark_val < entry {
                prop_assert!(pnl.value() > Decimal::ZERO);
            } else if mark_val > entry {
                prop_assert!(pnl.value() < Decimal::ZERO);
            }
        }
    }

    /// Margin requirements are positive and maintenance stays below initial.
    #[test]
    fn margin_requirement_ordering(
        qty in qty_strategy(),
        price in price_strategy(),
    ) {
        let instrument = Instrument::btc_perp();
        let req = calculate_margin_requirement(
            SignedQty::new(qty),
            Price::new_unchecked(price),
            &instrument,
        );
        prop_assert!(req.initial.value() > Decimal::ZERO);
        prop_assert!(req.maintenance.value() > Decimal::ZERO);
        prop_assert!(req.maintenance.value() < req.initial.value());
    }

    /// Liquidation sizing never closes more than the position and the
    /// survivor meets buffered maintenance.
    #[test]
    fn liquidation_close_qty_bounds(
        size_lots in 1i64..100_000i64,
        equity_cents in -1_000_000i64..50_000_000i64,
        mark_cents in 100_000i64..10_000_000i64,
    ) {
        let lot = dec!(0.0001);
        let size = Decimal::new(size_lots, 4);
        let equity = Decimal::new(equity_cents, 2);
        let mark = Price::new_unchecked(Decimal::new(mark_cents, 2));
        let mm_rate = dec!(0.025);
        let buffer = dec!(1.1);

        let q = liquidation_close_qty(size, equity, mark, mm_rate, buffer, lot);
        prop_assert!(q > Decimal::ZERO);
        prop_assert!(q <= size);
        prop_assert!((q % lot).is_zero());

        if equity > Decimal::ZERO && q < size {
            let remaining = size - q;
            let requirement = remaining * mark.value() * mm_rate * buffer;
            prop_assert!(equity >= requirement);
        }
    }

    /// Matching conserves quantity on both sides of every fill and the
    /// book is never left crossed.
    #[test]
    fn matching_conserves_qty_and_uncrosses(
        maker_qtys in prop::collection::vec(1i64..1_000i64, 1..8),
        taker_lots in 1i64..5_000i64,
    ) {
        let mut book = OrderBook::new(InstrumentId(1));
        let mut id = 1u64;
        for lots in &maker_qtys {
            let price = dec!(50000) + Decimal::from(id); // distinct levels
            book.insert(order(id, id, Side::Sell, price, Decimal::new(*lots, 4)));
            id += 1;
        }

        let mut taker = order(id, 999, Side::Buy, dec!(60000), Decimal::new(taker_lots, 4));
        let before: Decimal = maker_qtys.iter().map(|l| Decimal::new(*l, 4)).sum();
        let outcome = book.match_order(&mut taker, SelfTradePolicy::CancelTaker);

        let filled: Decimal = outcome.fills.iter().map(|f| f.qty).sum();
        prop_assert_eq!(filled, taker.filled_qty);
        prop_assert!(taker.conserves_qty());

        let resting: Decimal = book.iter_orders().map(|o| o.remaining_qty).sum();
        prop_assert_eq!(before - filled, resting);
        prop_assert!(!book.is_crossed());
    }

    /// Fills always execute at the maker's price and walk levels best
    /// first.
    #[test]
    fn fills_at_maker_price_in_order(
        levels in prop::collection::vec((1i64..500i64, 1i64..1_000i64), 2..6),
    ) {
        let mut book = OrderBook::new(InstrumentId(1));
        let mut id = 1u64;
        for (tick, lots) in &levels {
            let price = dec!(40000) + Decimal::new(*tick, 1);
            book.insert(order(id, id, Side::Sell, price, Decimal::new(*lots, 4)));
            id += 1;
        }

        let total: Decimal = levels.iter().map(|(_, l)| Decimal::new(*l, 4)).sum();
        let mut taker = order(id, 999, Side::Buy, dec!(60000), total);
        let outcome = book.match_order(&mut taker, SelfTradePolicy::CancelTaker);

        let mut last = Decimal::ZERO;
        for fill in &outcome.fills {
            prop_assert!(fill.price.value() >= last, "asks consumed lowest first");
            last = fill.price.value();
        }
        prop_assert!(outcome.fully_filled());
        prop_assert!(book.is_empty());
    }

    /// Event sequence numbers stay dense from 1 regardless of the cap.
    #[test]
    fn event_log_seq_dense(
        appended in 1usize..200usize,
        cap in 1usize..50usize,
    ) {
        let mut log = EventLog::new(InstrumentId(1), cap);
        for _ in 0..appended {
            log.append(Timestamp::from_millis(0), EventPayload::InstrumentUpdated);
        }
        let seqs: Vec<u64> = log.events().map(|e| e.seq.0).collect();
        prop_assert!(seqs.len() <= cap);
        for pair in seqs.windows(2) {
            prop_assert_eq!(pair[1], pair[0] + 1);
        }
        if let Some(last) = seqs.last() {
            prop_assert_eq!(*last, appended as u64);
        }
    }
}
