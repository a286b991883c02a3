//! Exchange core simulation.
//!
//! Drives the full engine lifecycle against a static oracle: order
//! matching, position tracking, funding, a liquidation episode, and an
//! oracle staleness halt.

use exchange_core::*;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("Exchange Core Simulation");
    println!("Single instrument, isolated margin, full lifecycle\n");

    scenario_basic_matching();
    scenario_time_in_force();
    scenario_liquidation();
    scenario_stale_oracle_halt();

    println!("\nAll scenarios completed.");
}

fn setup(mark: rust_decimal::Decimal) -> (Exchange, Arc<StaticOracle>, Timestamp) {
    let oracle = Arc::new(StaticOracle::new());
    let mut exchange = Exchange::new(
        ExchangeConfig::default(),
        Arc::clone(&oracle) as Arc<dyn OracleAdapter>,
    )
    .expect("default config");
    exchange.list_instrument(Instrument::btc_perp());

    let now = Timestamp::from_millis(0);
    for id in 1..=3 {
        exchange.open_account(AccountId(id), now);
        exchange
            .deposit(AccountId(id), Quote::new(dec!(100000)))
            .expect("deposit");
    }
    oracle.set(InstrumentId(1), Price::new_unchecked(mark), now);
    exchange.poll_oracle(now).expect("mark sweep");
    (exchange, oracle, now)
}

/// Two traders cross; fills land at the maker's price.
fn scenario_basic_matching() {
    println!("Scenario 1: basic matching\n");
    let (mut exchange, _oracle, now) = setup(dec!(50000));
    let id = InstrumentId(1);

    exchange
        .submit(
            SubmitOrder::limit(
                AccountId(2),
                id,
                Side::Sell,
                dec!(1),
                Price::new_unchecked(dec!(50000)),
                TimeInForce::GTC,
            ),
            now,
        )
        .expect("maker");
    println!("  maker: SELL 1 BTC @ 50000");

    let report = exchange
        .submit(SubmitOrder::market(AccountId(1), id, Side::Buy, dec!(0.5)), now)
        .expect("taker");
    println!(
        "  taker: BUY 0.5 market, filled {} @ {}",
        report.filled_qty,
        report.avg_price.expect("has fills")
    );

    let depth = exchange.depth(id, now).expect("depth");
    println!(
        "  best ask after trade: {}\n",
        depth.best_ask().expect("remainder rests")
    );
}

/// FOK and post-only behavior against a thin book.
fn scenario_time_in_force() {
    println!("Scenario 2: time in force\n");
    let (mut exchange, _oracle, now) = setup(dec!(50000));
    let id = InstrumentId(1);

    exchange
        .submit(
            SubmitOrder::limit(
                AccountId(2),
                id,
                Side::Sell,
                dec!(0.3),
                Price::new_unchecked(dec!(50000)),
                TimeInForce::GTC,
            ),
            now,
        )
        .expect("maker");

    let fok = exchange.submit(
        SubmitOrder::limit(
            AccountId(1),
            id,
            Side::Buy,
            dec!(1),
            Price::new_unchecked(dec!(50000)),
            TimeInForce::FOK,
        ),
        now,
    );
    println!("  FOK for 1 BTC against 0.3 of depth: {:?}", fok.err().map(|e| e.to_string()));

    let post_only = exchange.submit(
        SubmitOrder::limit(
            AccountId(1),
            id,
            Side::Buy,
            dec!(0.1),
            Price::new_unchecked(dec!(50000)),
            TimeInForce::PostOnly,
        ),
        now,
    );
    println!(
        "  post-only at the ask: {:?}\n",
        post_only.err().map(|e| e.to_string())
    );
}

/// A leveraged long gets liquidated as the mark drops.
fn scenario_liquidation() {
    println!("Scenario 3: liquidation\n");
    let (mut exchange, oracle, now) = setup(dec!(50000));
    let id = InstrumentId(1);

    // trader 1 goes long 10 BTC against trader 2, then withdraws spare cash
    exchange
        .submit(
            SubmitOrder::limit(
                AccountId(2),
                id,
                Side::Sell,
                dec!(10),
                Price::new_unchecked(dec!(50000)),
                TimeInForce::GTC,
            ),
            now,
        )
        .expect("maker");
    exchange
        .submit(SubmitOrder::market(AccountId(1), id, Side::Buy, dec!(10)), now)
        .expect("open long");
    exchange
        .withdraw(AccountId(1), Quote::new(dec!(75000)))
        .expect("withdraw");

    // resting bids absorb the liquidation
    exchange
        .submit(
            SubmitOrder::limit(
                AccountId(3),
                id,
                Side::Buy,
                dec!(10),
                Price::new_unchecked(dec!(47500)),
                TimeInForce::GTC,
            ),
            now,
        )
        .expect("bid");

    let later = now.plus_ms(1_000);
    oracle.set(id, Price::new_unchecked(dec!(47600)), later);
    exchange.poll_oracle(later).expect("sweep");

    let liquidating = exchange.risk(id).expect("risk").liquidating_accounts();
    println!("  accounts in liquidation: {:?}", liquidating);
    let account = exchange.account(AccountId(1)).expect("account");
    println!(
        "  trader position after first pass: {:?}\n",
        account
            .position(id)
            .map(|p| p.size.value().to_string())
            .unwrap_or_else(|| "closed".to_string())
    );
}

/// A stale oracle halts trading; a fresh observation resumes it.
fn scenario_stale_oracle_halt() {
    println!("Scenario 4: oracle staleness\n");
    let (mut exchange, oracle, now) = setup(dec!(50000));
    let id = InstrumentId(1);

    // no new observation for longer than the staleness threshold
    let late = now.plus_ms(10_000);
    exchange.poll_oracle(late).expect("sweep");
    let halted = exchange.engine(id).expect("engine").is_halted();
    println!("  after 10s of silence, halted: {}", halted);

    let rejected = exchange.submit(
        SubmitOrder::market(AccountId(1), id, Side::Buy, dec!(0.1)),
        late,
    );
    println!("  order while halted: {:?}", rejected.err().map(|e| e.to_string()));

    oracle.set(id, Price::new_unchecked(dec!(50100)), late);
    exchange.poll_oracle(late).expect("sweep");
    println!(
        "  after a fresh mark, halted: {}",
        exchange.engine(id).expect("engine").is_halted()
    );
}
