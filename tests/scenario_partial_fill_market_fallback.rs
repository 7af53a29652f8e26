//! Sibling partially fills before the trigger; the aggressive-limit hedge
//! budget runs dry and the market fallback covers the remainder.

mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::BatchOptions;
use atomex::testing::{MockVenue, OrderScript, PlacementKind};
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn market_fallback_completes_the_hedge() {
    let venue_a = MockVenue::builder("venue-a").build();
    let venue_b = MockVenue::builder("venue-b").build();

    venue_a.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(50),
        price: None,
    });
    // B fills 0.008 then rests; every hedge attempt rests too (the default
    // limit script), so the hedge exhausts its budget and markets the rest.
    venue_b.script_limit(OrderScript::PartialFillAfter {
        quantity: dec!(0.008),
        delay: Duration::from_millis(30),
    });

    let result = common::executor()
        .execute_atomically(
            vec![
                common::btc_leg(&venue_a, Side::Buy, ExecutionMode::LimitOnly),
                common::btc_leg(&venue_b, Side::Sell, ExecutionMode::LimitOnly),
            ],
            BatchOptions::default(),
        )
        .await;

    assert!(result.success, "batch failed: {:?}", result.error_message);
    assert!(result.all_filled);
    assert!(!result.rollback_performed);
    assert_eq!(result.residual_imbalance_tokens, Decimal::ZERO);

    // 0.008 maker + 0.012 taker on B.
    assert_eq!(venue_a.position("BTC"), dec!(0.02));
    assert_eq!(venue_b.position("BTC"), dec!(-0.02));

    let market_orders: Vec<_> = venue_b
        .placements()
        .into_iter()
        .filter(|p| p.kind == PlacementKind::Market)
        .collect();
    assert_eq!(market_orders.len(), 1, "exactly one taker order for the remainder");
    assert_eq!(market_orders[0].quantity, dec!(0.012));
    assert_eq!(market_orders[0].side, Side::Sell);
}
