//! One leg fills fast, the other times out empty: the executor cancels the
//! laggard and brings it up to the trigger quantity with aggressive limits.

mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::BatchOptions;
use atomex::testing::{MockVenue, OrderScript};
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn trigger_fill_cancels_sibling_and_hedges_it() {
    let venue_a = MockVenue::builder("venue-a").build();
    let venue_b = MockVenue::builder("venue-b").build();

    // A fills quickly; B's leg order rests until cancelled.
    venue_a.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(100),
        price: None,
    });
    venue_b.script_limit(OrderScript::StayOpen);
    // First hedge attempt rests too; the second fills.
    venue_b.script_limit(OrderScript::StayOpen);
    venue_b.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(10),
        price: None,
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

    assert_eq!(venue_a.position("BTC"), dec!(0.02));
    assert_eq!(venue_b.position("BTC"), dec!(-0.02));

    // B's fills came through the aggressive-limit hedge path.
    let hedged = result
        .filled_orders
        .iter()
        .find(|report| report.hedge)
        .expect("hedged leg report");
    assert!(hedged.execution_mode_used.starts_with("aggressive_limit"));
    assert_eq!(hedged.filled_quantity, dec!(0.02));

    // Leg order + two hedge attempts on B, all limits.
    assert_eq!(venue_b.placements().len(), 3);
}
