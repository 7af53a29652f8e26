//! Both legs fill via resting limits: balanced success, no hedge, no
//! rollback.

mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::BatchOptions;
use atomex::testing::{MockVenue, OrderScript, PlacementKind};
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn both_limit_legs_fill_and_batch_balances() {
    let venue_a = MockVenue::builder("venue-a").build();
    let venue_b = MockVenue::builder("venue-b").build();

    venue_a.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(50),
        price: None,
    });
    venue_b.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(50),
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
    assert_eq!(result.filled_orders.len(), 2);
    assert!(result.partial_fills.is_empty());

    // Delta neutral: long 0.02 on A, short 0.02 on B.
    assert_eq!(venue_a.position("BTC"), dec!(0.02));
    assert_eq!(venue_b.position("BTC"), dec!(-0.02));

    // One limit placement per venue, nothing else.
    for venue in [&venue_a, &venue_b] {
        let placements = venue.placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].kind, PlacementKind::Limit);
        assert!(!placements[0].reduce_only);
    }
}

#[tokio::test(start_paused = true)]
async fn empty_batch_is_a_trivial_success() {
    let result = common::executor()
        .execute_atomically(vec![], BatchOptions::default())
        .await;
    assert!(result.success);
    assert!(result.all_filled);
    assert!(result.filled_orders.is_empty());
}
