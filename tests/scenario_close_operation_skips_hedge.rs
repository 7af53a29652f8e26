//! A reduce-only batch that fully fills closes both positions with no
//! hedge, no imbalance gating, and no rollback.

mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::BatchOptions;
use atomex::testing::{MockVenue, OrderScript, PlacementKind};
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn close_batch_fills_and_returns_without_hedging() {
    let venue_a = MockVenue::builder("venue-a").build();
    let venue_b = MockVenue::builder("venue-b").build();

    // Existing delta-neutral pair: short on A, long on B.
    venue_a.set_position("BTC", dec!(-0.02), dec!(50000));
    venue_b.set_position("BTC", dec!(0.02), dec!(50000));

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
                common::leg(
                    &venue_a,
                    Side::Buy,
                    ExecutionMode::LimitOnly,
                    dec!(1000),
                    dec!(0.02),
                    true,
                ),
                common::leg(
                    &venue_b,
                    Side::Sell,
                    ExecutionMode::LimitOnly,
                    dec!(1000),
                    dec!(0.02),
                    true,
                ),
            ],
            BatchOptions::default(),
        )
        .await;

    assert!(result.success, "batch failed: {:?}", result.error_message);
    assert!(result.all_filled);
    assert!(!result.rollback_performed);
    // Imbalance gating is waived for close operations.
    assert_eq!(result.residual_imbalance_tokens, Decimal::ZERO);

    // Both positions are flat.
    assert_eq!(venue_a.position("BTC"), Decimal::ZERO);
    assert_eq!(venue_b.position("BTC"), Decimal::ZERO);

    // Only the reduce-only close legs themselves; no market orders.
    for venue in [&venue_a, &venue_b] {
        let placements = venue.placements();
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].kind, PlacementKind::Limit);
        assert!(placements[0].reduce_only);
    }
}
