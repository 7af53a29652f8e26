//! Hedge targets track the trigger fill, and the sanity cap clamps to
//! `spec.quantity × 1.10` — not down to `spec.quantity`. A trigger that
//! legitimately delivers more than the sibling's spec must not leave the
//! sibling under-hedged by the cap margin.

mod common;

use std::time::Duration;

use rust_decimal_macros::dec;

use atomex::batch::BatchOptions;
use atomex::testing::{MockVenue, OrderScript};
use atomex::{ExecutionMode, Side};

/// Multiplier mismatch pushes the computed sibling target (20 tokens) past
/// the sibling's cap (18 × 1.10 = 19.8): the hedge must be placed for the
/// capped 19.8, not truncated to the 18-token spec.
#[tokio::test(start_paused = true)]
async fn clamped_hedge_target_lands_at_the_sanity_cap() {
    // A trades in kilo-units (1 unit = 1000 tokens) around $50k/unit;
    // B trades single tokens around $50.
    let venue_a = MockVenue::builder("venue-a").multiplier(1000).build();
    let venue_b = MockVenue::builder("venue-b")
        .book(dec!(49.99), dec!(50.01))
        .build();

    // A's 0.02 units fill fully (= 20 actual tokens).
    venue_a.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(100),
        price: None,
    });
    // B's 18-token leg rests until cancelled; the hedge attempt fills.
    venue_b.script_limit(OrderScript::StayOpen);
    venue_b.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(10),
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
                    false,
                ),
                common::leg(
                    &venue_b,
                    Side::Sell,
                    ExecutionMode::LimitOnly,
                    dec!(900),
                    dec!(18),
                    false,
                ),
            ],
            BatchOptions::default(),
        )
        .await;

    // 20 long vs 19.8 short is exactly the 1% tolerance: balanced success.
    assert!(result.success, "batch failed: {:?}", result.error_message);
    assert!(result.all_filled);
    assert!(!result.rollback_performed);
    assert_eq!(result.residual_imbalance_tokens, dec!(0.2));

    // Leg order for 18, then one hedge order for the capped 19.8 —
    // clamping to the 18-token spec would under-hedge by 10%.
    let placements = venue_b.placements();
    assert_eq!(placements.len(), 2);
    assert_eq!(placements[0].quantity, dec!(18));
    assert_eq!(placements[1].quantity, dec!(19.8));

    assert_eq!(venue_a.position("BTC"), dec!(0.02));
    assert_eq!(venue_b.position("BTC"), dec!(-19.8));
}

/// A trigger over-fill inside `(spec, spec × 1.10]` passes through to the
/// sibling untouched: the hedge matches the actual fill, not the spec.
#[tokio::test(start_paused = true)]
async fn trigger_overfill_within_cap_hedges_the_full_quantity() {
    let venue_a = MockVenue::builder("venue-a").build();
    let venue_b = MockVenue::builder("venue-b").build();

    // A's 0.02 order over-fills to 0.021 (within the 1.10x cap).
    venue_a.script_limit(OrderScript::PartialFillAfter {
        quantity: dec!(0.021),
        delay: Duration::from_millis(30),
    });
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

    // The hedge chases the trigger's 0.021, not the 0.02 spec.
    let placements = venue_b.placements();
    assert_eq!(placements.len(), 2);
    assert_eq!(placements[1].quantity, dec!(0.021));

    assert_eq!(venue_a.position("BTC"), dec!(0.021));
    assert_eq!(venue_b.position("BTC"), dec!(-0.021));
}
