//! Running the emergency rollback twice over the same fills closes the
//! positions exactly once; the second pass is free.

mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::RollbackManager;
use atomex::config::ExecutionConfig;
use atomex::order::{OrderContext, OrderReport};
use atomex::testing::{MockVenue, PlacementKind};
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn second_rollback_invocation_costs_nothing() {
    let cfg = ExecutionConfig::default();
    let venue = MockVenue::builder("venue-a").build();
    venue.set_position("BTC", dec!(0.02), dec!(50000));

    let ctx = OrderContext::new(common::btc_leg(&venue, Side::Buy, ExecutionMode::LimitOnly));
    ctx.apply_report(OrderReport {
        success: true,
        filled: true,
        fill_price: Some(dec!(50000)),
        filled_quantity: dec!(0.02),
        execution_mode_used: "limit".to_string(),
        ..OrderReport::default()
    });

    let manager = RollbackManager::new(cfg.rollback.clone(), cfg.fill_sanity_cap);
    let contexts = vec![ctx];

    let first_cost = manager
        .emergency_rollback(&contexts, "test unwind", Decimal::ZERO, Decimal::ZERO)
        .await;
    assert_eq!(venue.position("BTC"), Decimal::ZERO);
    assert!(first_cost >= Decimal::ZERO);
    assert_eq!(contexts[0].filled_quantity(), Decimal::ZERO);

    let closes_after_first = venue
        .placements()
        .into_iter()
        .filter(|p| p.kind == PlacementKind::Market && p.reduce_only)
        .count();
    assert_eq!(closes_after_first, 1);

    // Contexts were cleared; the second pass has nothing to close.
    let second_cost = manager
        .emergency_rollback(&contexts, "test unwind again", Decimal::ZERO, Decimal::ZERO)
        .await;
    assert_eq!(second_cost, Decimal::ZERO);
    assert_eq!(venue.position("BTC"), Decimal::ZERO);

    let closes_after_second = venue
        .placements()
        .into_iter()
        .filter(|p| p.kind == PlacementKind::Market && p.reduce_only)
        .count();
    assert_eq!(closes_after_second, 1, "no second close order");
}
