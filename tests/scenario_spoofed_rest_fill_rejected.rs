//! A venue that computes `filled = size − remaining` on cancel reports a
//! phantom full fill over REST. Websocket CANCELED-with-zero wins and the
//! rollback closes only the leg that really filled.

mod common;

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::BatchOptions;
use atomex::testing::{MockVenue, OrderScript, PlacementKind};
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn phantom_rest_fill_never_becomes_a_position() {
    let venue_a = MockVenue::builder("venue-a").build();
    let venue_b = MockVenue::builder("venue-b").build();

    venue_a.script_limit(OrderScript::FillAfter {
        delay: Duration::from_millis(50),
        price: None,
    });
    // B's leg order rests and is cancelled with zero fills; every
    // force-refreshed REST read afterwards claims a full fill.
    venue_b.spoof_rest_fills_on_cancel();
    // Hedge attempts rest (default limit script) and the market fallback is
    // refused, so the batch must roll back.
    venue_b.script_market(OrderScript::FailPlacement {
        reason: "reduce-only margin check failed".to_string(),
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

    assert!(!result.success);
    assert!(result.rollback_performed);
    assert!(result.filled_orders.is_empty());

    // A's real 0.02 long was closed; B never had a position to close, and
    // the spoofed REST fill must not have invented one.
    assert_eq!(venue_a.position("BTC"), Decimal::ZERO);
    assert_eq!(venue_b.position("BTC"), Decimal::ZERO);

    let a_markets: Vec<_> = venue_a
        .placements()
        .into_iter()
        .filter(|p| p.kind == PlacementKind::Market)
        .collect();
    assert_eq!(a_markets.len(), 1);
    assert!(a_markets[0].reduce_only);
    assert_eq!(a_markets[0].quantity, dec!(0.02));
    assert_eq!(a_markets[0].side, Side::Sell);

    // No phantom close on B.
    assert!(venue_b
        .placements()
        .iter()
        .all(|p| p.kind == PlacementKind::Limit || !p.reduce_only));
}
