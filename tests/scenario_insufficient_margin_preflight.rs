//! Margin shortfall on one venue fails the batch before anything is placed.

mod common;

use rust_decimal_macros::dec;

use atomex::batch::BatchOptions;
use atomex::testing::MockVenue;
use atomex::venue::LeverageInfo;
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn margin_shortfall_blocks_placement() {
    let venue_a = MockVenue::builder("venue-a").build();
    // B can only cover $80 of margin against a $100 requirement (10% of
    // $1000) plus the 5% buffer.
    let venue_b = MockVenue::builder("venue-b")
        .balance(dec!(80))
        .leverage(LeverageInfo {
            max_leverage: None,
            max_notional: None,
            margin_requirement: Some(dec!(0.10)),
        })
        .build();

    let result = common::executor()
        .execute_atomically(
            vec![
                common::btc_leg(&venue_a, Side::Buy, ExecutionMode::LimitOnly),
                common::btc_leg(&venue_b, Side::Sell, ExecutionMode::LimitOnly),
            ],
            BatchOptions {
                skip_leverage_check: true,
                ..BatchOptions::default()
            },
        )
        .await;

    assert!(!result.success);
    assert!(!result.all_filled);
    assert!(!result.rollback_performed);

    let error = result.error_message.expect("error message");
    assert!(error.contains("balance"), "unexpected error: {error}");
    assert!(error.contains("venue-b"), "error must name the venue: {error}");
    assert!(error.contains("105"), "error must carry the buffered amount: {error}");

    // Zero orders placed anywhere.
    assert!(venue_a.placements().is_empty());
    assert!(venue_b.placements().is_empty());
}
