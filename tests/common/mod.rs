//! Shared fixtures for the batch execution scenarios.
#![allow(dead_code)] // each scenario binary uses a different subset

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::testing::MockVenue;
use atomex::venue::VenueClient;
use atomex::{AtomicMultiOrderExecutor, ExecutionConfig, ExecutionMode, OrderSpec, Side};

/// Executor with default production tolerances.
pub fn executor() -> AtomicMultiOrderExecutor {
    AtomicMultiOrderExecutor::new(ExecutionConfig::default())
}

/// A BTC leg: $1000 notional, 0.02 quantity, 30 s timeout.
pub fn btc_leg(venue: &Arc<MockVenue>, side: Side, mode: ExecutionMode) -> OrderSpec {
    leg(venue, side, mode, dec!(1000), dec!(0.02), false)
}

pub fn leg(
    venue: &Arc<MockVenue>,
    side: Side,
    mode: ExecutionMode,
    size_usd: Decimal,
    quantity: Decimal,
    reduce_only: bool,
) -> OrderSpec {
    let venue: Arc<dyn VenueClient> = venue.clone();
    OrderSpec {
        venue,
        symbol: "BTC".to_string(),
        side,
        size_usd,
        quantity: Some(quantity),
        execution_mode: mode,
        timeout: Duration::from_secs(30),
        limit_price_offset_pct: None,
        reduce_only,
    }
}
