//! The batch installs its own callback routers and must hand the venues'
//! original hooks back on every exit path.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::{BatchOptions, WebsocketRouter};
use atomex::order::OrderContext;
use atomex::testing::{MockVenue, OrderScript};
use atomex::venue::{FillHook, VenueClient};
use atomex::{ExecutionMode, Side};

#[tokio::test(start_paused = true)]
async fn original_hooks_are_restored_after_the_batch() {
    let venue_a = MockVenue::builder("venue-a").build();
    let venue_b = MockVenue::builder("venue-b").build();

    // Pre-existing strategy-layer hook on A.
    let strategy_fills = Arc::new(AtomicU32::new(0));
    let counter = strategy_fills.clone();
    let original: FillHook = Arc::new(move |_, _, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    venue_a.swap_fill_hook(Some(original));

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
    assert!(result.success);

    // During the batch the router owned the hook; the fills it routed must
    // not have leaked into the strategy hook.
    let routed_during_batch = strategy_fills.load(Ordering::SeqCst);
    assert_eq!(routed_during_batch, 0);

    // After the batch, emitted fills reach the original hook again.
    venue_a.emit_fill("some-order", dec!(50000), dec!(0.01));
    assert_eq!(strategy_fills.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn callbacks_before_registration_are_queued_and_replayed() {
    let venue = MockVenue::builder("venue-a").build();
    let venues: Vec<Arc<dyn VenueClient>> = vec![venue.clone()];

    let router = WebsocketRouter::new();
    let guard = router.install(&venues);

    // Fill arrives before anyone registered the order id.
    venue.emit_fill("early-order", dec!(50000), dec!(0.01));

    let ctx = OrderContext::new(common::btc_leg(&venue, Side::Buy, ExecutionMode::LimitOnly));
    assert_eq!(ctx.filled_quantity(), Decimal::ZERO);

    // Registration flushes the queue in arrival order.
    router.register("early-order", ctx.clone());
    assert_eq!(ctx.filled_quantity(), dec!(0.01));

    drop(guard);
    assert!(!venue.has_fill_hook());
    assert!(!venue.has_status_hook());
}
