//! Post-cancel fill resolution: websocket ranks above REST, and the
//! `filled = size − remaining` REST artifact is never applied.

mod common;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::batch::reconcile_after_cancel;
use atomex::order::{OrderContext, OrderReport};
use atomex::testing::MockVenue;
use atomex::venue::{OrderInfo, OrderStatus, VenueClient};
use atomex::{ExecutionMode, Side};

const SANITY_CAP: Decimal = dec!(1.10);

async fn resting_order(venue: &std::sync::Arc<MockVenue>) -> (std::sync::Arc<OrderContext>, String) {
    let ack = venue
        .place_limit("BTC-PERP", dec!(0.02), dec!(50000), Side::Buy, false)
        .await
        .unwrap();
    let order_id = ack.order_id.unwrap();

    let ctx = OrderContext::new(common::btc_leg(venue, Side::Buy, ExecutionMode::LimitOnly));
    ctx.apply_report(OrderReport {
        success: false,
        filled: false,
        filled_quantity: Decimal::ZERO,
        execution_mode_used: "limit_timeout".to_string(),
        order_id: Some(order_id.clone()),
        error: Some("limit order timeout after 30.0s".to_string()),
        ..OrderReport::default()
    });
    (ctx, order_id)
}

#[tokio::test(start_paused = true)]
async fn spoofed_rest_fill_is_rejected() {
    let venue = MockVenue::builder("venue-a").build();
    let (ctx, order_id) = resting_order(&venue).await;

    // Cache still shows the order open; REST claims a full fill on a
    // cancelled order with zero remaining.
    venue.set_rest_override(
        &order_id,
        OrderInfo {
            order_id: order_id.clone(),
            status: OrderStatus::Canceled,
            size: dec!(0.02),
            filled_size: dec!(0.02),
            remaining_size: Decimal::ZERO,
            price: Some(dec!(50000)),
            cancel_reason: None,
        },
    );

    reconcile_after_cancel(&ctx, SANITY_CAP).await;
    assert_eq!(ctx.filled_quantity(), Decimal::ZERO, "phantom fill applied");
}

#[tokio::test(start_paused = true)]
async fn websocket_cancel_with_zero_fills_suppresses_rest() {
    let venue = MockVenue::builder("venue-a").build();
    let (ctx, order_id) = resting_order(&venue).await;

    // Websocket already said CANCELED with zero fills.
    ctx.on_websocket_cancel(&order_id, Decimal::ZERO);
    venue.spoof_rest_fills_on_cancel();

    reconcile_after_cancel(&ctx, SANITY_CAP).await;
    assert_eq!(ctx.filled_quantity(), Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn genuine_partial_fill_is_applied() {
    let venue = MockVenue::builder("venue-a").build();
    let (ctx, order_id) = resting_order(&venue).await;

    // The cache reports a real partial: 0.008 filled, far from spec size.
    venue.override_cached_order(
        &order_id,
        OrderInfo {
            order_id: order_id.clone(),
            status: OrderStatus::Canceled,
            size: dec!(0.02),
            filled_size: dec!(0.008),
            remaining_size: dec!(0.012),
            price: Some(dec!(50000)),
            cancel_reason: Some("cancelled_by_user".to_string()),
        },
    );

    reconcile_after_cancel(&ctx, SANITY_CAP).await;
    assert_eq!(ctx.filled_quantity(), dec!(0.008));
    let report = ctx.report().unwrap();
    assert!(report.filled);
    assert_eq!(report.filled_quantity, dec!(0.008));
}

#[tokio::test(start_paused = true)]
async fn reconciled_delta_is_capped_at_sanity_limit() {
    let venue = MockVenue::builder("venue-a").build();
    let (ctx, order_id) = resting_order(&venue).await;

    // Reported fill of 0.05 on a 0.02 spec: past the 1.10x cap, rejected.
    venue.override_cached_order(
        &order_id,
        OrderInfo {
            order_id: order_id.clone(),
            status: OrderStatus::Canceled,
            size: dec!(0.05),
            filled_size: dec!(0.05),
            remaining_size: dec!(0.5),
            price: Some(dec!(50000)),
            cancel_reason: Some("cancelled_by_user".to_string()),
        },
    );

    reconcile_after_cancel(&ctx, SANITY_CAP).await;
    assert_eq!(ctx.filled_quantity(), Decimal::ZERO);
}
