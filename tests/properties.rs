//! Property tests over the pure bookkeeping: fill monotonicity, notional
//! caps, ledger idempotence, and imbalance arithmetic.

mod common;

use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use atomex::analysis::ImbalanceAnalyzer;
use atomex::order::OrderContext;
use atomex::preflight::LeverageLimits;
use atomex::testing::MockVenue;
use atomex::{ExecutionMode, Side};

fn ctx_with_quantity(quantity: Decimal) -> Arc<OrderContext> {
    let venue = MockVenue::builder("venue-p").build();
    OrderContext::new(common::leg(
        &venue,
        Side::Buy,
        ExecutionMode::LimitOnly,
        dec!(1000),
        quantity,
        false,
    ))
}

/// Micro-quantities in [0.000001, 1.0].
fn qty() -> impl Strategy<Value = Decimal> {
    (1u64..1_000_000).prop_map(|raw| Decimal::new(raw as i64, 6))
}

proptest! {
    #[test]
    fn filled_quantity_is_monotone(ops in prop::collection::vec((0u8..3u8, 1u64..1_000_000u64), 1..40)) {
        let ctx = ctx_with_quantity(dec!(1000));
        let mut last = Decimal::ZERO;
        let mut running_total = Decimal::ZERO;
        for (i, (kind, raw)) in ops.into_iter().enumerate() {
            let quantity = Decimal::new(raw as i64, 6);
            match kind {
                0 => ctx.record_fill(quantity, Some(dec!(100))),
                1 => ctx.on_websocket_fill(&format!("ws-{i}"), quantity, Some(dec!(100))),
                _ => {
                    // Per-order totals only ratchet upward.
                    running_total += quantity;
                    ctx.record_order_fill_total("retry-order", running_total, Some(dec!(100)));
                }
            }
            let now = ctx.filled_quantity();
            prop_assert!(now >= last, "fills went backwards: {last} -> {now}");
            last = now;
        }
    }

    #[test]
    fn filled_usd_never_exceeds_size_usd(fills in prop::collection::vec((qty(), 1u64..100_000u64), 1..20)) {
        let ctx = ctx_with_quantity(dec!(1000));
        for (quantity, price_raw) in fills {
            let price = Decimal::new(price_raw as i64, 2);
            ctx.record_fill(quantity, Some(price));
            prop_assert!(ctx.filled_usd() <= ctx.spec.size_usd);
        }
    }

    #[test]
    fn zero_and_negative_fills_never_change_state(quantity in qty()) {
        let ctx = ctx_with_quantity(dec!(1));
        ctx.record_fill(Decimal::ZERO, Some(dec!(100)));
        ctx.record_fill(-quantity, Some(dec!(100)));
        prop_assert_eq!(ctx.filled_quantity(), Decimal::ZERO);
        prop_assert_eq!(ctx.filled_usd(), Decimal::ZERO);
    }

    #[test]
    fn order_ledger_is_idempotent(total in qty(), replays in 1usize..5) {
        let ctx = ctx_with_quantity(dec!(1000));
        for _ in 0..=replays {
            ctx.record_order_fill_total("ord-1", total, Some(dec!(100)));
        }
        prop_assert_eq!(ctx.filled_quantity(), total);
    }

    #[test]
    fn imbalance_pct_is_a_ratio(long in qty(), short in qty()) {
        let long_ctx = ctx_with_quantity(dec!(1000));
        long_ctx.record_fill(long, Some(dec!(100)));

        let venue = MockVenue::builder("venue-q").build();
        let short_ctx = OrderContext::new(common::leg(
            &venue,
            Side::Sell,
            ExecutionMode::LimitOnly,
            dec!(1000),
            dec!(1000),
            false,
        ));
        short_ctx.record_fill(short, Some(dec!(100)));

        let analyzer = ImbalanceAnalyzer::new(dec!(0.01));
        let snapshot = analyzer.calculate(&[long_ctx, short_ctx]);

        prop_assert_eq!(snapshot.imbalance_tokens, (long - short).abs());
        prop_assert!(snapshot.imbalance_pct >= Decimal::ZERO);
        prop_assert!(snapshot.imbalance_pct <= Decimal::ONE);
        if long == short {
            prop_assert_eq!(snapshot.imbalance_pct, Decimal::ZERO);
        }
    }

    #[test]
    fn max_size_never_exceeds_any_single_limit(
        max_notional in prop::option::of(1u64..1_000_000u64),
        max_leverage in prop::option::of(1u64..100u64),
        margin_bps in prop::option::of(1u64..10_000u64),
        balance in 1u64..1_000_000u64,
    ) {
        let limits = LeverageLimits {
            max_leverage: max_leverage.map(Decimal::from),
            max_notional: max_notional.map(Decimal::from),
            margin_requirement: margin_bps.map(|bps| Decimal::new(bps as i64, 4)),
        };
        let balance = Decimal::from(balance);
        if let Some(max_size) = limits.max_size_usd(Some(balance)) {
            if let Some(notional) = limits.max_notional {
                prop_assert!(max_size <= notional);
            }
            if let Some(leverage) = limits.max_leverage {
                prop_assert!(max_size <= leverage * balance);
            }
            if let Some(margin) = limits.margin_requirement {
                prop_assert!(max_size <= balance / margin);
            }
        }
    }
}
