use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::order::OrderContext;
use crate::venue::{OrderInfo, OrderStatus};

/// Resolve the authoritative fill quantity after an order was cancelled.
///
/// REST reports for cancelled orders are often wrong: some venues compute
/// `filled = size − remaining`, which for a cancelled order with zero
/// remaining claims a full fill that never happened. Source ranking:
/// websocket status callbacks > websocket cache > force-refreshed REST,
/// with a hard anti-spoof override when the upper tiers say CANCELED with
/// zero fills.
pub async fn reconcile_after_cancel(ctx: &OrderContext, sanity_cap: Decimal) {
    // Websocket already delivered the final word for this order.
    if ctx.websocket_cancelled() {
        debug!(
            "[RECONCILE] {} {} already handled by websocket callback; skipping",
            ctx.spec.venue_name(),
            ctx.spec.symbol
        );
        return;
    }
    if ctx.remaining_quantity() <= Decimal::ZERO {
        return;
    }
    let Some(order_id) = ctx.order_id() else {
        return;
    };

    let venue = &ctx.spec.venue;

    // Tier 1: the venue's websocket cache, no forced refresh.
    let cached = match venue.get_order_info(&order_id, false).await {
        Ok(info) => info,
        Err(err) => {
            warn!(
                "[RECONCILE] cache read failed for {} {order_id}: {err}",
                ctx.spec.symbol
            );
            None
        }
    };

    let info = match cached {
        Some(info) if info.status == OrderStatus::Canceled => {
            let reported = info.filled_size;
            let tracked = ctx.filled_quantity();
            if tracked <= Decimal::ZERO && reported <= Decimal::ZERO {
                debug!(
                    "[RECONCILE] {} order {order_id} CANCELED with 0 fills in cache; nothing to apply",
                    ctx.spec.symbol
                );
                return;
            }
            if tracked > Decimal::ZERO && reported <= Decimal::ZERO {
                // Cache is the higher-ranked source: the tracked fills were
                // phantom.
                warn!(
                    "[RECONCILE] {} order {order_id} CANCELED with 0 fills but context \
                     tracked {tracked}; clearing tracked fills",
                    ctx.spec.symbol
                );
                ctx.reset_fills();
                return;
            }
            if reported <= tracked {
                debug!(
                    "[RECONCILE] {} order {order_id} CANCELED fills already accounted \
                     (cache={reported}, context={tracked})",
                    ctx.spec.symbol
                );
                return;
            }
            Some(info)
        }
        Some(info) if info.status.is_terminal() => Some(info),
        // Tier 2: cache missing or non-terminal — force a REST refresh.
        _ => match venue.get_order_info(&order_id, true).await {
            Ok(info) => info,
            Err(err) => {
                warn!(
                    "[RECONCILE] failed to reconcile fill for {} after cancel: {err}",
                    ctx.spec.symbol
                );
                return;
            }
        },
    };

    let Some(info) = info else { return };
    apply_reconciled(ctx, &order_id, &info, sanity_cap);
}

fn apply_reconciled(ctx: &OrderContext, order_id: &str, info: &OrderInfo, sanity_cap: Decimal) {
    let reported = info.filled_size;
    let remaining = info.remaining_size;
    let tracked = ctx.filled_quantity();
    let spec_qty = ctx.spec.quantity;

    if info.status == OrderStatus::Canceled && reported <= Decimal::ZERO && tracked <= Decimal::ZERO
    {
        debug!(
            "[RECONCILE] {} order {order_id} CANCELED with 0 fills; nothing to record",
            ctx.spec.symbol
        );
        return;
    }

    // Anti-spoof: a cancelled order whose reported fill sits at ~spec size
    // with ~zero remaining, while nothing was observed locally, is the
    // `filled = size − remaining` artifact. Never apply it.
    if info.status == OrderStatus::Canceled && tracked <= Decimal::ZERO {
        if let Some(spec_qty) = spec_qty.filter(|q| *q > Decimal::ZERO) {
            let qty_diff_pct = (reported - spec_qty).abs() / spec_qty;
            let remaining_pct = remaining.max(Decimal::ZERO) / spec_qty;
            if qty_diff_pct < dec!(0.10) && remaining_pct < dec!(0.01) {
                warn!(
                    "[RECONCILE] {}",
                    ExecError::InvariantViolation(format!(
                        "rejecting spoofed fill for {} order {order_id}: CANCELED with \
                         filled_size={reported} ({:.2}% off spec {spec_qty}) and \
                         remaining_size={remaining}; context has 0 fills",
                        ctx.spec.symbol,
                        qty_diff_pct * dec!(100)
                    ))
                );
                return;
            }
        }
    }

    let order_tracked = ctx.order_fill_total(order_id);
    if reported <= Decimal::ZERO || reported <= order_tracked {
        debug!(
            "[RECONCILE] {} order {order_id} (status {}) reported filled_size={reported}, \
             already attributed {order_tracked}; no reconciliation needed",
            ctx.spec.symbol, info.status
        );
        return;
    }

    let additional = reported - order_tracked;

    // Sanity cap: a single reconciled delta must not blow past the spec.
    if let Some(spec_qty) = spec_qty {
        if tracked + additional > spec_qty * sanity_cap {
            warn!(
                "[RECONCILE] {}",
                ExecError::InvariantViolation(format!(
                    "suspicious fill for {} order {order_id}: additional={additional} would \
                     push total past {spec_qty} x {sanity_cap}; skipping",
                    ctx.spec.symbol
                ))
            );
            return;
        }
    }

    let price = info.price.filter(|p| *p > Decimal::ZERO);
    debug!(
        "[RECONCILE] {} order {order_id}: adding fill {additional} @ {price:?} (total {})",
        ctx.spec.symbol,
        tracked + additional
    );
    ctx.record_order_fill_total(order_id, reported, price);
    ctx.note_reconciled_fill(price);
}
