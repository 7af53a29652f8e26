use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::error::ExecError;
use crate::order::{CancelSignal, OrderReport, Side};
use crate::pricing::PriceProvider;
use crate::venue::{classify_cancel_reason, CancelDisposition, OrderStatus};

use super::{ExecRequest, OrderIdSink};

/// Places maker limit orders and waits for fills.
///
/// Tracks partial fills throughout so every exit path (fill, cancel,
/// timeout, venue cancel) reports an accurate `filled_quantity`.
pub struct LimitOrderExecutor {
    prices: Arc<PriceProvider>,
}

/// Running partial-fill tracker for one order attempt.
#[derive(Default)]
struct PartialTracker {
    quantity: Decimal,
    price: Option<Decimal>,
}

impl PartialTracker {
    /// Cumulative updates only ever move the tracked quantity up.
    fn update(&mut self, quantity: Option<Decimal>, price: Option<Decimal>) {
        let Some(quantity) = quantity else { return };
        if quantity <= self.quantity {
            return;
        }
        self.quantity = quantity;
        if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
            self.price = Some(price);
        }
    }
}

impl LimitOrderExecutor {
    pub fn new(prices: Arc<PriceProvider>) -> Self {
        Self { prices }
    }

    pub async fn execute(
        &self,
        req: &ExecRequest,
        cancel: Option<&CancelSignal>,
        on_order_id: Option<OrderIdSink<'_>>,
    ) -> OrderReport {
        let venue = &req.venue;
        let venue_name = req.venue_name();

        let (best_bid, best_ask) = match self.prices.get_bbo_prices(venue, &req.symbol, None).await
        {
            Ok(bbo) => bbo,
            Err(err) => return OrderReport::failure("limit_error", err.to_string()),
        };

        // Maker price with a small improvement over the touch.
        let limit_price = match req.side {
            Side::Buy => best_ask * (Decimal::ONE - req.offset_pct),
            Side::Sell => best_bid * (Decimal::ONE + req.offset_pct),
        };
        let limit_price = venue.round_to_tick(limit_price);

        let order_quantity = match derive_quantity(req, limit_price) {
            Ok(qty) => qty,
            Err(message) => return OrderReport::failure("limit_error", message),
        };

        let contract_id = venue.resolve_contract_id(&req.symbol);
        info!(
            "[{venue_name}] placing limit {} {} (contract {contract_id}): {order_quantity} @ ${limit_price}",
            req.side, req.symbol
        );

        let placed = match venue
            .place_limit(&contract_id, order_quantity, limit_price, req.side, req.reduce_only)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                return OrderReport::failure(
                    "limit_failed",
                    format!("limit order placement failed: {err}"),
                )
            }
        };
        if !placed.success {
            let reason = placed
                .error_message
                .unwrap_or_else(|| "placement refused".to_string());
            let failure = ExecError::PlacementFailure {
                venue: venue_name.clone(),
                reason: reason.clone(),
            };
            let mut report = OrderReport::failure("limit_failed", failure.to_string());
            report.retryable = classify_cancel_reason(&reason) == CancelDisposition::Retryable;
            return report;
        }
        let Some(order_id) = placed.order_id else {
            return OrderReport::failure("limit_failed", "venue returned no order id");
        };
        if let Some(sink) = on_order_id {
            sink(&order_id);
        }

        let mut partial = PartialTracker::default();
        let deadline = Instant::now() + req.timeout;

        loop {
            if cancel.map(|c| c.is_set()).unwrap_or(false) {
                info!("[{venue_name}] cancellation requested for limit order {order_id}");
                self.cancel_and_snapshot(req, &order_id, &mut partial).await;
                return build_partial_report(
                    "limit_cancelled",
                    "limit order cancelled by executor".to_string(),
                    false,
                    &partial,
                    limit_price,
                    &order_id,
                );
            }

            if Instant::now() >= deadline {
                break;
            }

            match venue.get_order_info(&order_id, false).await {
                Ok(Some(info)) => {
                    partial.update(Some(info.filled_size), info.price);

                    match info.status {
                        OrderStatus::Filled => {
                            let fill_price = info.price.unwrap_or(limit_price);
                            let filled_qty = info.filled_size;
                            info!(
                                "[{venue_name}] limit order filled: {filled_qty} @ ${fill_price}"
                            );
                            let slippage_usd = (fill_price - limit_price).abs() * filled_qty;
                            return OrderReport {
                                success: true,
                                filled: true,
                                fill_price: Some(fill_price),
                                filled_quantity: filled_qty,
                                slippage_usd,
                                execution_mode_used: "limit".to_string(),
                                order_id: Some(order_id),
                                ..OrderReport::default()
                            };
                        }
                        OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                            let reason = info.cancel_reason.unwrap_or_default();
                            return match classify_cancel_reason(&reason) {
                                CancelDisposition::Retryable => {
                                    warn!(
                                        "[{venue_name}] limit order {order_id} cancelled ({reason}); retryable"
                                    );
                                    build_partial_report(
                                        "limit_cancelled_post_only",
                                        format!("order cancelled: {reason}; retryable"),
                                        true,
                                        &partial,
                                        limit_price,
                                        &order_id,
                                    )
                                }
                                _ => {
                                    info!(
                                        "[{venue_name}] limit order {order_id} cancelled: {reason}"
                                    );
                                    build_partial_report(
                                        "limit_cancelled",
                                        format!("limit order cancelled: {reason}"),
                                        false,
                                        &partial,
                                        limit_price,
                                        &order_id,
                                    )
                                }
                            };
                        }
                        OrderStatus::Open | OrderStatus::PartiallyFilled => {}
                    }
                }
                Ok(None) => {}
                Err(err) => error!("[{venue_name}] order info poll failed for {order_id}: {err}"),
            }

            // Poll faster near the deadline.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let interval = if remaining > Duration::from_secs(5) {
                Duration::from_millis(500)
            } else {
                Duration::from_millis(200)
            };
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = sleep(interval) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                None => sleep(interval).await,
            }
        }

        // Timeout: pull the order and report whatever filled.
        warn!(
            "[{venue_name}] limit order timeout after {:.1}s, cancelling {order_id}",
            req.timeout.as_secs_f64()
        );
        self.cancel_and_snapshot(req, &order_id, &mut partial).await;
        let message = if partial.quantity > Decimal::ZERO {
            format!("limit order timeout after {:.1}s", req.timeout.as_secs_f64())
        } else {
            format!(
                "{} (limit order, {:.1}s)",
                ExecError::TimeoutWithoutFill,
                req.timeout.as_secs_f64()
            )
        };
        build_partial_report("limit_timeout", message, false, &partial, limit_price, &order_id)
    }

    /// Cancel at the venue and fold the ack plus one final snapshot into
    /// the partial tracker.
    async fn cancel_and_snapshot(
        &self,
        req: &ExecRequest,
        order_id: &str,
        partial: &mut PartialTracker,
    ) {
        match req.venue.cancel(order_id).await {
            Ok(ack) => partial.update(ack.filled_size, ack.price),
            Err(err) => error!("[{}] failed to cancel order {order_id}: {err}", req.venue_name()),
        }
        match req.venue.get_order_info(order_id, false).await {
            Ok(Some(info)) => partial.update(Some(info.filled_size), info.price),
            Ok(None) => {}
            Err(err) => warn!(
                "[{}] failed to fetch final snapshot for {order_id}: {err}",
                req.venue_name()
            ),
        }
    }
}

fn derive_quantity(req: &ExecRequest, price: Decimal) -> Result<Decimal, String> {
    let raw = match (req.quantity, req.size_usd) {
        (Some(quantity), _) => quantity.abs(),
        (None, Some(size_usd)) if price > Decimal::ZERO => (size_usd / price).abs(),
        _ => return Err("limit execution requires size_usd or quantity".to_string()),
    };
    let rounded = req.venue.round_to_step(raw);
    if rounded <= Decimal::ZERO {
        return Err("order quantity rounded to zero".to_string());
    }
    Ok(rounded)
}

fn build_partial_report(
    mode: &str,
    mut message: String,
    retryable: bool,
    partial: &PartialTracker,
    limit_price: Decimal,
    order_id: &str,
) -> OrderReport {
    let has_fills = partial.quantity > Decimal::ZERO;
    let fill_price = has_fills.then(|| partial.price.unwrap_or(limit_price));
    let slippage_usd = match fill_price {
        Some(price) if limit_price > Decimal::ZERO => (price - limit_price).abs() * partial.quantity,
        _ => Decimal::ZERO,
    };
    if has_fills {
        message = format!("{message} (partial fill qty={})", partial.quantity);
    }

    OrderReport {
        success: has_fills,
        filled: false,
        fill_price,
        filled_quantity: partial.quantity,
        slippage_usd,
        execution_mode_used: mode.to_string(),
        order_id: Some(order_id.to_string()),
        error: Some(message),
        retryable,
        ..OrderReport::default()
    }
}
