use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use crate::config::ConfirmConfig;
use crate::error::ExecError;
use crate::order::{OrderReport, Side};
use crate::pricing::PriceProvider;
use crate::venue::{classify_cancel_reason, CancelDisposition, OrderStatus};

use super::{merge_reports, ConfirmationWaiter, ExecRequest, LimitOrderExecutor, OrderIdSink};

/// Executes market orders with partial-fill tracking and a slippage
/// fallback.
///
/// Venues with slippage protection may cancel a market order after a
/// partial fill; that partial is tracked (it created real exposure) and the
/// remainder is chased with an at-touch limit order.
pub struct MarketOrderExecutor {
    prices: Arc<PriceProvider>,
    limit: LimitOrderExecutor,
    waiter: ConfirmationWaiter,
}

impl MarketOrderExecutor {
    pub fn new(prices: Arc<PriceProvider>, confirm: ConfirmConfig) -> Self {
        Self {
            limit: LimitOrderExecutor::new(prices.clone()),
            waiter: ConfirmationWaiter::new(confirm),
            prices,
        }
    }

    pub async fn execute(&self, req: &ExecRequest, on_order_id: Option<OrderIdSink<'_>>) -> OrderReport {
        let venue = &req.venue;
        let venue_name = req.venue_name();

        let (best_bid, best_ask) = match self.prices.get_bbo_prices(venue, &req.symbol, None).await
        {
            Ok(bbo) => bbo,
            Err(err) => return OrderReport::failure("market_error", err.to_string()),
        };
        let expected_price = match req.side {
            Side::Buy => best_ask,
            Side::Sell => best_bid,
        };

        let order_quantity = match derive_quantity(req, expected_price) {
            Ok(qty) => qty,
            Err(message) => return OrderReport::failure("market_error", message),
        };

        let contract_id = venue.resolve_contract_id(&req.symbol);
        info!(
            "[{venue_name}] placing market {} {} (contract {contract_id}): {order_quantity} @ ~${expected_price}",
            req.side, req.symbol
        );

        let placed = match venue
            .place_market(&contract_id, order_quantity, req.side, req.reduce_only)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                return OrderReport::failure("market_failed", format!("market order failed: {err}"))
            }
        };
        if !placed.success {
            let reason = placed
                .error_message
                .unwrap_or_else(|| "placement refused".to_string());
            let failure = ExecError::PlacementFailure {
                venue: venue_name.clone(),
                reason,
            };
            return OrderReport::failure("market_failed", failure.to_string());
        }
        let order_id = placed.order_id;
        if let (Some(sink), Some(id)) = (on_order_id, order_id.as_deref()) {
            sink(id);
        }

        // Confirm terminal state (websocket first, REST last).
        let mut info = self
            .waiter
            .wait_for_confirmation(venue, order_id.as_deref())
            .await;
        if info.is_none() {
            if let Some(id) = order_id.as_deref() {
                info = venue.get_order_info(id, true).await.ok().flatten();
            }
        }
        let Some(info) = info else {
            return OrderReport {
                order_id,
                ..OrderReport::failure("market_no_info", "market order placed but no order info available")
            };
        };

        match info.status {
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                self.handle_cancelled(req, order_id, order_quantity, expected_price, info).await
            }
            OrderStatus::Filled => {
                let fill_price = info.price.filter(|p| *p > Decimal::ZERO).unwrap_or(expected_price);
                let filled_qty = if info.filled_size > Decimal::ZERO {
                    info.filled_size
                } else {
                    order_quantity
                };
                let slippage_usd = (fill_price - expected_price).abs() * filled_qty;
                info!(
                    "[{venue_name}] market order filled: {filled_qty} @ ${fill_price} \
                     (slippage ${slippage_usd:.2})"
                );
                OrderReport {
                    success: true,
                    filled: true,
                    fill_price: Some(fill_price),
                    filled_quantity: filled_qty,
                    slippage_usd,
                    execution_mode_used: "market".to_string(),
                    order_id,
                    ..OrderReport::default()
                }
            }
            status => {
                warn!("[{venue_name}] market order not filled: status={status}");
                OrderReport {
                    order_id,
                    ..OrderReport::failure(
                        "market_not_filled",
                        format!("market order not filled: status={status}"),
                    )
                }
            }
        }
    }

    /// Venue cancelled the market order. Track any partial fill and decide
    /// whether the slippage fallback applies to the remainder.
    async fn handle_cancelled(
        &self,
        req: &ExecRequest,
        order_id: Option<String>,
        order_quantity: Decimal,
        expected_price: Decimal,
        info: crate::venue::OrderInfo,
    ) -> OrderReport {
        let venue_name = req.venue_name();
        let cancel_reason = info.cancel_reason.unwrap_or_else(|| "unknown".to_string());
        let disposition = classify_cancel_reason(&cancel_reason);
        let partial_qty = info.filled_size.max(Decimal::ZERO);
        let partial_price = info.price.filter(|p| *p > Decimal::ZERO).unwrap_or(expected_price);

        if partial_qty > Decimal::ZERO {
            warn!(
                "[{venue_name}] market order cancelled with partial fill \
                 {partial_qty} @ ${partial_price} (reason: {cancel_reason})"
            );
            let remaining = order_quantity - partial_qty;
            let partial_report = OrderReport {
                success: false,
                filled: true,
                fill_price: Some(partial_price),
                filled_quantity: partial_qty,
                slippage_usd: (partial_price - expected_price).abs() * partial_qty,
                execution_mode_used: "market_partial_canceled".to_string(),
                order_id: order_id.clone(),
                error: Some(format!("market order cancelled with partial fill: {cancel_reason}")),
                ..OrderReport::default()
            };

            if disposition == CancelDisposition::SlippageFallback && remaining > dec!(0.0001) {
                warn!(
                    "[{venue_name}] slippage protection hit; chasing remaining {remaining} with limit"
                );
                let fallback = self
                    .fallback_to_limit(req, remaining, &cancel_reason)
                    .await;
                if fallback.filled {
                    let mut merged =
                        merge_reports(partial_report, fallback, "market_partial_limit_fallback");
                    merged.success = true;
                    return merged;
                }
                // Fallback failed: the partial must survive for rollback.
                let mut report = partial_report;
                report.execution_mode_used = "market_partial_fallback_failed".to_string();
                report.error = Some(format!(
                    "market order cancelled with partial fill ({partial_qty}/{order_quantity}); \
                     limit fallback failed: {}",
                    fallback.error.as_deref().unwrap_or("unknown error")
                ));
                return report;
            }
            return partial_report;
        }

        if disposition == CancelDisposition::SlippageFallback {
            warn!(
                "[{venue_name}] market order cancelled by slippage protection ({cancel_reason}); \
                 falling back to aggressive limit"
            );
            return self.fallback_to_limit(req, order_quantity, &cancel_reason).await;
        }

        error!("[{venue_name}] market order cancelled: {cancel_reason}");
        OrderReport {
            order_id,
            ..OrderReport::failure(
                "market_canceled",
                format!("market order cancelled: {cancel_reason}"),
            )
        }
    }

    /// At-touch limit for the remainder after a slippage cancel.
    async fn fallback_to_limit(
        &self,
        req: &ExecRequest,
        quantity: Decimal,
        original_reason: &str,
    ) -> OrderReport {
        let fallback_req = ExecRequest {
            venue: req.venue.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            size_usd: None,
            quantity: Some(quantity),
            timeout: Duration::from_secs(10),
            offset_pct: Decimal::ZERO, // at touch for immediate fill
            reduce_only: req.reduce_only,
        };
        let mut report = self.limit.execute(&fallback_req, None, None).await;
        if report.filled {
            report.execution_mode_used = "limit_slippage_fallback".to_string();
        } else {
            report.execution_mode_used = "limit_slippage_fallback_failed".to_string();
            report.error = Some(format!(
                "market order failed ({original_reason}) and limit fallback also failed: {}",
                report.error.as_deref().unwrap_or("unknown error")
            ));
        }
        report
    }
}

fn derive_quantity(req: &ExecRequest, expected_price: Decimal) -> Result<Decimal, String> {
    let raw = match (req.quantity, req.size_usd) {
        (Some(quantity), _) => quantity.abs(),
        (None, Some(size_usd)) if expected_price > Decimal::ZERO => {
            (size_usd / expected_price).abs()
        }
        _ => return Err("market execution requires size_usd or quantity".to_string()),
    };
    let rounded = req.venue.round_to_step(raw);
    if rounded <= Decimal::ZERO {
        return Err("order quantity rounded to zero".to_string());
    }
    Ok(rounded)
}
