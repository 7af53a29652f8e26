/// Single-order execution: per-mode executors and confirmation.

pub mod confirm;
pub mod limit;
pub mod market;

pub use confirm::ConfirmationWaiter;
pub use limit::LimitOrderExecutor;
pub use market::MarketOrderExecutor;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::info;

use crate::config::ConfirmConfig;
use crate::order::{CancelSignal, ExecutionMode, OrderReport, Side};
use crate::pricing::PriceProvider;
use crate::venue::VenueClient;

/// Callback invoked with the venue order id as soon as placement returns,
/// so the websocket router can start routing callbacks for it.
pub type OrderIdSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Parameters shared by every execution mode.
#[derive(Clone)]
pub struct ExecRequest {
    pub venue: Arc<dyn VenueClient>,
    pub symbol: String,
    pub side: Side,
    pub size_usd: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub timeout: Duration,
    /// Maker price improvement fraction for limit modes.
    pub offset_pct: Decimal,
    pub reduce_only: bool,
}

impl ExecRequest {
    pub fn venue_name(&self) -> String {
        self.venue.name().to_uppercase()
    }
}

/// Tiered order placement: dispatches a request to the right executor and
/// stitches fallback results together.
pub struct OrderPlacer {
    limit: LimitOrderExecutor,
    market: MarketOrderExecutor,
}

impl OrderPlacer {
    pub fn new(prices: Arc<PriceProvider>, confirm: ConfirmConfig) -> Self {
        Self {
            limit: LimitOrderExecutor::new(prices.clone()),
            market: MarketOrderExecutor::new(prices, confirm),
        }
    }

    pub fn limit_executor(&self) -> &LimitOrderExecutor {
        &self.limit
    }

    pub fn market_executor(&self) -> &MarketOrderExecutor {
        &self.market
    }

    /// Execute one order in the requested mode. Always resolves to a
    /// report; failures are fields, not errors.
    pub async fn execute(
        &self,
        mode: ExecutionMode,
        req: ExecRequest,
        cancel: Option<&CancelSignal>,
        on_order_id: Option<OrderIdSink<'_>>,
    ) -> OrderReport {
        let started = tokio::time::Instant::now();
        let mut report = match mode {
            ExecutionMode::LimitOnly => self.limit.execute(&req, cancel, on_order_id).await,
            ExecutionMode::MarketOnly => self.market.execute(&req, on_order_id).await,
            ExecutionMode::LimitWithFallback | ExecutionMode::Adaptive => {
                self.limit_with_fallback(&req, cancel, on_order_id).await
            }
        };
        report.execution_time_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Limit first; on timeout or a non-retryable failure, market the
    /// unfilled remainder and merge the fills.
    async fn limit_with_fallback(
        &self,
        req: &ExecRequest,
        cancel: Option<&CancelSignal>,
        on_order_id: Option<OrderIdSink<'_>>,
    ) -> OrderReport {
        let limit_report = self.limit.execute(req, cancel, on_order_id).await;
        if limit_report.filled || limit_report.retryable {
            return limit_report;
        }
        if cancel.map(|c| c.is_set()).unwrap_or(false) {
            // Cancellation requested mid-flight; do not chase with a market order.
            return limit_report;
        }

        info!(
            "[{}] limit leg unfilled for {}; falling back to market for the remainder",
            req.venue_name(),
            req.symbol
        );

        let mut market_req = req.clone();
        if let Some(target) = req.quantity {
            let remaining = (target - limit_report.filled_quantity).max(Decimal::ZERO);
            if remaining <= Decimal::ZERO {
                return limit_report;
            }
            market_req.quantity = Some(remaining);
        } else if let (Some(size_usd), Some(price)) = (req.size_usd, limit_report.fill_price) {
            let spent = limit_report.filled_quantity * price;
            market_req.size_usd = Some((size_usd - spent).max(Decimal::ZERO));
        }

        let market_report = self.market.execute(&market_req, on_order_id).await;
        merge_reports(limit_report, market_report, "market_fallback")
    }
}

/// Merge two sequential partial executions into one weighted report.
///
/// Per-order fill attribution is preserved so the context ledger can
/// reconcile each underlying order independently.
pub(crate) fn merge_reports(first: OrderReport, second: OrderReport, mode: &str) -> OrderReport {
    let total = first.filled_quantity + second.filled_quantity;
    if total <= Decimal::ZERO {
        let mut report = second;
        report.execution_mode_used = mode.to_string();
        return report;
    }

    let weighted_price = match (first.fill_price, second.fill_price) {
        (Some(a), Some(b)) => {
            Some((a * first.filled_quantity + b * second.filled_quantity) / total)
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };

    let mut fills = first.fill_entries();
    fills.extend(second.fill_entries());

    OrderReport {
        success: second.success || second.filled || first.filled,
        filled: second.filled || first.filled,
        fill_price: weighted_price,
        filled_quantity: total,
        slippage_usd: first.slippage_usd + second.slippage_usd,
        execution_mode_used: mode.to_string(),
        order_id: second.order_id.or(first.order_id),
        error: second.error,
        retryable: false,
        hedge: first.hedge || second.hedge,
        execution_time_ms: 0,
        fills,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn report(qty: Decimal, price: Option<Decimal>, filled: bool) -> OrderReport {
        OrderReport {
            success: filled,
            filled,
            fill_price: price,
            filled_quantity: qty,
            ..OrderReport::default()
        }
    }

    #[test]
    fn merge_weights_prices_by_quantity() {
        let merged = merge_reports(
            report(dec!(0.008), Some(dec!(100)), false),
            report(dec!(0.012), Some(dec!(110)), true),
            "market_fallback",
        );
        assert_eq!(merged.filled_quantity, dec!(0.02));
        // (0.008*100 + 0.012*110) / 0.02 = 106
        assert_eq!(merged.fill_price, Some(dec!(106)));
        assert!(merged.filled);
        assert_eq!(merged.execution_mode_used, "market_fallback");
    }

    #[test]
    fn merge_with_no_fills_keeps_second_error() {
        let merged = merge_reports(
            report(Decimal::ZERO, None, false),
            OrderReport::failure("market_failed", "no liquidity"),
            "market_fallback",
        );
        assert!(!merged.success);
        assert_eq!(merged.error.as_deref(), Some("no liquidity"));
    }
}
