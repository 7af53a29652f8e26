use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HedgeConfig;
use crate::error::ExecError;
use crate::exec::{ExecRequest, OrderPlacer};
use crate::order::{ExecutionMode, OrderContext, OrderReport};
use crate::pricing::{HedgePricer, PriceProvider, PricingStrategy};
use crate::venue::{classify_cancel_reason, CancelDisposition, OrderStatus};

/// Terminal outcome of one hedge pass.
#[derive(Debug, Clone)]
pub struct HedgeOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl HedgeOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Running fill counters for one sibling's aggressive-limit pass.
///
/// Two counters are required: `current_order` tracks the active order only
/// (venues report per-order cumulative fills), while `accumulated` sums new
/// fills across all retries. Folding per-order totals through
/// `current_order` prevents double counting.
#[derive(Default)]
struct AttemptState {
    accumulated: Decimal,
    current_order: Decimal,
    last_fill_price: Option<Decimal>,
}

impl AttemptState {
    /// Fold in a per-order cumulative total; returns the new-fill delta.
    fn absorb_order_total(&mut self, order_total: Decimal, price: Option<Decimal>) -> Decimal {
        let delta = order_total - self.current_order;
        if delta <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.accumulated += delta;
        self.current_order = order_total;
        if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
            self.last_fill_price = Some(price);
        }
        delta
    }
}

struct AttemptPoll {
    filled: bool,
    partial_detected: bool,
    error: Option<String>,
    retry_after_backoff: bool,
}

/// Aggressive-limit hedge with a market fallback.
///
/// Brings every sibling up to its hedge target with adaptive limit pricing
/// (break-even → inside spread → touch), retrying within a per-operation
/// budget, and markets whatever remains when the budget runs out.
pub struct HedgeManager {
    pricer: HedgePricer,
    placer: Arc<OrderPlacer>,
    cfg: HedgeConfig,
}

impl HedgeManager {
    pub fn new(prices: Arc<PriceProvider>, placer: Arc<OrderPlacer>, cfg: HedgeConfig) -> Self {
        Self {
            pricer: HedgePricer::new(prices, cfg.max_deviation_pct),
            placer,
            cfg,
        }
    }

    /// Hedge every sibling of `trigger` (or every context when `trigger`
    /// is `None`) up to its target quantity.
    pub async fn aggressive_limit_hedge(
        &self,
        trigger: Option<&Arc<OrderContext>>,
        contexts: &[Arc<OrderContext>],
        reduce_only: bool,
    ) -> HedgeOutcome {
        let budget = self.cfg.budget(reduce_only).clone();
        let start = Instant::now();

        for ctx in contexts {
            if let Some(trigger) = trigger {
                if Arc::ptr_eq(ctx, trigger) {
                    continue;
                }
            }

            let venue_name = ctx.spec.venue_name();
            let symbol = ctx.spec.symbol.clone();

            // The hedge target wins over spec.quantity whenever set: it is
            // the multiplier-adjusted amount that matches the trigger fill.
            let hedge_target = match ctx.hedge_target().or(ctx.spec.quantity) {
                Some(target) => target,
                None => {
                    let message = format!(
                        "cannot determine hedge target for {venue_name} {symbol}: \
                         neither hedge_target_quantity nor spec.quantity is set"
                    );
                    error!("[HEDGE] {message}");
                    return HedgeOutcome::failed(message);
                }
            };

            let remaining = (hedge_target - ctx.filled_quantity()).max(Decimal::ZERO);
            if remaining <= Decimal::ZERO && ctx.remaining_usd() <= Decimal::ZERO {
                if let Some(trigger) = trigger {
                    if trigger.filled_quantity() > Decimal::ZERO && hedge_target > Decimal::ZERO {
                        warn!(
                            "[HEDGE] {venue_name} {symbol}: skipping hedge with remaining 0 while \
                             trigger filled {}; a phantom reconciled fill may have landed",
                            trigger.filled_quantity()
                        );
                    }
                }
                continue;
            }

            info!("[HEDGE] aggressive limit hedging {symbol} on {venue_name} for remaining {remaining}");

            let trigger_fill = trigger.and_then(|t| {
                t.report()
                    .and_then(|r| r.fill_price)
                    .map(|price| (t.spec.side, price))
            });

            let outcome = self
                .hedge_one(ctx, hedge_target, trigger_fill, reduce_only, &budget, start)
                .await;
            if !outcome.success {
                return outcome;
            }
        }

        HedgeOutcome::ok()
    }

    async fn hedge_one(
        &self,
        ctx: &Arc<OrderContext>,
        hedge_target: Decimal,
        trigger_fill: Option<(crate::order::Side, Decimal)>,
        reduce_only: bool,
        budget: &crate::config::HedgeBudget,
        start: Instant,
    ) -> HedgeOutcome {
        let venue = ctx.spec.venue.clone();
        let venue_name = ctx.spec.venue_name();
        let symbol = ctx.spec.symbol.clone();
        let side = ctx.spec.side;

        let initial_filled = ctx.filled_quantity();
        let mut state = AttemptState::default();
        let mut hedge_error: Option<String> = None;
        let mut hedge_success = false;
        let mut last_strategy = PricingStrategy::Touch;

        for attempt in 0..budget.max_retries {
            let elapsed = start.elapsed();
            if elapsed >= budget.total_timeout() {
                warn!(
                    "[HEDGE] budget exhausted after {:.2}s for {venue_name} {symbol}; \
                     falling back to market",
                    elapsed.as_secs_f64()
                );
                break;
            }

            // Fresh BBO every attempt; break-even only while viable.
            let priced = match self
                .pricer
                .hedge_limit_price(&venue, &symbol, side, trigger_fill, attempt, budget.inside_tick_retries)
                .await
            {
                Ok(priced) => priced,
                Err(err) => {
                    hedge_error = Some(err.to_string());
                    sleep(budget.retry_backoff()).await;
                    continue;
                }
            };
            last_strategy = priced.strategy;

            let total_filled = initial_filled + state.accumulated;
            let remaining = hedge_target - total_filled;
            if remaining <= Decimal::ZERO {
                hedge_success = true;
                break;
            }

            let order_quantity = venue.round_to_step(remaining);
            if order_quantity <= Decimal::ZERO {
                warn!(
                    "[HEDGE] {venue_name} {symbol}: order quantity rounded to zero \
                     (accumulated {}, target {hedge_target})",
                    state.accumulated
                );
                if state.accumulated > Decimal::ZERO {
                    hedge_success = true;
                }
                break;
            }

            debug!(
                "[HEDGE] {venue_name} attempt {}/{} for {symbol}: {} @ ${} qty={order_quantity} \
                 (bid ${}, ask ${})",
                attempt + 1,
                budget.max_retries,
                priced.strategy.as_str(),
                priced.limit_price,
                priced.best_bid,
                priced.best_ask
            );

            let contract_id = venue.resolve_contract_id(&symbol);
            let placed = match venue
                .place_limit(&contract_id, order_quantity, priced.limit_price, side, reduce_only)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    hedge_error = Some(err.to_string());
                    break;
                }
            };
            if !placed.success {
                let reason = placed
                    .error_message
                    .unwrap_or_else(|| format!("limit placement failed on {venue_name}"));
                if classify_cancel_reason(&reason) == CancelDisposition::Retryable {
                    info!("[HEDGE] {venue_name} post-only rejection for {symbol}; retrying with fresh BBO");
                    sleep(budget.retry_backoff()).await;
                    continue;
                }
                hedge_error = Some(reason);
                break;
            }
            let Some(order_id) = placed.order_id else {
                warn!("[HEDGE] {venue_name} returned no order id for {symbol}");
                sleep(budget.retry_backoff()).await;
                continue;
            };

            let remaining_budget = budget.total_timeout().saturating_sub(start.elapsed());
            if remaining_budget.is_zero() {
                let _ = venue.cancel(&order_id).await;
                break;
            }
            let attempt_timeout = self.cfg.attempt_timeout().min(remaining_budget);

            let poll = self
                .poll_attempt(
                    ctx,
                    &order_id,
                    order_quantity,
                    priced.limit_price,
                    initial_filled,
                    hedge_target,
                    attempt_timeout,
                    &mut state,
                )
                .await;

            if let Some(err) = poll.error {
                hedge_error = Some(err);
            }
            if poll.retry_after_backoff {
                sleep(budget.retry_backoff()).await;
                continue;
            }

            if poll.filled && state.accumulated > Decimal::ZERO {
                let total_filled = initial_filled + state.accumulated;
                if total_filled >= hedge_target * self.cfg.fill_threshold {
                    let fill_price = state.last_fill_price.unwrap_or(priced.limit_price);
                    info!(
                        "[HEDGE] {venue_name} hedge filled for {symbol} @ ${fill_price} \
                         ({}/{hedge_target} total, attempt {})",
                        total_filled,
                        attempt + 1
                    );
                    // Fills were recorded per order as the poll observed
                    // them; store the report without re-counting.
                    let report = OrderReport {
                        success: true,
                        filled: true,
                        fill_price: Some(fill_price),
                        filled_quantity: state.accumulated,
                        execution_mode_used: format!("aggressive_limit_{}", last_strategy.as_str()),
                        order_id: Some(order_id),
                        hedge: true,
                        ..OrderReport::default()
                    };
                    ctx.store_report(report);
                    hedge_success = true;
                    break;
                }
                // Enough for progress, not for the target: pull and retry.
                debug!(
                    "[HEDGE] {venue_name} partial {} ({}/{hedge_target}) for {symbol}; \
                     continuing for remainder",
                    state.accumulated, total_filled
                );
                if !poll.partial_detected {
                    let _ = venue.cancel(&order_id).await;
                }
                sleep(budget.retry_backoff()).await;
                continue;
            }
            if poll.partial_detected {
                sleep(budget.retry_backoff()).await;
                continue;
            }
            // No fill this attempt: pull the order and go again.
            let _ = venue.cancel(&order_id).await;
            if hedge_error.is_some() {
                break;
            }
            sleep(budget.retry_backoff()).await;
        }

        if hedge_success {
            return HedgeOutcome::ok();
        }

        // Budget exhausted. The poll loop already banked partial fills on
        // the context, so the market fallback sizes the true remainder.
        let total_filled = initial_filled + state.accumulated;
        if state.accumulated > Decimal::ZERO {
            info!(
                "[HEDGE] {venue_name} partial fills {} ({}/{hedge_target}) for {symbol}; \
                 market fallback for the remainder",
                state.accumulated, total_filled
            );
            ctx.sync_report_fills(state.last_fill_price);
        } else {
            warn!(
                "[HEDGE] {venue_name} aggressive limit hedge exhausted for {symbol} \
                 (fills so far {initial_filled}); market fallback for {hedge_target}"
            );
        }

        self.market_hedge_one(ctx, hedge_target, reduce_only, hedge_error).await
    }

    /// Poll one hedge order until it fills, partially fills, cancels, or
    /// the attempt window closes.
    #[allow(clippy::too_many_arguments)]
    async fn poll_attempt(
        &self,
        ctx: &Arc<OrderContext>,
        order_id: &str,
        order_quantity: Decimal,
        limit_price: Decimal,
        initial_filled: Decimal,
        hedge_target: Decimal,
        attempt_timeout: Duration,
        state: &mut AttemptState,
    ) -> AttemptPoll {
        let venue = &ctx.spec.venue;
        let venue_name = ctx.spec.venue_name();
        let symbol = &ctx.spec.symbol;
        let deadline = Instant::now() + attempt_timeout;

        let mut out = AttemptPoll {
            filled: false,
            partial_detected: false,
            error: None,
            retry_after_backoff: false,
        };

        while Instant::now() < deadline {
            match venue.get_order_info(order_id, false).await {
                Ok(Some(info)) => {
                    let order_total = info.filled_size.max(Decimal::ZERO);
                    match info.status {
                        OrderStatus::Filled => {
                            let total = if order_total > Decimal::ZERO {
                                order_total
                            } else {
                                order_quantity
                            };
                            let price = info.price.or(Some(limit_price));
                            state.absorb_order_total(total, price);
                            ctx.record_order_fill_total(order_id, total, price);
                            out.filled = true;
                            return out;
                        }
                        OrderStatus::PartiallyFilled | OrderStatus::Open
                            if order_total > Decimal::ZERO =>
                        {
                            let price = info.price.or(Some(limit_price));
                            let delta = state.absorb_order_total(order_total, price);
                            ctx.record_order_fill_total(order_id, order_total, price);
                            if delta > Decimal::ZERO {
                                out.partial_detected = true;
                                let total_filled = initial_filled + state.accumulated;
                                let remaining = hedge_target - total_filled;
                                info!(
                                    "[HEDGE] {venue_name} partial fill +{delta} for {symbol} \
                                     ({total_filled}/{hedge_target}, remaining {remaining})"
                                );
                                if remaining <= Decimal::ZERO {
                                    out.filled = true;
                                    return out;
                                }
                                // Pull the rest and re-place at a fresh price.
                                if let Err(err) = venue.cancel(order_id).await {
                                    warn!(
                                        "[HEDGE] {venue_name} failed to cancel partially filled \
                                         order {order_id}: {err}"
                                    );
                                }
                                return out;
                            }
                        }
                        OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                            let price = info.price.or(Some(limit_price));
                            state.absorb_order_total(order_total, price);
                            ctx.record_order_fill_total(order_id, order_total, price);
                            let reason = info.cancel_reason.unwrap_or_default();
                            if classify_cancel_reason(&reason) == CancelDisposition::Retryable {
                                info!(
                                    "[HEDGE] {venue_name} post-only cancel for {symbol}; \
                                     retrying with fresh BBO"
                                );
                                out.retry_after_backoff = true;
                                return out;
                            }
                            let total_filled = initial_filled + state.accumulated;
                            if total_filled >= hedge_target * self.cfg.fill_threshold {
                                out.filled = true;
                            } else {
                                out.error = Some(format!("hedge order cancelled: {reason}"));
                            }
                            return out;
                        }
                        _ => {}
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("[HEDGE] order status check failed for {order_id}: {err}"),
            }
            sleep(self.cfg.poll_interval()).await;
        }

        out
    }

    /// Market hedge for one context's remaining quantity (the fallback
    /// after the aggressive-limit budget is spent).
    async fn market_hedge_one(
        &self,
        ctx: &Arc<OrderContext>,
        hedge_target: Decimal,
        reduce_only: bool,
        prior_error: Option<String>,
    ) -> HedgeOutcome {
        let venue_name = ctx.spec.venue_name();
        let remaining = (hedge_target - ctx.filled_quantity()).max(Decimal::ZERO);
        if remaining <= Decimal::ZERO {
            return HedgeOutcome::ok();
        }

        info!(
            "[HEDGE] market hedging {} on {venue_name} for remaining {remaining}",
            ctx.spec.symbol
        );
        let req = ExecRequest {
            venue: ctx.spec.venue.clone(),
            symbol: ctx.spec.symbol.clone(),
            side: ctx.spec.side,
            size_usd: None,
            quantity: Some(remaining),
            timeout: ctx.spec.timeout,
            offset_pct: Decimal::ZERO,
            reduce_only,
        };
        let mut report = self.placer.execute(ExecutionMode::MarketOnly, req, None, None).await;

        if !report.success || !report.filled {
            let error = report
                .error
                .or(prior_error)
                .unwrap_or_else(|| format!("market hedge failed on {venue_name}"));
            error!("[HEDGE] {}", ExecError::HedgeFailure(error.clone()));
            return HedgeOutcome::failed(error);
        }

        report.hedge = true;
        ctx.apply_report(report);
        HedgeOutcome::ok()
    }

    /// Market-hedge every context that still has quantity outstanding.
    pub async fn market_hedge(
        &self,
        trigger: Option<&Arc<OrderContext>>,
        contexts: &[Arc<OrderContext>],
        reduce_only: bool,
    ) -> HedgeOutcome {
        for ctx in contexts {
            if let Some(trigger) = trigger {
                if Arc::ptr_eq(ctx, trigger) {
                    continue;
                }
            }
            let target = match ctx.hedge_target().or(ctx.spec.quantity) {
                Some(target) => target,
                None => continue,
            };
            let outcome = self.market_hedge_one(ctx, target, reduce_only, None).await;
            if !outcome.success {
                return outcome;
            }
        }
        HedgeOutcome::ok()
    }
}
