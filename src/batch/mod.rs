/// Atomic multi-leg batch execution.

pub mod hedge;
pub mod reconcile;
pub mod rollback;
pub mod router;
pub mod state;
pub mod validator;

pub use hedge::{HedgeManager, HedgeOutcome};
pub use reconcile::reconcile_after_cancel;
pub use rollback::{FilledLeg, RollbackManager};
pub use router::{RouterGuard, WebsocketRouter};
pub use state::CycleUpdate;
pub use validator::{PostExecutionValidator, ValidationOutcome};

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::analysis::{ExposureVerifier, ImbalanceAnalyzer};
use crate::config::ExecutionConfig;
use crate::exec::{ExecRequest, OrderPlacer};
use crate::order::{OrderContext, OrderReport, OrderSpec, Side};
use crate::preflight::{LeverageValidator, LogAlertSink, MarginAlertSink, PreFlightChecker};
use crate::pricing::PriceProvider;
use crate::venue::VenueClient;

/// Knobs for one `execute_atomically` call.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    /// Unwind filled exposure when the batch cannot be balanced.
    pub rollback_on_partial: bool,
    /// Run the pre-flight gates before placing anything.
    pub pre_flight: bool,
    /// Skip the leverage stage of pre-flight (caller already normalized).
    pub skip_leverage_check: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            rollback_on_partial: true,
            pre_flight: true,
            skip_leverage_check: false,
        }
    }
}

/// A leg that ended the batch without fills.
#[derive(Debug, Clone)]
pub struct PartialFillEntry {
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub report: Option<OrderReport>,
}

/// Terminal outcome of one atomic batch.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub success: bool,
    pub all_filled: bool,
    pub filled_orders: Vec<OrderReport>,
    pub partial_fills: Vec<PartialFillEntry>,
    pub total_slippage_usd: Decimal,
    pub execution_time_ms: u64,
    pub error_message: Option<String>,
    pub rollback_performed: bool,
    pub rollback_cost_usd: Decimal,
    /// Token-normalized residual imbalance (not USD).
    pub residual_imbalance_tokens: Decimal,
}

/// Result of the full-fill / partial-fill handlers.
struct TriggerOutcome {
    success: bool,
    hedge_error: Option<String>,
    rollback_performed: bool,
    rollback_cost: Decimal,
}

/// Leg tasks keyed back to their batch index.
struct LegTasks {
    set: JoinSet<OrderReport>,
    ids: HashMap<tokio::task::Id, usize>,
}

impl LegTasks {
    fn new() -> Self {
        Self {
            set: JoinSet::new(),
            ids: HashMap::new(),
        }
    }

    fn spawn<F>(&mut self, idx: usize, fut: F)
    where
        F: std::future::Future<Output = OrderReport> + Send + 'static,
    {
        let handle = self.set.spawn(fut);
        self.ids.insert(handle.id(), idx);
    }

    /// Await the next completed leg. A panicked task resolves to an error
    /// report for its leg rather than escaping.
    async fn next(&mut self) -> Option<(usize, OrderReport)> {
        loop {
            match self.set.join_next_with_id().await? {
                Ok((id, report)) => {
                    if let Some(idx) = self.ids.remove(&id) {
                        return Some((idx, report));
                    }
                }
                Err(err) => {
                    let id = err.id();
                    if let Some(idx) = self.ids.remove(&id) {
                        return Some((
                            idx,
                            OrderReport::failure("error", format!("order task failed: {err}")),
                        ));
                    }
                }
            }
        }
    }

    /// Collect whatever else already finished, without waiting.
    fn drain_ready(&mut self) -> Vec<(usize, OrderReport)> {
        let mut ready = Vec::new();
        while let Some(Some(joined)) = self.set.join_next_with_id().now_or_never() {
            match joined {
                Ok((id, report)) => {
                    if let Some(idx) = self.ids.remove(&id) {
                        ready.push((idx, report));
                    }
                }
                Err(err) => {
                    let id = err.id();
                    if let Some(idx) = self.ids.remove(&id) {
                        ready.push((
                            idx,
                            OrderReport::failure("error", format!("order task failed: {err}")),
                        ));
                    }
                }
            }
        }
        ready
    }
}

/// Orchestrates a batch of correlated orders to a terminal state: either
/// balanced fills on every leg within tolerance, or no net exposure.
pub struct AtomicMultiOrderExecutor {
    cfg: ExecutionConfig,
    prices: Arc<PriceProvider>,
    placer: Arc<OrderPlacer>,
    preflight: PreFlightChecker,
    hedge: HedgeManager,
    rollback: RollbackManager,
    imbalance: ImbalanceAnalyzer,
    exposure: ExposureVerifier,
}

impl AtomicMultiOrderExecutor {
    pub fn new(cfg: ExecutionConfig) -> Self {
        Self::with_alert_sink(cfg, Arc::new(LogAlertSink))
    }

    pub fn with_alert_sink(cfg: ExecutionConfig, alert_sink: Arc<dyn MarginAlertSink>) -> Self {
        let prices = Arc::new(PriceProvider::new(cfg.price_cache_ttl()));
        let placer = Arc::new(OrderPlacer::new(prices.clone(), cfg.confirm.clone()));
        let leverage = Arc::new(LeverageValidator::new());
        Self {
            preflight: PreFlightChecker::new(
                cfg.preflight.clone(),
                leverage,
                prices.clone(),
                alert_sink,
            ),
            hedge: HedgeManager::new(prices.clone(), placer.clone(), cfg.hedge.clone()),
            rollback: RollbackManager::new(cfg.rollback.clone(), cfg.fill_sanity_cap),
            imbalance: ImbalanceAnalyzer::new(cfg.imbalance_tolerance),
            exposure: ExposureVerifier::new(),
            prices,
            placer,
            cfg,
        }
    }

    pub fn price_provider(&self) -> &Arc<PriceProvider> {
        &self.prices
    }

    /// Drive a batch of correlated orders to a terminal outcome.
    ///
    /// Never panics out and never returns `Err`: every failure mode lands
    /// in the returned [`BatchResult`].
    pub async fn execute_atomically(
        &self,
        orders: Vec<OrderSpec>,
        options: BatchOptions,
    ) -> BatchResult {
        let started = tokio::time::Instant::now();

        if orders.is_empty() {
            info!("[EXEC] no orders supplied; skipping atomic execution");
            return BatchResult {
                success: true,
                all_filled: true,
                execution_time_ms: started.elapsed().as_millis() as u64,
                ..BatchResult::default()
            };
        }

        info!(
            "[EXEC] starting atomic execution of {} orders (rollback_on_partial={})",
            orders.len(),
            options.rollback_on_partial
        );

        if options.pre_flight {
            if let Err(err) = self.preflight.check(&orders, options.skip_leverage_check).await {
                return self.build_result(
                    &[],
                    started.elapsed().as_millis() as u64,
                    false,
                    false,
                    Some(format!("pre-flight check failed: {err}")),
                    false,
                    Decimal::ZERO,
                );
            }
        }

        // Batch-scoped websocket routing; originals restored by the guard
        // on every exit path, panics included.
        let mut venues: Vec<Arc<dyn VenueClient>> = Vec::new();
        for spec in &orders {
            if !venues.iter().any(|v| v.name() == spec.venue.name()) {
                venues.push(spec.venue.clone());
            }
        }
        let router = WebsocketRouter::new();
        let _callback_guard = router.install(&venues);

        info!("[EXEC] placing all {} orders simultaneously", orders.len());
        let contexts: Vec<Arc<OrderContext>> = orders.into_iter().map(OrderContext::new).collect();
        let mut tasks = LegTasks::new();
        for (idx, ctx) in contexts.iter().enumerate() {
            self.spawn_leg(&mut tasks, idx, ctx, &router);
        }

        let mut trigger_idx: Option<usize> = None;
        let mut hedge_error: Option<String> = None;
        let mut rollback_performed = false;
        let mut rollback_cost = Decimal::ZERO;

        loop {
            let Some((idx, report)) = tasks.next().await else {
                break;
            };
            let mut update = CycleUpdate::default();
            update.absorb(idx, &contexts[idx], report, self.cfg.full_fill_tolerance);
            self.register_context(&router, &contexts[idx]).await;
            for (ready_idx, ready_report) in tasks.drain_ready() {
                update.absorb(
                    ready_idx,
                    &contexts[ready_idx],
                    ready_report,
                    self.cfg.full_fill_tolerance,
                );
                self.register_context(&router, &contexts[ready_idx]).await;
            }

            let mut all_completed = contexts.iter().all(|c| c.completed());

            // Priority 1: the first full fill becomes the unique trigger.
            if trigger_idx.is_none() {
                if let Some(t) =
                    update.full_fill_trigger(&contexts, self.cfg.full_fill_tolerance)
                {
                    trigger_idx = Some(t);
                    let outcome = self
                        .handle_full_fill_trigger(
                            t,
                            &contexts,
                            &mut tasks,
                            &router,
                            options.rollback_on_partial,
                        )
                        .await;
                    if outcome.hedge_error.is_some() {
                        hedge_error = outcome.hedge_error;
                    }
                    if outcome.rollback_performed {
                        rollback_performed = true;
                        rollback_cost = outcome.rollback_cost;
                    }
                    if outcome.success {
                        all_completed = true;
                    } else {
                        break;
                    }
                }
            }

            // Priority 2: a completed partial fill, only when no trigger
            // consumed this cycle.
            if trigger_idx.is_none() {
                if let Some(p) = update.first_partial() {
                    let outcome = self
                        .handle_partial_fill(
                            p,
                            &contexts,
                            &mut tasks,
                            &router,
                            options.rollback_on_partial,
                        )
                        .await;
                    if outcome.hedge_error.is_some() {
                        hedge_error = outcome.hedge_error;
                    }
                    if outcome.rollback_performed {
                        rollback_performed = true;
                        rollback_cost = outcome.rollback_cost;
                    }
                    if outcome.success {
                        all_completed = true;
                    } else {
                        break;
                    }
                }
            }

            // Priority 3: re-place retryable failures with fresh BBO.
            if !all_completed {
                for &retry_idx in &update.retryable {
                    let ctx = &contexts[retry_idx];
                    info!(
                        "[{}] post-only rejection for {}; retrying immediately with fresh BBO",
                        ctx.spec.venue_name(),
                        ctx.spec.symbol
                    );
                    ctx.reset_for_retry();
                    self.spawn_leg(&mut tasks, retry_idx, ctx, &router);
                }
            }

            if all_completed {
                break;
            }
        }

        // No orphan tasks: signal whatever is still working, then join
        // every spawned task before reconciliation.
        for ctx in &contexts {
            if !ctx.completed() {
                ctx.trigger_cancel();
            }
        }
        while let Some((idx, report)) = tasks.next().await {
            contexts[idx].apply_report(report);
            self.register_context(&router, &contexts[idx]).await;
        }
        // Skip reconciliation once a rollback has zeroed the contexts:
        // re-reading venue order records would resurrect the closed fills.
        if !rollback_performed {
            for ctx in &contexts {
                reconcile_after_cancel(ctx, self.cfg.fill_sanity_cap).await;
            }
        }

        let exec_ms = started.elapsed().as_millis() as u64;

        if rollback_performed {
            return self.build_result(
                &contexts,
                exec_ms,
                false,
                false,
                Some(
                    hedge_error.unwrap_or_else(|| "rolled back after hedge failure".to_string()),
                ),
                true,
                rollback_cost,
            );
        }

        let validator = PostExecutionValidator::new(&self.imbalance, &self.exposure, &self.cfg);
        let outcome = validator
            .validate(
                &contexts,
                contexts.len(),
                rollback_performed,
                hedge_error.as_deref(),
                options.rollback_on_partial,
            )
            .await;

        if outcome.should_rollback {
            let cost = self
                .rollback
                .emergency_rollback(
                    &contexts,
                    "post-execution imbalance",
                    outcome.imbalance.imbalance_tokens,
                    outcome.imbalance.imbalance_pct,
                )
                .await;
            return self.build_result(
                &contexts,
                started.elapsed().as_millis() as u64,
                false,
                false,
                outcome
                    .error_message
                    .map(|message| format!("rolled back: {message}")),
                true,
                cost,
            );
        }

        self.build_result(
            &contexts,
            exec_ms,
            outcome.passed,
            outcome.all_filled,
            outcome.error_message,
            false,
            Decimal::ZERO,
        )
    }

    fn spawn_leg(
        &self,
        tasks: &mut LegTasks,
        idx: usize,
        ctx: &Arc<OrderContext>,
        router: &Arc<WebsocketRouter>,
    ) {
        let placer = self.placer.clone();
        let cancel = ctx.cancel_signal();
        let router = router.clone();
        let reg_ctx = ctx.clone();
        let mode = ctx.spec.execution_mode;
        let req = ExecRequest {
            venue: ctx.spec.venue.clone(),
            symbol: ctx.spec.symbol.clone(),
            side: ctx.spec.side,
            size_usd: Some(ctx.spec.size_usd),
            quantity: ctx.spec.quantity,
            timeout: ctx.spec.timeout,
            offset_pct: ctx.spec.limit_price_offset_pct.unwrap_or(dec!(0.0001)),
            reduce_only: ctx.spec.reduce_only,
        };

        tasks.spawn(idx, async move {
            // Register the order id the moment placement acknowledges, so
            // callbacks racing the task always find (or queue for) it.
            let sink = move |order_id: &str| router.register(order_id, reg_ctx.clone());
            placer.execute(mode, req, Some(&cancel), Some(&sink)).await
        });
    }

    async fn register_context(&self, router: &Arc<WebsocketRouter>, ctx: &Arc<OrderContext>) {
        if let Some(order_id) = ctx.order_id() {
            router.register_checked(&order_id, ctx).await;
        }
    }

    /// One leg fully filled: cancel the siblings, reconcile, hedge them up
    /// to the trigger's normalized quantity.
    async fn handle_full_fill_trigger(
        &self,
        trigger_idx: usize,
        contexts: &[Arc<OrderContext>],
        tasks: &mut LegTasks,
        router: &Arc<WebsocketRouter>,
        rollback_on_partial: bool,
    ) -> TriggerOutcome {
        let trigger = &contexts[trigger_idx];
        info!(
            "[EXEC] {} {} fully filled ({}); cancelling remaining legs and hedging",
            trigger.spec.venue_name(),
            trigger.spec.symbol,
            trigger.filled_quantity()
        );

        let sibling_indices: Vec<usize> =
            (0..contexts.len()).filter(|&i| i != trigger_idx).collect();
        for &i in &sibling_indices {
            let ctx = &contexts[i];
            info!(
                "[EXEC] cancelling limit order for {} {} (remaining {})",
                ctx.spec.venue_name(),
                ctx.spec.symbol,
                ctx.remaining_quantity()
            );
            ctx.trigger_cancel();
        }
        self.drain_until_completed(tasks, contexts, router, &sibling_indices).await;
        for &i in &sibling_indices {
            reconcile_after_cancel(&contexts[i], self.cfg.fill_sanity_cap).await;
        }

        self.set_hedge_targets(trigger, contexts, &sibling_indices);

        let is_close = contexts.iter().all(|c| c.spec.reduce_only);
        if is_close
            && contexts
                .iter()
                .all(|c| c.is_fully_filled(self.cfg.full_fill_tolerance))
        {
            info!("[EXEC] close operation: all legs fully filled, positions closed; no hedge needed");
            return TriggerOutcome {
                success: true,
                hedge_error: None,
                rollback_performed: false,
                rollback_cost: Decimal::ZERO,
            };
        }

        let hedge_outcome = self
            .hedge
            .aggressive_limit_hedge(Some(trigger), contexts, is_close)
            .await;

        // Re-examine before trusting the hedge status: the venue may have
        // filled even though the hedge pass reported a timeout. A balanced,
        // fully filled batch must never roll back.
        let all_fully_filled = contexts
            .iter()
            .all(|c| c.is_fully_filled(self.cfg.full_fill_tolerance));
        if all_fully_filled {
            let snapshot = self.imbalance.calculate(contexts);
            if snapshot.imbalance_pct <= self.cfg.imbalance_tolerance {
                info!(
                    "[EXEC] all legs fully filled and balanced (imbalance {:.6} tokens); \
                     success regardless of hedge status",
                    snapshot.imbalance_tokens
                );
                return TriggerOutcome {
                    success: true,
                    hedge_error: None,
                    rollback_performed: false,
                    rollback_cost: Decimal::ZERO,
                };
            }
            warn!(
                "[EXEC] all legs fully filled but imbalanced ({:.2}%); deferring to hedge status",
                snapshot.imbalance_pct * dec!(100)
            );
        }

        if hedge_outcome.success {
            return TriggerOutcome {
                success: true,
                hedge_error: None,
                rollback_performed: false,
                rollback_cost: Decimal::ZERO,
            };
        }

        if !rollback_on_partial {
            return TriggerOutcome {
                success: false,
                hedge_error: hedge_outcome.error,
                rollback_performed: false,
                rollback_cost: Decimal::ZERO,
            };
        }

        warn!(
            "[EXEC] hedge failed ({}); rolling back filled legs",
            hedge_outcome.error.as_deref().unwrap_or("no error supplied")
        );
        for ctx in contexts {
            ctx.trigger_cancel();
        }
        let all_indices: Vec<usize> = (0..contexts.len()).collect();
        self.drain_until_completed(tasks, contexts, router, &all_indices).await;

        let cost = self
            .rollback
            .emergency_rollback(
                contexts,
                "hedge failure after full fill trigger",
                Decimal::ZERO,
                Decimal::ZERO,
            )
            .await;
        TriggerOutcome {
            success: false,
            hedge_error: hedge_outcome.error,
            rollback_performed: true,
            rollback_cost: cost,
        }
    }

    /// A leg completed with partial fills and no trigger is active: cancel
    /// the siblings and hedge immediately.
    async fn handle_partial_fill(
        &self,
        partial_idx: usize,
        contexts: &[Arc<OrderContext>],
        tasks: &mut LegTasks,
        router: &Arc<WebsocketRouter>,
        rollback_on_partial: bool,
    ) -> TriggerOutcome {
        let partial = &contexts[partial_idx];
        info!(
            "[EXEC] [{}] partial fill completed for {} ({}); cancelling other legs and hedging",
            partial.spec.venue_name(),
            partial.spec.symbol,
            partial.filled_quantity()
        );

        let sibling_indices: Vec<usize> =
            (0..contexts.len()).filter(|&i| i != partial_idx).collect();
        for &i in &sibling_indices {
            contexts[i].trigger_cancel();
        }
        self.drain_until_completed(tasks, contexts, router, &sibling_indices).await;
        for &i in &sibling_indices {
            reconcile_after_cancel(&contexts[i], self.cfg.fill_sanity_cap).await;
        }

        self.set_hedge_targets(partial, contexts, &sibling_indices);

        let is_close = contexts.iter().all(|c| c.spec.reduce_only);
        let hedge_outcome = self
            .hedge
            .aggressive_limit_hedge(Some(partial), contexts, is_close)
            .await;

        if hedge_outcome.success {
            return TriggerOutcome {
                success: true,
                hedge_error: None,
                rollback_performed: false,
                rollback_cost: Decimal::ZERO,
            };
        }

        if rollback_on_partial {
            let cost = self
                .rollback
                .emergency_rollback(
                    contexts,
                    "partial fill hedge failure",
                    Decimal::ZERO,
                    Decimal::ZERO,
                )
                .await;
            return TriggerOutcome {
                success: false,
                hedge_error: hedge_outcome.error,
                rollback_performed: true,
                rollback_cost: cost,
            };
        }

        TriggerOutcome {
            success: false,
            hedge_error: hedge_outcome.error,
            rollback_performed: false,
            rollback_cost: Decimal::ZERO,
        }
    }

    /// Sibling hedge targets in their own venue units, normalized through
    /// actual tokens and capped at spec × sanity cap.
    fn set_hedge_targets(
        &self,
        source: &Arc<OrderContext>,
        contexts: &[Arc<OrderContext>],
        sibling_indices: &[usize],
    ) {
        let source_qty = source.filled_quantity().abs();
        let source_mult =
            Decimal::from(source.spec.venue.quantity_multiplier(&source.spec.symbol));
        let actual_tokens = source_qty * source_mult;

        for &i in sibling_indices {
            let ctx = &contexts[i];
            let ctx_mult = Decimal::from(ctx.spec.venue.quantity_multiplier(&ctx.spec.symbol));
            let mut target = if ctx_mult > Decimal::ZERO {
                actual_tokens / ctx_mult
            } else {
                actual_tokens
            };

            if source_mult != ctx_mult {
                debug!(
                    "[HEDGE] multiplier adjustment for {}: {source_qty} (x{source_mult}) -> \
                     {target} (x{ctx_mult})",
                    ctx.spec.symbol
                );
            }

            // The trigger fill is the source of truth; the cap only guards
            // against a grossly wrong target, not small rounding drift.
            if let Some(spec_qty) = ctx.spec.quantity {
                let capped = spec_qty * self.cfg.fill_sanity_cap;
                if target > capped {
                    warn!(
                        "[HEDGE] calculated hedge target {target} exceeds spec quantity \
                         {spec_qty} beyond the sanity cap; capping to {capped}"
                    );
                    target = capped;
                }
            }
            ctx.set_hedge_target(target);
            debug!(
                "[HEDGE] hedge target for {} {}: {target}",
                ctx.spec.venue_name(),
                ctx.spec.symbol
            );
        }
    }

    /// Apply completions until every targeted context has finished.
    async fn drain_until_completed(
        &self,
        tasks: &mut LegTasks,
        contexts: &[Arc<OrderContext>],
        router: &Arc<WebsocketRouter>,
        targets: &[usize],
    ) {
        while targets.iter().any(|&i| !contexts[i].completed()) {
            let Some((idx, report)) = tasks.next().await else {
                break;
            };
            contexts[idx].apply_report(report);
            self.register_context(router, &contexts[idx]).await;
        }
    }

    fn build_result(
        &self,
        contexts: &[Arc<OrderContext>],
        execution_time_ms: u64,
        success: bool,
        all_filled: bool,
        error_message: Option<String>,
        rollback_performed: bool,
        rollback_cost_usd: Decimal,
    ) -> BatchResult {
        let mut filled_orders = Vec::new();
        let mut partial_fills = Vec::new();
        for ctx in contexts {
            match ctx.report() {
                Some(report) if ctx.filled_quantity() > Decimal::ZERO => {
                    filled_orders.push(report)
                }
                report => partial_fills.push(PartialFillEntry {
                    venue: ctx.spec.venue.name().to_string(),
                    symbol: ctx.spec.symbol.clone(),
                    side: ctx.spec.side,
                    report,
                }),
            }
        }

        let total_slippage_usd = filled_orders.iter().map(|r| r.slippage_usd).sum();
        let residual = self.imbalance.calculate(contexts).imbalance_tokens;

        if rollback_performed {
            // Closed positions are not deliverable fills.
            filled_orders.clear();
        }

        BatchResult {
            success,
            all_filled,
            total_slippage_usd: if rollback_performed {
                Decimal::ZERO
            } else {
                total_slippage_usd
            },
            filled_orders,
            partial_fills,
            execution_time_ms,
            error_message,
            rollback_performed,
            rollback_cost_usd,
            residual_imbalance_tokens: if rollback_performed { Decimal::ZERO } else { residual },
        }
    }
}
