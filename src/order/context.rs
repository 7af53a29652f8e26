use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tracing::debug;

use super::{OrderReport, OrderSpec};

/// Cooperative cancellation signal, one per in-flight order task.
///
/// Order tasks poll this at every suspension point; setting it promises the
/// task will cancel at the venue, drain one final snapshot, and exit
/// reporting any fills observed before the cancel.
#[derive(Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolve once the signal is set. Safe against set-before-wait races.
    pub async fn cancelled(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct ContextState {
    report: Option<OrderReport>,
    completed: bool,
    /// Grand total across all orders worked for this leg. Monotone.
    filled_quantity: Decimal,
    filled_usd: Decimal,
    /// Cumulative fill per venue order id. Fills arrive through both the
    /// websocket router and task reports; keying by order id makes the two
    /// paths converge instead of double counting.
    order_fills: HashMap<String, Decimal>,
    hedge_target_quantity: Option<Decimal>,
    websocket_cancelled: bool,
    cancel: CancelSignal,
}

/// Live state for a single leg during atomic execution.
///
/// Shared between the executor's event loop, the leg task, and the
/// websocket router, so all mutation goes through a short-held mutex.
/// Fills are applied in arrival order and `filled_quantity` is monotone.
pub struct OrderContext {
    pub spec: OrderSpec,
    state: Mutex<ContextState>,
}

impl OrderContext {
    pub fn new(spec: OrderSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            state: Mutex::new(ContextState::default()),
        })
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.state.lock().cancel.clone()
    }

    pub fn trigger_cancel(&self) {
        self.state.lock().cancel.set();
    }

    pub fn completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.state.lock().filled_quantity
    }

    pub fn filled_usd(&self) -> Decimal {
        self.state.lock().filled_usd
    }

    pub fn websocket_cancelled(&self) -> bool {
        self.state.lock().websocket_cancelled
    }

    pub fn hedge_target(&self) -> Option<Decimal> {
        self.state.lock().hedge_target_quantity
    }

    pub fn set_hedge_target(&self, target: Decimal) {
        self.state.lock().hedge_target_quantity = Some(target.max(Decimal::ZERO));
    }

    pub fn report(&self) -> Option<OrderReport> {
        self.state.lock().report.clone()
    }

    pub fn order_id(&self) -> Option<String> {
        self.state.lock().report.as_ref().and_then(|r| r.order_id.clone())
    }

    /// Cumulative fill already attributed to one venue order.
    pub fn order_fill_total(&self, order_id: &str) -> Decimal {
        self.state
            .lock()
            .order_fills
            .get(order_id)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Remaining base quantity yet to be executed.
    ///
    /// The hedge target, when set, wins over `spec.quantity` — it is the
    /// multiplier-adjusted amount needed to match the trigger leg.
    pub fn remaining_quantity(&self) -> Decimal {
        let state = self.state.lock();
        let target = state.hedge_target_quantity.or(self.spec.quantity);
        match target {
            Some(target) => (target - state.filled_quantity).max(Decimal::ZERO),
            None => Decimal::ZERO,
        }
    }

    /// Remaining USD notional, capped at zero.
    pub fn remaining_usd(&self) -> Decimal {
        let state = self.state.lock();
        (self.spec.size_usd - state.filled_usd).max(Decimal::ZERO)
    }

    /// Accumulate an executed quantity with no order attribution.
    ///
    /// Zero and negative quantities are no-ops. `filled_usd` saturates at
    /// `spec.size_usd`; an unknown price falls back to the full notional
    /// on the first recorded fill.
    pub fn record_fill(&self, quantity: Decimal, price: Option<Decimal>) {
        if quantity <= Decimal::ZERO {
            return;
        }
        let mut state = self.state.lock();
        Self::add_fill(&self.spec, &mut state, quantity, price);
    }

    /// Record a per-order cumulative fill total. Idempotent: re-reporting
    /// the same (or a lower) total for an order changes nothing.
    pub fn record_order_fill_total(&self, order_id: &str, total: Decimal, price: Option<Decimal>) {
        if total <= Decimal::ZERO {
            return;
        }
        let mut state = self.state.lock();
        let tracked = state.order_fills.get(order_id).copied().unwrap_or(Decimal::ZERO);
        if total <= tracked {
            return;
        }
        let delta = total - tracked;
        state.order_fills.insert(order_id.to_string(), total);
        Self::add_fill(&self.spec, &mut state, delta, price);
    }

    fn add_fill(spec: &OrderSpec, state: &mut ContextState, quantity: Decimal, price: Option<Decimal>) {
        state.filled_quantity += quantity;
        match price {
            Some(price) if price > Decimal::ZERO => {
                state.filled_usd += quantity * price;
            }
            _ => {
                if state.filled_usd == Decimal::ZERO {
                    state.filled_usd = spec.size_usd;
                }
            }
        }
        if state.filled_usd > spec.size_usd {
            state.filled_usd = spec.size_usd;
        }
    }

    /// Ingest an incremental fill reported over websocket.
    ///
    /// Increments past `spec.quantity` are ignored — the order is already
    /// fully accounted and anything further would double count.
    pub fn on_websocket_fill(&self, order_id: &str, quantity: Decimal, price: Option<Decimal>) {
        if quantity <= Decimal::ZERO {
            return;
        }
        let mut state = self.state.lock();
        if let Some(spec_qty) = self.spec.quantity {
            if state.filled_quantity >= spec_qty {
                return;
            }
        }
        *state.order_fills.entry(order_id.to_string()).or_default() += quantity;
        Self::add_fill(&self.spec, &mut state, quantity, price);
        let total = state.filled_quantity;
        if let Some(report) = state.report.as_mut() {
            report.filled_quantity = total;
            if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
                report.fill_price = Some(price);
            }
        }
    }

    /// Mark the order cancelled per websocket, recording the final
    /// cumulative total. Once this flag is set, REST-based reconciliation
    /// is suppressed for this order.
    pub fn on_websocket_cancel(&self, order_id: &str, filled_size: Decimal) {
        self.state.lock().websocket_cancelled = true;
        if filled_size > Decimal::ZERO {
            self.record_order_fill_total(order_id, filled_size, None);
            let mut state = self.state.lock();
            let total = state.filled_quantity;
            if let Some(report) = state.report.as_mut() {
                report.filled_quantity = total;
                report.filled = true;
            }
        }
    }

    /// Top the order's ledger up to a websocket-reported cumulative total.
    pub fn on_websocket_total(&self, order_id: &str, total_filled: Decimal, price: Option<Decimal>) {
        self.record_order_fill_total(order_id, total_filled, price);
        let mut state = self.state.lock();
        let total = state.filled_quantity;
        if let Some(report) = state.report.as_mut() {
            report.filled_quantity = total;
            if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
                report.fill_price = Some(price);
            }
        }
    }

    /// Persist a task's report, folding its fills into the ledger.
    ///
    /// Fill entries are per-order cumulative totals, so a report racing the
    /// websocket path converges on the same grand total. The stored
    /// report's `filled_quantity` is rewritten to the accumulated total so
    /// the two never drift apart.
    pub fn apply_report(&self, mut report: OrderReport) {
        for entry in report.fill_entries() {
            match entry.order_id {
                Some(order_id) => {
                    self.record_order_fill_total(&order_id, entry.quantity, entry.price)
                }
                None => self.record_fill(entry.quantity, entry.price),
            }
        }
        let mut state = self.state.lock();
        report.filled_quantity = state.filled_quantity;
        state.report = Some(report);
        state.completed = true;
    }

    /// Persist a report without touching the fill ledger (the caller
    /// already recorded fills per order, e.g. the hedge poll loop).
    pub fn store_report(&self, mut report: OrderReport) {
        let mut state = self.state.lock();
        report.filled_quantity = state.filled_quantity;
        state.report = Some(report);
        state.completed = true;
    }

    /// Zero the tracked fills (after rollback, or when websocket says the
    /// cancelled order never filled).
    pub fn reset_fills(&self) {
        let mut state = self.state.lock();
        if state.filled_quantity > Decimal::ZERO {
            debug!(
                "[EXEC] clearing tracked fills for {} {} ({} -> 0)",
                self.spec.venue_name(),
                self.spec.symbol,
                state.filled_quantity
            );
        }
        state.filled_quantity = Decimal::ZERO;
        state.filled_usd = Decimal::ZERO;
        state.order_fills.clear();
    }

    /// Sync the stored report's fill fields to the accumulated totals
    /// without declaring the order filled (hedge partials mid-retry).
    pub fn sync_report_fills(&self, price: Option<Decimal>) {
        let mut state = self.state.lock();
        let total = state.filled_quantity;
        if let Some(report) = state.report.as_mut() {
            report.filled_quantity = total;
            if let Some(price) = price.filter(|p| *p > Decimal::ZERO) {
                report.fill_price = Some(price);
            }
        }
    }

    /// Update the stored report after reconciliation added fills.
    pub fn note_reconciled_fill(&self, price: Option<Decimal>) {
        let mut state = self.state.lock();
        let total = state.filled_quantity;
        match state.report.as_mut() {
            Some(report) => {
                report.filled = true;
                report.filled_quantity = total;
                if let Some(price) = price {
                    report.fill_price = Some(price);
                }
            }
            None => {
                state.report = Some(OrderReport {
                    success: true,
                    filled: true,
                    fill_price: price,
                    filled_quantity: total,
                    execution_mode_used: "limit".to_string(),
                    ..OrderReport::default()
                });
            }
        }
    }

    /// Fully filled: remaining within tolerance and the report says filled.
    pub fn is_fully_filled(&self, tolerance: Decimal) -> bool {
        let filled_flag = {
            let state = self.state.lock();
            state.report.as_ref().map(|r| r.filled).unwrap_or(false)
        };
        self.remaining_quantity() <= tolerance && filled_flag
    }

    /// Re-arm the context for a retryable re-place (fresh cancel signal,
    /// completion and report cleared, fills kept).
    pub fn reset_for_retry(&self) {
        let mut state = self.state.lock();
        state.cancel = CancelSignal::new();
        state.completed = false;
        state.report = None;
    }
}

impl std::fmt::Debug for OrderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OrderContext")
            .field("spec", &self.spec)
            .field("completed", &state.completed)
            .field("filled_quantity", &state.filled_quantity)
            .field("filled_usd", &state.filled_usd)
            .field("hedge_target", &state.hedge_target_quantity)
            .field("websocket_cancelled", &state.websocket_cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVenue;
    use crate::{ExecutionMode, Side};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn spec(quantity: Option<Decimal>) -> OrderSpec {
        OrderSpec {
            venue: MockVenue::builder("venue-a").build(),
            symbol: "BTC".to_string(),
            side: Side::Buy,
            size_usd: dec!(1000),
            quantity,
            execution_mode: ExecutionMode::LimitOnly,
            timeout: Duration::from_secs(30),
            limit_price_offset_pct: None,
            reduce_only: false,
        }
    }

    #[test]
    fn record_fill_accumulates_and_caps_usd() {
        let ctx = OrderContext::new(spec(Some(dec!(0.02))));
        ctx.record_fill(dec!(0.01), Some(dec!(50000)));
        ctx.record_fill(dec!(0.01), Some(dec!(51000)));
        assert_eq!(ctx.filled_quantity(), dec!(0.02));
        // 0.01*50000 + 0.01*51000 = 1010, capped at size_usd.
        assert_eq!(ctx.filled_usd(), dec!(1000));
    }

    #[test]
    fn zero_and_negative_fills_are_noops() {
        let ctx = OrderContext::new(spec(Some(dec!(0.02))));
        ctx.record_fill(Decimal::ZERO, Some(dec!(50000)));
        ctx.record_fill(dec!(-0.01), Some(dec!(50000)));
        assert_eq!(ctx.filled_quantity(), Decimal::ZERO);
        assert_eq!(ctx.filled_usd(), Decimal::ZERO);
    }

    #[test]
    fn websocket_and_report_fills_converge_per_order() {
        let ctx = OrderContext::new(spec(Some(dec!(0.02))));
        // Websocket delivers the fill first, incrementally.
        ctx.on_websocket_fill("ord-1", dec!(0.01), Some(dec!(50000)));
        ctx.on_websocket_fill("ord-1", dec!(0.01), Some(dec!(50000)));
        // The task report then restates the same order's cumulative total.
        let report = OrderReport {
            success: true,
            filled: true,
            fill_price: Some(dec!(50000)),
            filled_quantity: dec!(0.02),
            order_id: Some("ord-1".to_string()),
            ..OrderReport::default()
        };
        ctx.apply_report(report);
        // No double counting.
        assert_eq!(ctx.filled_quantity(), dec!(0.02));
    }

    #[test]
    fn report_first_then_websocket_is_also_idempotent() {
        let ctx = OrderContext::new(spec(Some(dec!(0.02))));
        let report = OrderReport {
            success: true,
            filled: true,
            fill_price: Some(dec!(50000)),
            filled_quantity: dec!(0.02),
            order_id: Some("ord-1".to_string()),
            ..OrderReport::default()
        };
        ctx.apply_report(report);
        ctx.on_websocket_fill("ord-1", dec!(0.02), Some(dec!(50000)));
        assert_eq!(ctx.filled_quantity(), dec!(0.02));
    }

    #[test]
    fn remaining_quantity_prefers_hedge_target() {
        let ctx = OrderContext::new(spec(Some(dec!(0.02))));
        ctx.record_fill(dec!(0.005), Some(dec!(50000)));
        assert_eq!(ctx.remaining_quantity(), dec!(0.015));
        ctx.set_hedge_target(dec!(0.018));
        assert_eq!(ctx.remaining_quantity(), dec!(0.013));
    }

    #[test]
    fn websocket_cancel_records_final_total() {
        let ctx = OrderContext::new(spec(Some(dec!(0.02))));
        ctx.on_websocket_fill("ord-1", dec!(0.005), Some(dec!(50000)));
        ctx.on_websocket_cancel("ord-1", dec!(0.008));
        assert!(ctx.websocket_cancelled());
        assert_eq!(ctx.filled_quantity(), dec!(0.008));
    }

    #[test]
    fn retry_fills_accumulate_across_orders() {
        let ctx = OrderContext::new(spec(Some(dec!(0.02))));
        ctx.record_order_fill_total("ord-1", dec!(0.005), Some(dec!(50000)));
        ctx.record_order_fill_total("ord-2", dec!(0.015), Some(dec!(50000)));
        assert_eq!(ctx.filled_quantity(), dec!(0.02));
        // Restating either order changes nothing.
        ctx.record_order_fill_total("ord-1", dec!(0.005), Some(dec!(50000)));
        assert_eq!(ctx.filled_quantity(), dec!(0.02));
    }

    #[test]
    fn cancel_signal_wakes_waiters() {
        let signal = CancelSignal::new();
        signal.set();
        assert!(signal.is_set());
        // Already-set signals resolve immediately.
        futures_util::future::FutureExt::now_or_never(signal.cancelled()).unwrap();
    }
}
