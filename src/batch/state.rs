use std::sync::Arc;

use rust_decimal::Decimal;

use crate::order::{OrderContext, OrderReport};

/// Classification of the contexts that completed in one event-loop cycle.
///
/// The three sets are disjoint per context; the executor applies them in
/// priority order full > partial > retryable, and defers anything it cannot
/// act on to the next cycle.
#[derive(Debug, Default)]
pub struct CycleUpdate {
    /// Contexts whose tracked fill grew this cycle (indices into the batch).
    pub newly_filled: Vec<usize>,
    /// Completed with a retryable failure (post-only rejection, expiry).
    pub retryable: Vec<usize>,
    /// Completed with fills below target and no retry pending.
    pub partial_filled: Vec<usize>,
}

impl CycleUpdate {
    /// Apply a finished task's report to its context and classify it.
    pub fn absorb(
        &mut self,
        idx: usize,
        ctx: &Arc<OrderContext>,
        report: OrderReport,
        full_fill_tolerance: Decimal,
    ) {
        let previous_fill = ctx.filled_quantity();
        ctx.apply_report(report);

        let retryable = ctx.report().map(|r| r.retryable).unwrap_or(false);
        if retryable {
            self.retryable.push(idx);
        }
        if ctx.filled_quantity() > previous_fill {
            self.newly_filled.push(idx);
        }
        // Partial fills only count once the task is done; an active order
        // with fills is still working toward a full fill.
        if ctx.completed()
            && ctx.filled_quantity() > Decimal::ZERO
            && !ctx.is_fully_filled(full_fill_tolerance)
            && !retryable
        {
            self.partial_filled.push(idx);
        }
    }

    /// First newly filled context that is actually fully filled — the
    /// unique trigger for this cycle, if any.
    pub fn full_fill_trigger(
        &self,
        contexts: &[Arc<OrderContext>],
        full_fill_tolerance: Decimal,
    ) -> Option<usize> {
        self.newly_filled
            .iter()
            .copied()
            .find(|&idx| contexts[idx].is_fully_filled(full_fill_tolerance))
    }

    pub fn first_partial(&self) -> Option<usize> {
        self.partial_filled.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{ExecutionMode, OrderSpec, Side};
    use crate::testing::MockVenue;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn ctx() -> Arc<OrderContext> {
        OrderContext::new(OrderSpec {
            venue: MockVenue::builder("venue").build(),
            symbol: "BTC".to_string(),
            side: Side::Buy,
            size_usd: dec!(1000),
            quantity: Some(dec!(0.02)),
            execution_mode: ExecutionMode::LimitOnly,
            timeout: Duration::from_secs(30),
            limit_price_offset_pct: None,
            reduce_only: false,
        })
    }

    fn report(qty: Decimal, filled: bool, retryable: bool) -> OrderReport {
        OrderReport {
            success: filled,
            filled,
            fill_price: Some(dec!(50000)),
            filled_quantity: qty,
            retryable,
            ..OrderReport::default()
        }
    }

    #[test]
    fn full_fill_classifies_as_trigger() {
        let contexts = vec![ctx()];
        let mut update = CycleUpdate::default();
        update.absorb(0, &contexts[0], report(dec!(0.02), true, false), dec!(0.0001));
        assert_eq!(update.newly_filled, vec![0]);
        assert!(update.partial_filled.is_empty());
        assert_eq!(update.full_fill_trigger(&contexts, dec!(0.0001)), Some(0));
    }

    #[test]
    fn partial_fill_is_not_a_trigger() {
        let contexts = vec![ctx()];
        let mut update = CycleUpdate::default();
        update.absorb(0, &contexts[0], report(dec!(0.008), false, false), dec!(0.0001));
        assert_eq!(update.newly_filled, vec![0]);
        assert_eq!(update.partial_filled, vec![0]);
        assert_eq!(update.full_fill_trigger(&contexts, dec!(0.0001)), None);
    }

    #[test]
    fn retryable_failure_never_counts_as_partial() {
        let contexts = vec![ctx()];
        let mut update = CycleUpdate::default();
        update.absorb(0, &contexts[0], report(dec!(0.005), false, true), dec!(0.0001));
        assert_eq!(update.retryable, vec![0]);
        assert!(update.partial_filled.is_empty());
    }

    #[test]
    fn zero_fill_timeout_is_neither() {
        let contexts = vec![ctx()];
        let mut update = CycleUpdate::default();
        update.absorb(0, &contexts[0], report(Decimal::ZERO, false, false), dec!(0.0001));
        assert!(update.newly_filled.is_empty());
        assert!(update.partial_filled.is_empty());
        assert!(update.retryable.is_empty());
    }
}
