use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::debug;

use crate::order::{OrderContext, Side};

/// Normalized long/short totals for one batch.
///
/// Quantities are in actual tokens (venue units × multiplier), never USD:
/// multipliers and prices differ across venues, so only token counts can
/// prove delta-neutrality.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImbalanceSnapshot {
    pub long_tokens: Decimal,
    pub short_tokens: Decimal,
    pub imbalance_tokens: Decimal,
    /// `(max − min) / max`, zero when nothing filled.
    pub imbalance_pct: Decimal,
}

/// Computes normalized-token imbalance over order contexts.
pub struct ImbalanceAnalyzer {
    critical_threshold: Decimal,
}

impl ImbalanceAnalyzer {
    pub fn new(critical_threshold: Decimal) -> Self {
        Self { critical_threshold }
    }

    /// Token-normalized exposure sums.
    ///
    /// Close operations (every leg `reduce_only`) report zeros: those legs
    /// reduce exposure rather than create it, so imbalance gating is waived.
    pub fn calculate(&self, contexts: &[Arc<OrderContext>]) -> ImbalanceSnapshot {
        let is_close = !contexts.is_empty() && contexts.iter().all(|c| c.spec.reduce_only);
        if is_close {
            debug!("[EXEC] close operation; imbalance check waived");
            return ImbalanceSnapshot::default();
        }

        let mut long_tokens = Decimal::ZERO;
        let mut short_tokens = Decimal::ZERO;

        for ctx in contexts {
            let filled = ctx.filled_quantity();
            if filled <= Decimal::ZERO {
                continue;
            }
            let multiplier = Decimal::from(ctx.spec.venue.quantity_multiplier(&ctx.spec.symbol));
            let actual_tokens = filled * multiplier;
            match ctx.spec.side {
                Side::Buy => long_tokens += actual_tokens,
                Side::Sell => short_tokens += actual_tokens,
            }
        }

        Self::snapshot(long_tokens, short_tokens)
    }

    pub fn is_critical(&self, snapshot: &ImbalanceSnapshot) -> bool {
        snapshot.imbalance_pct > self.critical_threshold
    }

    fn snapshot(long_tokens: Decimal, short_tokens: Decimal) -> ImbalanceSnapshot {
        let max = long_tokens.max(short_tokens);
        let min = long_tokens.min(short_tokens);
        let imbalance_pct = if max > Decimal::ZERO {
            (max - min) / max
        } else {
            Decimal::ZERO
        };
        ImbalanceSnapshot {
            long_tokens,
            short_tokens,
            imbalance_tokens: (long_tokens - short_tokens).abs(),
            imbalance_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::{ExecutionMode, OrderSpec};
    use crate::testing::MockVenue;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn ctx(side: Side, multiplier: u32, filled: Decimal, reduce_only: bool) -> Arc<OrderContext> {
        let venue = MockVenue::builder("venue").multiplier(multiplier).build();
        let ctx = OrderContext::new(OrderSpec {
            venue,
            symbol: "TOK".to_string(),
            side,
            size_usd: dec!(1000),
            quantity: Some(dec!(1000)),
            execution_mode: ExecutionMode::LimitOnly,
            timeout: Duration::from_secs(30),
            limit_price_offset_pct: None,
            reduce_only,
        });
        ctx.record_fill(filled, Some(dec!(1)));
        ctx
    }

    #[test]
    fn multipliers_normalize_across_venues() {
        // 0.234 kTOK units (×1000) vs 233.96 TOK units (×1): near-balanced.
        let contexts = vec![
            ctx(Side::Buy, 1000, dec!(0.234), false),
            ctx(Side::Sell, 1, dec!(233.96), false),
        ];
        let analyzer = ImbalanceAnalyzer::new(dec!(0.01));
        let snap = analyzer.calculate(&contexts);
        assert_eq!(snap.long_tokens, dec!(234));
        assert_eq!(snap.short_tokens, dec!(233.96));
        assert!(!analyzer.is_critical(&snap));
    }

    #[test]
    fn one_sided_fill_is_fully_imbalanced() {
        let contexts = vec![ctx(Side::Buy, 1, dec!(10), false)];
        let analyzer = ImbalanceAnalyzer::new(dec!(0.01));
        let snap = analyzer.calculate(&contexts);
        assert_eq!(snap.imbalance_pct, Decimal::ONE);
        assert!(analyzer.is_critical(&snap));
    }

    #[test]
    fn close_operation_waives_imbalance() {
        let contexts = vec![
            ctx(Side::Buy, 1, dec!(10), true),
            ctx(Side::Sell, 1, dec!(3), true),
        ];
        let analyzer = ImbalanceAnalyzer::new(dec!(0.01));
        let snap = analyzer.calculate(&contexts);
        assert_eq!(snap.imbalance_tokens, Decimal::ZERO);
        assert!(!analyzer.is_critical(&snap));
    }

    #[test]
    fn empty_batch_is_balanced() {
        let analyzer = ImbalanceAnalyzer::new(dec!(0.01));
        let snap = analyzer.calculate(&[]);
        assert_eq!(snap.imbalance_pct, Decimal::ZERO);
    }
}
