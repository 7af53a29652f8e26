use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, error, warn};

use crate::analysis::{ExposureVerifier, ImbalanceAnalyzer, ImbalanceSnapshot};
use crate::config::ExecutionConfig;
use crate::error::ExecError;
use crate::order::OrderContext;

/// Final verdict over a finished batch.
#[derive(Debug)]
pub struct ValidationOutcome {
    pub passed: bool,
    /// The caller must run the emergency rollback and rewrite the result.
    pub should_rollback: bool,
    pub error_message: Option<String>,
    pub imbalance: ImbalanceSnapshot,
    pub all_filled: bool,
}

/// Validates end-of-batch state and decides whether a rollback is owed.
pub struct PostExecutionValidator<'a> {
    imbalance: &'a ImbalanceAnalyzer,
    exposure: &'a ExposureVerifier,
    cfg: &'a ExecutionConfig,
}

impl<'a> PostExecutionValidator<'a> {
    pub fn new(
        imbalance: &'a ImbalanceAnalyzer,
        exposure: &'a ExposureVerifier,
        cfg: &'a ExecutionConfig,
    ) -> Self {
        Self {
            imbalance,
            exposure,
            cfg,
        }
    }

    pub async fn validate(
        &self,
        contexts: &[Arc<OrderContext>],
        order_count: usize,
        rollback_performed: bool,
        hedge_error: Option<&str>,
        rollback_on_partial: bool,
    ) -> ValidationOutcome {
        if rollback_performed {
            return ValidationOutcome {
                passed: false,
                should_rollback: false,
                error_message: Some(
                    hedge_error
                        .map(str::to_string)
                        .unwrap_or_else(|| "rolled back after hedge failure".to_string()),
                ),
                imbalance: ImbalanceSnapshot::default(),
                all_filled: false,
            };
        }

        let is_close = !contexts.is_empty() && contexts.iter().all(|c| c.spec.reduce_only);
        let mut snapshot = self.imbalance.calculate(contexts);

        let filled_count = contexts
            .iter()
            .filter(|c| c.report().is_some() && c.filled_quantity() > Decimal::ZERO)
            .count();
        let all_filled = filled_count == order_count;

        if all_filled {
            // Close operations skip imbalance gating entirely: the goal is
            // zero quantity, not matched quantities.
            if !is_close && self.imbalance.is_critical(&snapshot) {
                error!(
                    "[EXEC] critical quantity imbalance despite all orders filled: \
                     longs={:.6}, shorts={:.6}, imbalance={:.6} tokens ({:.2}%)",
                    snapshot.long_tokens,
                    snapshot.short_tokens,
                    snapshot.imbalance_tokens,
                    snapshot.imbalance_pct * dec!(100)
                );
                return ValidationOutcome {
                    passed: false,
                    should_rollback: true,
                    error_message: Some(format!(
                        "critical quantity imbalance: {:.6} tokens ({:.2}%)",
                        snapshot.imbalance_tokens,
                        snapshot.imbalance_pct * dec!(100)
                    )),
                    imbalance: snapshot,
                    all_filled: true,
                };
            }
            if snapshot.imbalance_pct > self.cfg.imbalance_tolerance {
                warn!(
                    "[EXEC] minor quantity imbalance after hedge: {:.6} tokens ({:.2}%)",
                    snapshot.imbalance_tokens,
                    snapshot.imbalance_pct * dec!(100)
                );
            }

            if let Some(check) = self.exposure.verify_post_trade_exposure(contexts).await {
                snapshot.imbalance_tokens = snapshot.imbalance_tokens.max(check.net_qty);
                if check.net_qty > self.cfg.post_trade_base_tolerance {
                    warn!(
                        "[EXEC] post-trade exposure after hedging: net_qty={:.6} tokens",
                        check.net_qty
                    );
                } else if check.net_qty > Decimal::ZERO {
                    debug!(
                        "[EXEC] post-trade exposure within tolerance: net_qty={:.6}",
                        check.net_qty
                    );
                }
            }

            return ValidationOutcome {
                passed: true,
                should_rollback: false,
                error_message: None,
                imbalance: snapshot,
                all_filled: true,
            };
        }

        // Partial outcome: embed the imbalance in the error and decide
        // whether it is bad enough to unwind.
        let mut error_message = hedge_error
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}: {filled_count}/{order_count}", ExecError::PartialFill));

        if !is_close && snapshot.imbalance_pct > self.cfg.imbalance_tolerance {
            error!(
                "[EXEC] quantity imbalance after partial execution: longs={:.6}, shorts={:.6}, \
                 imbalance={:.6} tokens ({:.2}%)",
                snapshot.long_tokens,
                snapshot.short_tokens,
                snapshot.imbalance_tokens,
                snapshot.imbalance_pct * dec!(100)
            );
            error_message = format!(
                "{error_message}; quantity imbalance {:.6} tokens ({:.2}%)",
                snapshot.imbalance_tokens,
                snapshot.imbalance_pct * dec!(100)
            );

            if rollback_on_partial && filled_count > 0 && self.imbalance.is_critical(&snapshot) {
                warn!(
                    "[EXEC] critical imbalance after retries exhausted; rolling back \
                     {filled_count} filled position(s)"
                );
                return ValidationOutcome {
                    passed: false,
                    should_rollback: true,
                    error_message: Some(error_message),
                    imbalance: snapshot,
                    all_filled: false,
                };
            }
        }

        if let Some(check) = self.exposure.verify_post_trade_exposure(contexts).await {
            snapshot.imbalance_tokens = snapshot.imbalance_tokens.max(check.net_qty);
            if check.net_qty > Decimal::ZERO {
                let max_tokens = snapshot.long_tokens.max(snapshot.short_tokens);
                let net_pct = if max_tokens > Decimal::ZERO {
                    check.net_qty / max_tokens
                } else {
                    Decimal::ZERO
                };
                if net_pct > self.cfg.post_trade_max_imbalance_pct {
                    warn!(
                        "[EXEC] residual exposure after partial execution: net_qty={:.6} tokens \
                         ({:.2}%)",
                        check.net_qty,
                        net_pct * dec!(100)
                    );
                }
            }
        }

        ValidationOutcome {
            passed: false,
            should_rollback: false,
            error_message: Some(error_message),
            imbalance: snapshot,
            all_filled: false,
        }
    }
}
