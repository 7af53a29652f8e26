use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Top-level configuration for the atomic execution engine.
///
/// All tolerances are expressed as decimal fractions (`0.01` = 1%) and all
/// windows in milliseconds so the struct deserializes from plain JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Maximum normalized-token imbalance ratio for a balanced batch.
    pub imbalance_tolerance: Decimal,
    /// Fills beyond `spec.quantity * fill_sanity_cap` are rejected as bogus.
    pub fill_sanity_cap: Decimal,
    /// Remaining quantity below this counts as fully filled (rounding slack).
    pub full_fill_tolerance: Decimal,
    /// Net exposure ratio that triggers a post-trade warning.
    pub post_trade_max_imbalance_pct: Decimal,
    /// Residual token quantity that triggers a post-trade warning.
    pub post_trade_base_tolerance: Decimal,
    /// BBO cache time-to-live in milliseconds.
    pub price_cache_ttl_ms: u64,
    pub hedge: HedgeConfig,
    pub preflight: PreFlightConfig,
    pub confirm: ConfirmConfig,
    pub rollback: RollbackConfig,
}

impl ExecutionConfig {
    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.price_cache_ttl_ms)
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            imbalance_tolerance: dec!(0.01),
            fill_sanity_cap: dec!(1.10),
            full_fill_tolerance: dec!(0.0001),
            post_trade_max_imbalance_pct: dec!(0.02),
            post_trade_base_tolerance: dec!(0.0001),
            price_cache_ttl_ms: 5_000,
            hedge: HedgeConfig::default(),
            preflight: PreFlightConfig::default(),
            confirm: ConfirmConfig::default(),
            rollback: RollbackConfig::default(),
        }
    }
}

/// Retry/backoff budget for one aggressive-limit hedge pass.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HedgeBudget {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub total_timeout_ms: u64,
    /// Attempts priced one tick inside the spread before moving to touch.
    pub inside_tick_retries: u32,
}

impl HedgeBudget {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    /// Budget for opening hedges: favor slippage savings over speed.
    pub fn open() -> Self {
        Self {
            max_retries: 8,
            retry_backoff_ms: 75,
            total_timeout_ms: 6_000,
            inside_tick_retries: 3,
        }
    }

    /// Budget for closing hedges: favor a fast exit.
    pub fn close() -> Self {
        Self {
            max_retries: 5,
            retry_backoff_ms: 50,
            total_timeout_ms: 3_000,
            inside_tick_retries: 2,
        }
    }
}

impl Default for HedgeBudget {
    fn default() -> Self {
        Self::open()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HedgeConfig {
    pub open: HedgeBudget,
    pub close: HedgeBudget,
    /// Accumulated fills at or above `target * fill_threshold` count as done.
    pub fill_threshold: Decimal,
    /// Maximum mid-price deviation for break-even pricing to stay viable.
    pub max_deviation_pct: Decimal,
    pub attempt_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl HedgeConfig {
    pub fn budget(&self, reduce_only: bool) -> &HedgeBudget {
        if reduce_only {
            &self.close
        } else {
            &self.open
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            open: HedgeBudget::open(),
            close: HedgeBudget::close(),
            fill_threshold: dec!(0.99),
            max_deviation_pct: dec!(0.005),
            attempt_timeout_ms: 1_500,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreFlightConfig {
    /// Required margin is padded by this factor before the balance check.
    pub margin_buffer: Decimal,
    pub max_slippage_pct: Decimal,
    pub max_spread_bps: u32,
    pub min_liquidity_score: f64,
    pub depth_levels: usize,
    /// Margin estimate when a venue exposes no leverage information.
    pub conservative_margin_pct: Decimal,
}

impl Default for PreFlightConfig {
    fn default() -> Self {
        Self {
            margin_buffer: dec!(1.05),
            max_slippage_pct: dec!(0.005),
            max_spread_bps: 100,
            min_liquidity_score: 0.6,
            depth_levels: 20,
            conservative_margin_pct: dec!(0.20),
        }
    }
}

/// Windows for market-order confirmation (websocket first, then polling).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfirmConfig {
    pub ws_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
}

impl ConfirmConfig {
    pub fn ws_wait(&self) -> Duration {
        Duration::from_millis(self.ws_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            ws_wait_ms: 2_000,
            poll_interval_ms: 200,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Pause after cancelling open orders so late fills propagate.
    pub cancel_settle_ms: u64,
    /// Pause after close orders so fills land before cost lookup.
    pub close_settle_ms: u64,
    /// Positions at or below this size count as flat.
    pub residual_tolerance: Decimal,
}

impl RollbackConfig {
    pub fn cancel_settle(&self) -> Duration {
        Duration::from_millis(self.cancel_settle_ms)
    }

    pub fn close_settle(&self) -> Duration {
        Duration::from_millis(self.close_settle_ms)
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            cancel_settle_ms: 500,
            close_settle_ms: 1_000,
            residual_tolerance: dec!(0.0001),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tolerances() {
        let cfg = ExecutionConfig::default();
        assert_eq!(cfg.imbalance_tolerance, dec!(0.01));
        assert_eq!(cfg.fill_sanity_cap, dec!(1.10));
        assert_eq!(cfg.hedge.open.max_retries, 8);
        assert_eq!(cfg.hedge.close.max_retries, 5);
        assert_eq!(cfg.hedge.close.total_timeout_ms, 3_000);
    }

    #[test]
    fn deserializes_partial_overrides() {
        let cfg: ExecutionConfig =
            serde_json::from_str(r#"{"imbalance_tolerance": "0.02", "hedge": {"attempt_timeout_ms": 500}}"#)
                .unwrap();
        assert_eq!(cfg.imbalance_tolerance, dec!(0.02));
        assert_eq!(cfg.hedge.attempt_timeout_ms, 500);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.fill_sanity_cap, dec!(1.10));
    }
}
