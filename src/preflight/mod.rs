/// Pre-flight gating: leverage, margin, liquidity, minimum notional.

pub mod leverage;

pub use leverage::{LeverageLimits, LeverageValidator};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::analysis::LiquidityAnalyzer;
use crate::config::PreFlightConfig;
use crate::error::ExecError;
use crate::order::OrderSpec;
use crate::pricing::PriceProvider;
use crate::venue::VenueClient;

/// Receiver for margin-shortfall alerts. Delivery (Telegram, email, ...)
/// lives outside the core; the default sink just logs.
pub trait MarginAlertSink: Send + Sync {
    fn insufficient_margin(&self, venue: &str, symbol: &str, available: Decimal, required: Decimal);
}

/// Default sink: structured log only.
pub struct LogAlertSink;

impl MarginAlertSink for LogAlertSink {
    fn insufficient_margin(&self, venue: &str, symbol: &str, available: Decimal, required: Decimal) {
        error!(
            "[PREFLIGHT] insufficient margin on {venue}/{symbol}: \
             available=${available:.2}, required=${required:.2}"
        );
    }
}

type PairKey = (String, String);

/// Sequenced pre-flight gates; any failure short-circuits with a
/// stage-tagged error and no orders placed.
pub struct PreFlightChecker {
    cfg: PreFlightConfig,
    leverage: Arc<LeverageValidator>,
    prices: Arc<PriceProvider>,
    alert_sink: Arc<dyn MarginAlertSink>,
    /// Normalized leverage per (venue, symbol), filled by stage 1 and read
    /// by the margin estimate in stage 2.
    normalized_leverage: Mutex<HashMap<PairKey, Decimal>>,
    /// Alert throttle: set once per (venue, symbol) shortfall, cleared when
    /// margin recovers.
    margin_alerted: Mutex<HashMap<PairKey, bool>>,
}

impl PreFlightChecker {
    pub fn new(
        cfg: PreFlightConfig,
        leverage: Arc<LeverageValidator>,
        prices: Arc<PriceProvider>,
        alert_sink: Arc<dyn MarginAlertSink>,
    ) -> Self {
        Self {
            cfg,
            leverage,
            prices,
            alert_sink,
            normalized_leverage: Mutex::new(HashMap::new()),
            margin_alerted: Mutex::new(HashMap::new()),
        }
    }

    pub fn normalized_leverage(&self, venue: &str, symbol: &str) -> Option<Decimal> {
        self.normalized_leverage
            .lock()
            .get(&(venue.to_string(), symbol.to_string()))
            .copied()
    }

    /// Run all stages. `Ok(())` means every gate passed.
    pub async fn check(&self, orders: &[OrderSpec], skip_leverage_check: bool) -> Result<(), ExecError> {
        let mut by_symbol: HashMap<String, Vec<&OrderSpec>> = HashMap::new();
        for spec in orders {
            by_symbol.entry(spec.symbol.clone()).or_default().push(spec);
        }

        if !skip_leverage_check {
            self.check_leverage(&by_symbol).await?;
        }
        self.check_balances(orders).await?;
        self.check_liquidity(orders).await?;
        self.check_min_notional(orders)?;

        info!("[PREFLIGHT] all checks passed");
        Ok(())
    }

    async fn check_leverage(
        &self,
        by_symbol: &HashMap<String, Vec<&OrderSpec>>,
    ) -> Result<(), ExecError> {
        for (symbol, specs) in by_symbol {
            let venues: Vec<Arc<dyn VenueClient>> =
                specs.iter().map(|s| s.venue.clone()).collect();
            let requested = specs[0].size_usd;

            let (max_size, limiting) = self
                .leverage
                .get_max_position_size(&venues, symbol, requested, true)
                .await;
            if max_size < requested {
                let message = format!(
                    "position size too large for {symbol}: requested ${requested:.2}, \
                     maximum supported ${max_size:.2} (limited by {})",
                    limiting.as_deref().unwrap_or("unknown")
                );
                warn!("[PREFLIGHT] {message}");
                return Err(ExecError::PreFlightFailure {
                    stage: "leverage".to_string(),
                    message,
                });
            }

            match self.leverage.normalize_and_set_leverage(&venues, symbol).await {
                Some((normalized, _)) => {
                    let mut cache = self.normalized_leverage.lock();
                    for spec in specs {
                        cache.insert(
                            (spec.venue.name().to_string(), symbol.clone()),
                            normalized,
                        );
                    }
                }
                None => warn!(
                    "[PREFLIGHT] could not normalize leverage for {symbol}; \
                     legs may execute with different leverage"
                ),
            }
        }
        Ok(())
    }

    async fn check_balances(&self, orders: &[OrderSpec]) -> Result<(), ExecError> {
        // Required margin per venue across all of its legs.
        let mut required: HashMap<String, Decimal> = HashMap::new();
        let mut venue_of: HashMap<String, &OrderSpec> = HashMap::new();
        for spec in orders {
            let margin = self.estimate_required_margin(spec).await;
            *required.entry(spec.venue.name().to_string()).or_default() += margin;
            venue_of.entry(spec.venue.name().to_string()).or_insert(spec);
        }

        for (venue_name, required_margin) in required {
            let spec = venue_of[&venue_name];
            let symbol = spec.symbol.clone();
            let available = match spec.venue.get_account_balance().await {
                Ok(Some(balance)) => balance,
                Ok(None) => {
                    warn!(
                        "[PREFLIGHT] cannot verify balance for {venue_name} \
                         (required ~${required_margin:.2})"
                    );
                    continue;
                }
                Err(err) => {
                    warn!("[PREFLIGHT] balance check failed for {venue_name}: {err}");
                    continue;
                }
            };

            let required_with_buffer = required_margin * self.cfg.margin_buffer;
            let key = (venue_name.to_lowercase(), symbol.clone());
            if available < required_with_buffer {
                let message = format!(
                    "insufficient balance on {venue_name}: available=${available:.2}, \
                     required=${required_with_buffer:.2} (${required_margin:.2} + buffer)"
                );
                error!("[PREFLIGHT] {message}");

                let mut alerted = self.margin_alerted.lock();
                if !alerted.get(&key).copied().unwrap_or(false) {
                    self.alert_sink.insufficient_margin(
                        &venue_name,
                        &symbol,
                        available,
                        required_with_buffer,
                    );
                    alerted.insert(key, true);
                } else {
                    debug!(
                        "[PREFLIGHT] margin alert for {venue_name}/{symbol} already sent; throttled"
                    );
                }

                return Err(ExecError::PreFlightFailure {
                    stage: "balance".to_string(),
                    message,
                });
            }

            // Margin recovered: re-arm the alert for this pair.
            if self.margin_alerted.lock().remove(&key).is_some() {
                info!("[PREFLIGHT] margin recovered for {venue_name}/{symbol}; alert re-armed");
            }
            info!(
                "[PREFLIGHT] {venue_name} balance OK: ${available:.2} >= ${required_with_buffer:.2}"
            );
        }
        Ok(())
    }

    /// Margin for one leg: normalized leverage first, then the venue's
    /// margin requirement, then max leverage, then a conservative flat rate.
    async fn estimate_required_margin(&self, spec: &OrderSpec) -> Decimal {
        if let Some(normalized) = self.normalized_leverage(spec.venue.name(), &spec.symbol) {
            if normalized > Decimal::ZERO {
                return spec.size_usd / normalized;
            }
        }

        let limits = self.leverage.get_limits(&spec.venue, &spec.symbol).await;
        if let Some(margin_requirement) = limits.margin_requirement {
            return spec.size_usd * margin_requirement;
        }
        if let Some(max_leverage) = limits.max_leverage.filter(|l| *l > Decimal::ZERO) {
            return spec.size_usd / max_leverage;
        }
        warn!(
            "[PREFLIGHT] no leverage info for {}:{}; using conservative margin estimate",
            spec.venue.name(),
            spec.symbol
        );
        spec.size_usd * self.cfg.conservative_margin_pct
    }

    async fn check_liquidity(&self, orders: &[OrderSpec]) -> Result<(), ExecError> {
        let analyzer = LiquidityAnalyzer::new(
            self.cfg.max_slippage_pct,
            self.cfg.max_spread_bps,
            self.cfg.min_liquidity_score,
            Some(self.prices.clone()),
        );

        for (i, spec) in orders.iter().enumerate() {
            let report = analyzer
                .check_execution_feasibility(
                    &spec.venue,
                    &spec.symbol,
                    spec.side,
                    spec.size_usd,
                    self.cfg.depth_levels,
                )
                .await;
            if !analyzer.is_execution_acceptable(&report) {
                let message = format!(
                    "order {i} ({} {}) failed liquidity check: {}",
                    spec.side, spec.symbol, report.recommendation
                );
                warn!("[PREFLIGHT] {message}");
                return Err(ExecError::PreFlightFailure {
                    stage: "liquidity".to_string(),
                    message,
                });
            }
        }
        Ok(())
    }

    fn check_min_notional(&self, orders: &[OrderSpec]) -> Result<(), ExecError> {
        for spec in orders {
            let Some(min_notional) = spec.venue.min_order_notional(&spec.symbol) else {
                continue;
            };
            if min_notional <= Decimal::ZERO {
                continue;
            }
            if spec.size_usd < min_notional {
                let message = format!(
                    "[{}] {} order notional ${:.2} below minimum ${min_notional:.2}",
                    spec.venue_name(),
                    spec.symbol,
                    spec.size_usd
                );
                warn!("[PREFLIGHT] {message}");
                return Err(ExecError::PreFlightFailure {
                    stage: "min_notional".to_string(),
                    message,
                });
            }
        }
        Ok(())
    }
}
