use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::venue::{LeverageInfo, VenueClient};

/// Leverage limits resolved for one (venue, symbol).
#[derive(Debug, Clone, Default)]
pub struct LeverageLimits {
    pub max_leverage: Option<Decimal>,
    pub max_notional: Option<Decimal>,
    pub margin_requirement: Option<Decimal>,
}

impl LeverageLimits {
    fn from_info(info: LeverageInfo) -> Self {
        Self {
            max_leverage: info.max_leverage,
            max_notional: info.max_notional,
            margin_requirement: info.margin_requirement,
        }
    }

    /// Most restrictive of: max notional, leverage × balance,
    /// balance / margin requirement. `None` when nothing constrains.
    pub fn max_size_usd(&self, available_balance: Option<Decimal>) -> Option<Decimal> {
        let mut limits: Vec<Decimal> = Vec::new();
        if let Some(max_notional) = self.max_notional {
            limits.push(max_notional);
        }
        if let (Some(leverage), Some(balance)) = (self.max_leverage, available_balance) {
            limits.push(leverage * balance);
        }
        if let (Some(margin), Some(balance)) = (self.margin_requirement, available_balance) {
            if margin > Decimal::ZERO {
                limits.push(balance / margin);
            }
        }
        limits.into_iter().min()
    }
}

/// Max-size computation and cross-venue leverage normalization.
///
/// Delta-neutral batches need identical sizes on every leg, so the most
/// restrictive venue bounds the whole batch, and every venue is set to the
/// minimum common leverage before placement.
pub struct LeverageValidator {
    cache: Mutex<HashMap<(String, String), LeverageLimits>>,
}

impl LeverageValidator {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_limits(&self, venue: &Arc<dyn VenueClient>, symbol: &str) -> LeverageLimits {
        let key = (venue.name().to_string(), symbol.to_string());
        if let Some(cached) = self.cache.lock().get(&key) {
            return cached.clone();
        }

        let limits = match venue.get_leverage_info(symbol).await {
            Ok(info) => LeverageLimits::from_info(info),
            Err(err) => {
                warn!(
                    "[LEVERAGE] query failed for {}:{symbol}: {err}; using conservative default",
                    venue.name()
                );
                LeverageLimits {
                    max_leverage: Some(dec!(10)),
                    max_notional: None,
                    margin_requirement: Some(dec!(0.10)),
                }
            }
        };

        self.cache.lock().insert(key, limits.clone());
        limits
    }

    /// Largest size every venue can carry; returns the limiting venue name
    /// when the requested size was cut.
    pub async fn get_max_position_size(
        &self,
        venues: &[Arc<dyn VenueClient>],
        symbol: &str,
        requested_size_usd: Decimal,
        check_balance: bool,
    ) -> (Decimal, Option<String>) {
        let mut max_size = requested_size_usd;
        let mut limiting: Option<String> = None;

        for venue in venues {
            let limits = self.get_limits(venue, symbol).await;
            let balance = if check_balance {
                match venue.get_account_balance().await {
                    Ok(balance) => balance,
                    Err(_) => {
                        warn!("[LEVERAGE] could not get balance for {}", venue.name());
                        None
                    }
                }
            } else {
                None
            };

            if let Some(venue_max) = limits.max_size_usd(balance) {
                if venue_max < max_size {
                    warn!(
                        "[LEVERAGE] {} limits {symbol} position to ${venue_max:.2} \
                         (requested ${requested_size_usd:.2})",
                        venue.name()
                    );
                    max_size = venue_max;
                    limiting = Some(venue.name().to_string());
                }
            }
        }

        (max_size, limiting)
    }

    /// Set every venue to the minimum common max leverage for `symbol`.
    ///
    /// Returns `(normalized_leverage, limiting_venue)`, or `None` when no
    /// venue reports a max leverage.
    pub async fn normalize_and_set_leverage(
        &self,
        venues: &[Arc<dyn VenueClient>],
        symbol: &str,
    ) -> Option<(Decimal, String)> {
        let mut min_leverage: Option<(Decimal, String)> = None;
        for venue in venues {
            let limits = self.get_limits(venue, symbol).await;
            if let Some(leverage) = limits.max_leverage {
                match &min_leverage {
                    Some((current, _)) if leverage >= *current => {}
                    _ => min_leverage = Some((leverage, venue.name().to_string())),
                }
            }
        }

        let (leverage, limiting) = min_leverage?;
        for venue in venues {
            if let Err(err) = venue.set_leverage(symbol, leverage).await {
                warn!(
                    "[LEVERAGE] failed to set {leverage}x on {} for {symbol}: {err}",
                    venue.name()
                );
            }
        }
        info!("[LEVERAGE] {symbol} normalized to {leverage}x (limited by {limiting})");
        Some((leverage, limiting))
    }
}

impl Default for LeverageValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_size_takes_most_restrictive_limit() {
        let limits = LeverageLimits {
            max_leverage: Some(dec!(20)),   // 20 × 1000 = 20000
            max_notional: Some(dec!(5000)), // 5000
            margin_requirement: Some(dec!(0.10)), // 1000 / 0.10 = 10000
        };
        assert_eq!(limits.max_size_usd(Some(dec!(1000))), Some(dec!(5000)));
    }

    #[test]
    fn no_limits_means_unbounded() {
        let limits = LeverageLimits::default();
        assert_eq!(limits.max_size_usd(Some(dec!(1000))), None);
        assert_eq!(limits.max_size_usd(None), None);
    }

    #[test]
    fn balance_independent_notional_still_applies() {
        let limits = LeverageLimits {
            max_leverage: Some(dec!(20)),
            max_notional: Some(dec!(5000)),
            margin_requirement: None,
        };
        assert_eq!(limits.max_size_usd(None), Some(dec!(5000)));
    }
}
