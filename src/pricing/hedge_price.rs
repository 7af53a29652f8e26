use std::sync::Arc;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use crate::order::Side;
use crate::venue::VenueClient;

use super::PriceProvider;

/// Which pricing path produced a hedge limit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingStrategy {
    /// Own entry strictly better than the trigger entry.
    BreakEven,
    /// One tick inside the spread (early attempts).
    InsideSpread,
    /// At best bid/ask (late attempts).
    Touch,
    /// Break-even was not feasible; fell back to BBO-based.
    BboFallback,
}

impl PricingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BreakEven => "break_even",
            Self::InsideSpread => "inside_spread",
            Self::Touch => "touch",
            Self::BboFallback => "bbo_fallback",
        }
    }
}

/// A priced hedge attempt.
#[derive(Debug, Clone)]
pub struct HedgePrice {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub limit_price: Decimal,
    pub strategy: PricingStrategy,
}

/// Adaptive limit pricing for the hedge path.
///
/// Prefers a break-even target relative to the trigger fill when the market
/// has not moved away from it, otherwise walks from inside-spread to touch
/// as attempts burn down.
pub struct HedgePricer {
    prices: Arc<PriceProvider>,
    /// Mid deviation beyond which break-even is considered stale.
    max_deviation_pct: Decimal,
}

impl HedgePricer {
    pub fn new(prices: Arc<PriceProvider>, max_deviation_pct: Decimal) -> Self {
        Self {
            prices,
            max_deviation_pct,
        }
    }

    /// Compute the limit price for one hedge attempt.
    ///
    /// # Arguments
    /// * `trigger_fill` - `(side, fill_price)` of the trigger leg, if known
    /// * `attempt` - zero-based retry index
    /// * `inside_tick_retries` - attempts priced inside the spread before touch
    pub async fn hedge_limit_price(
        &self,
        venue: &Arc<dyn VenueClient>,
        symbol: &str,
        side: Side,
        trigger_fill: Option<(Side, Decimal)>,
        attempt: u32,
        inside_tick_retries: u32,
    ) -> Result<HedgePrice> {
        // Always price off a fresh BBO; stale quotes defeat the purpose.
        let (best_bid, best_ask) = self
            .prices
            .get_bbo_prices(venue, symbol, Some(std::time::Duration::ZERO))
            .await?;
        if best_bid <= Decimal::ZERO || best_ask <= Decimal::ZERO {
            bail!(
                "invalid BBO for {}:{symbol}: bid={best_bid} ask={best_ask}",
                venue.name()
            );
        }

        // Tick size with a 1 bp fallback when the venue exposes none.
        let tick = venue
            .tick_size(symbol)
            .unwrap_or_else(|| best_ask * dec!(0.0001));

        if let Some((trigger_side, trigger_price)) = trigger_fill {
            if let Some((price, strategy)) = break_even_price(
                trigger_price,
                trigger_side,
                best_bid,
                best_ask,
                side,
                tick,
                self.max_deviation_pct,
            ) {
                if strategy == PricingStrategy::BreakEven {
                    info!(
                        "[HEDGE] break-even price {price} vs trigger {trigger_price} for {}:{symbol}",
                        venue.name()
                    );
                    return Ok(HedgePrice {
                        best_bid,
                        best_ask,
                        limit_price: venue.round_to_tick(price),
                        strategy,
                    });
                }
                debug!(
                    "[HEDGE] break-even not feasible for {}:{symbol}; using BBO-adaptive pricing",
                    venue.name()
                );
            }
        }

        let (price, strategy) = if attempt < inside_tick_retries {
            let price = match side {
                Side::Buy => best_ask - tick,
                Side::Sell => best_bid + tick,
            };
            (price, PricingStrategy::InsideSpread)
        } else {
            let price = match side {
                Side::Buy => best_ask,
                Side::Sell => best_bid,
            };
            (price, PricingStrategy::Touch)
        };

        Ok(HedgePrice {
            best_bid,
            best_ask,
            limit_price: venue.round_to_tick(price),
            strategy,
        })
    }
}

/// Break-even target: own entry one bp better than the trigger entry.
///
/// Returns `None` for side combinations that are not a long/short pair.
/// Feasibility requires the target to still be fillable against the BBO and
/// the mid not to have deviated more than `max_deviation_pct` from it.
fn break_even_price(
    trigger_price: Decimal,
    trigger_side: Side,
    hedge_bid: Decimal,
    hedge_ask: Decimal,
    hedge_side: Side,
    _tick: Decimal,
    max_deviation_pct: Decimal,
) -> Option<(Decimal, PricingStrategy)> {
    if trigger_side == hedge_side {
        return None;
    }
    let target = trigger_price * (Decimal::ONE - dec!(0.0001));
    let two = Decimal::from(2);
    let mid = (hedge_bid + hedge_ask) / two;
    if mid <= Decimal::ZERO {
        return Some((target, PricingStrategy::BboFallback));
    }

    let fillable = match hedge_side {
        // Hedging short: a sell above the bid can rest; below it is stale.
        Side::Sell => target >= hedge_bid,
        // Hedging long: a buy below the ask can rest; above it is stale.
        Side::Buy => target <= hedge_ask,
    };
    if !fillable {
        warn!(
            "[HEDGE] break-even target {target} unfillable against bid={hedge_bid} ask={hedge_ask}"
        );
        return Some((target, PricingStrategy::BboFallback));
    }

    let deviation = (target - mid).abs() / mid;
    if deviation <= max_deviation_pct {
        Some((target, PricingStrategy::BreakEven))
    } else {
        warn!(
            "[HEDGE] market moved {:.2}% since trigger fill; break-even target {target} stale",
            deviation * dec!(100)
        );
        Some((target, PricingStrategy::BboFallback))
    }
}

/// Result of cross-venue entry price alignment.
#[derive(Debug, Clone)]
pub struct AlignedPrices {
    pub long_price: Decimal,
    pub short_price: Decimal,
    /// "aligned", "post_only_adjusted" or "bbo_fallback".
    pub strategy_used: &'static str,
    pub spread_pct: Decimal,
}

/// Align initial entry prices so the long entry lands below the short entry.
///
/// Uses min-mid ± 25% of the cross-venue spread, adjusted to stay post-only
/// safe; falls back to plain BBO pricing when the venues disagree by more
/// than `max_spread_pct` (default 0.5%).
pub fn aligned_entry_prices(
    long_bid: Decimal,
    long_ask: Decimal,
    short_bid: Decimal,
    short_ask: Decimal,
    limit_offset_pct: Option<Decimal>,
    max_spread_pct: Option<Decimal>,
) -> AlignedPrices {
    let offset_pct = limit_offset_pct.unwrap_or(dec!(0.0001));
    let max_spread = max_spread_pct.unwrap_or(dec!(0.005));
    let two = Decimal::from(2);

    let long_mid = (long_bid + long_ask) / two;
    let short_mid = (short_bid + short_ask) / two;
    let min_mid = long_mid.min(short_mid);
    let max_mid = long_mid.max(short_mid);
    let spread = max_mid - min_mid;
    let spread_pct = if min_mid > Decimal::ZERO {
        spread / min_mid
    } else {
        Decimal::ZERO
    };

    if spread_pct > max_spread {
        debug!(
            "[HEDGE] venue spread {:.2}% too wide for aligned entries; using BBO",
            spread_pct * dec!(100)
        );
        return AlignedPrices {
            long_price: long_ask,
            short_price: short_bid,
            strategy_used: "bbo_fallback",
            spread_pct,
        };
    }

    let offset = spread * dec!(0.25);
    let mut long_price = min_mid - offset;
    let mut short_price = min_mid + offset;
    let mut adjusted = false;

    // Post-only safety: buys must rest at/below the bid, sells at/above the ask.
    if long_price > long_bid {
        long_price = long_bid * (Decimal::ONE - offset_pct);
        adjusted = true;
    }
    if short_price < short_ask {
        short_price = short_ask * (Decimal::ONE + offset_pct);
        adjusted = true;
    }

    if long_price >= short_price {
        warn!(
            "[HEDGE] aligned entries collapsed (long {long_price} >= short {short_price}); using BBO"
        );
        return AlignedPrices {
            long_price: long_ask,
            short_price: short_bid,
            strategy_used: "bbo_fallback",
            spread_pct,
        };
    }

    AlignedPrices {
        long_price,
        short_price,
        strategy_used: if adjusted { "post_only_adjusted" } else { "aligned" },
        spread_pct,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_even_used_when_market_stable() {
        // Long filled at 100.0; hedging short. Target = 99.99, bid = 99.95.
        let got = break_even_price(
            dec!(100.0),
            Side::Buy,
            dec!(99.95),
            dec!(100.05),
            Side::Sell,
            dec!(0.01),
            dec!(0.005),
        )
        .unwrap();
        assert_eq!(got.1, PricingStrategy::BreakEven);
        assert_eq!(got.0, dec!(99.990000));
    }

    #[test]
    fn break_even_falls_back_when_unfillable() {
        // Market ran away: bid far above the break-even target.
        let got = break_even_price(
            dec!(100.0),
            Side::Buy,
            dec!(101.00),
            dec!(101.10),
            Side::Sell,
            dec!(0.01),
            dec!(0.005),
        )
        .unwrap();
        assert_eq!(got.1, PricingStrategy::BboFallback);
    }

    #[test]
    fn break_even_requires_opposite_sides() {
        assert!(break_even_price(
            dec!(100.0),
            Side::Buy,
            dec!(99.95),
            dec!(100.05),
            Side::Buy,
            dec!(0.01),
            dec!(0.005),
        )
        .is_none());
    }

    #[test]
    fn aligned_entries_keep_long_below_short() {
        let aligned = aligned_entry_prices(
            dec!(99.90),
            dec!(100.00),
            dec!(100.02),
            dec!(100.12),
            None,
            None,
        );
        assert!(aligned.long_price < aligned.short_price);
        assert_ne!(aligned.strategy_used, "bbo_fallback");
    }

    #[test]
    fn wide_venue_spread_falls_back_to_bbo() {
        let aligned = aligned_entry_prices(
            dec!(99.00),
            dec!(99.10),
            dec!(101.00),
            dec!(101.10),
            None,
            None,
        );
        assert_eq!(aligned.strategy_used, "bbo_fallback");
        assert_eq!(aligned.long_price, dec!(99.10));
        assert_eq!(aligned.short_price, dec!(101.00));
    }
}
