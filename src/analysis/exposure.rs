use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, warn};

use crate::order::{OrderContext, Side};

/// Post-trade exposure figures.
#[derive(Debug, Clone, Default)]
pub struct ExposureCheck {
    /// Net token quantity from context data (websocket-updated).
    pub net_qty: Decimal,
    pub net_usd: Decimal,
    pub net_pct: Decimal,
    pub long_usd: Decimal,
    pub short_usd: Decimal,
}

/// Cross-checks context fills against venue position snapshots.
///
/// Context data is the primary source (websocket callbacks keep it current);
/// snapshots lag fills and serve only to surface discrepancies and to supply
/// USD figures the contexts do not track per venue.
pub struct ExposureVerifier {
    discrepancy_tolerance: Decimal,
}

impl ExposureVerifier {
    pub fn new() -> Self {
        Self {
            discrepancy_tolerance: dec!(0.01),
        }
    }

    pub async fn verify_post_trade_exposure(
        &self,
        contexts: &[Arc<OrderContext>],
    ) -> Option<ExposureCheck> {
        if contexts.is_empty() {
            return None;
        }

        // Primary: token-normalized totals from contexts.
        let mut context_long = Decimal::ZERO;
        let mut context_short = Decimal::ZERO;
        for ctx in contexts {
            let filled = ctx.filled_quantity();
            if filled <= Decimal::ZERO {
                continue;
            }
            let multiplier = Decimal::from(ctx.spec.venue.quantity_multiplier(&ctx.spec.symbol));
            let tokens = filled.abs() * multiplier;
            match ctx.spec.side {
                Side::Buy => context_long += tokens,
                Side::Sell => context_short += tokens,
            }
        }

        // Secondary: one snapshot per unique (venue, symbol).
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut fetches = Vec::new();
        for ctx in contexts {
            let key = (ctx.spec.venue.name().to_string(), ctx.spec.symbol.clone());
            if !seen.insert(key) {
                continue;
            }
            let venue = ctx.spec.venue.clone();
            let symbol = ctx.spec.symbol.clone();
            fetches.push(async move {
                match venue.get_position_snapshot(&symbol).await {
                    Ok(snapshot) => snapshot.map(|s| (venue, symbol, s)),
                    Err(err) => {
                        warn!(
                            "[EXEC] position snapshot fetch failed for {}:{symbol}: {err}",
                            venue.name()
                        );
                        None
                    }
                }
            });
        }

        let mut snapshot_long = Decimal::ZERO;
        let mut snapshot_short = Decimal::ZERO;
        let mut snapshot_long_usd = Decimal::ZERO;
        let mut snapshot_short_usd = Decimal::ZERO;

        for entry in join_all(fetches).await.into_iter().flatten() {
            let (venue, symbol, snapshot) = entry;
            let multiplier = Decimal::from(venue.quantity_multiplier(&symbol));
            let tokens = snapshot.quantity.abs() * multiplier;
            let side = snapshot.side.clone().unwrap_or_else(|| {
                if snapshot.quantity >= Decimal::ZERO {
                    "long".to_string()
                } else {
                    "short".to_string()
                }
            });
            match side.as_str() {
                "long" => {
                    snapshot_long += tokens;
                    snapshot_long_usd += snapshot.exposure_usd.unwrap_or(Decimal::ZERO);
                }
                "short" => {
                    snapshot_short += tokens;
                    snapshot_short_usd += snapshot.exposure_usd.unwrap_or(Decimal::ZERO);
                }
                other => debug!("[EXEC] unrecognized position side '{other}' for {symbol}"),
            }
        }

        // USD: prefer snapshot figures, estimate from fills otherwise.
        let (long_usd, short_usd) = if snapshot_long_usd > Decimal::ZERO
            || snapshot_short_usd > Decimal::ZERO
        {
            (snapshot_long_usd, snapshot_short_usd)
        } else {
            let mut long_usd = Decimal::ZERO;
            let mut short_usd = Decimal::ZERO;
            for ctx in contexts {
                let filled = ctx.filled_quantity();
                if filled <= Decimal::ZERO {
                    continue;
                }
                let Some(price) = ctx.report().and_then(|r| r.fill_price) else {
                    continue;
                };
                let multiplier =
                    Decimal::from(ctx.spec.venue.quantity_multiplier(&ctx.spec.symbol));
                let usd = filled.abs() * multiplier * price;
                match ctx.spec.side {
                    Side::Buy => long_usd += usd,
                    Side::Sell => short_usd += usd,
                }
            }
            (long_usd, short_usd)
        };

        let context_net = (context_long - context_short).abs();
        let snapshot_net = (snapshot_long - snapshot_short).abs();
        if (context_net - snapshot_net).abs() > self.discrepancy_tolerance {
            debug!(
                "[EXEC] exposure discrepancy: context net_qty={context_net:.6}, \
                 snapshot net_qty={snapshot_net:.6}; context stays authoritative"
            );
        }

        let net_usd = (long_usd - short_usd).abs();
        let max_usd = long_usd.max(short_usd);
        let net_pct = if max_usd > Decimal::ZERO {
            net_usd / max_usd
        } else {
            Decimal::ZERO
        };

        Some(ExposureCheck {
            net_qty: context_net,
            net_usd,
            net_pct,
            long_usd,
            short_usd,
        })
    }
}

impl Default for ExposureVerifier {
    fn default() -> Self {
        Self::new()
    }
}
