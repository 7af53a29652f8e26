use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};

use crate::order::Side;
use crate::pricing::PriceProvider;
use crate::venue::{BookLevel, VenueClient};

/// Verdict strings mirror the execution layer's decision taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    InsufficientDepth,
    UseLimit,
    UseMarketAcceptable,
    HighSlippageWarning,
    WideSpreadWarning,
    ModerateLiquidity,
    AnalysisFailed,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsufficientDepth => "insufficient_depth",
            Self::UseLimit => "use_limit",
            Self::UseMarketAcceptable => "use_market_acceptable",
            Self::HighSlippageWarning => "high_slippage_warning",
            Self::WideSpreadWarning => "wide_spread_warning",
            Self::ModerateLiquidity => "moderate_liquidity",
            Self::AnalysisFailed => "analysis_failed",
        }
    }
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order book analysis for one prospective order.
#[derive(Debug, Clone)]
pub struct LiquidityReport {
    pub depth_sufficient: bool,
    pub expected_slippage_pct: Decimal,
    pub expected_avg_price: Decimal,
    pub spread_bps: u32,
    /// 0–1, higher is better.
    pub liquidity_score: f64,
    pub recommendation: Recommendation,
    pub required_levels: usize,
    pub total_depth_usd: Decimal,
    pub mid_price: Decimal,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
}

impl LiquidityReport {
    fn pessimistic(recommendation: Recommendation) -> Self {
        Self {
            depth_sufficient: false,
            expected_slippage_pct: Decimal::ONE,
            expected_avg_price: Decimal::ZERO,
            spread_bps: 9_999,
            liquidity_score: 0.0,
            recommendation,
            required_levels: 0,
            total_depth_usd: Decimal::ZERO,
            mid_price: Decimal::ZERO,
            best_bid: Decimal::ZERO,
            best_ask: Decimal::ZERO,
        }
    }
}

struct FillSimulation {
    filled_completely: bool,
    total_quantity: Decimal,
    total_cost: Decimal,
    levels_consumed: usize,
    remaining_usd: Decimal,
}

/// Order book depth / slippage / spread scoring ahead of placement.
pub struct LiquidityAnalyzer {
    max_slippage_pct: Decimal,
    max_spread_bps: u32,
    min_liquidity_score: f64,
    prices: Option<Arc<PriceProvider>>,
}

impl LiquidityAnalyzer {
    pub fn new(
        max_slippage_pct: Decimal,
        max_spread_bps: u32,
        min_liquidity_score: f64,
        prices: Option<Arc<PriceProvider>>,
    ) -> Self {
        Self {
            max_slippage_pct,
            max_spread_bps,
            min_liquidity_score,
            prices,
        }
    }

    /// Can this order execute with acceptable slippage?
    pub async fn check_execution_feasibility(
        &self,
        venue: &Arc<dyn VenueClient>,
        symbol: &str,
        side: Side,
        size_usd: Decimal,
        depth_levels: usize,
    ) -> LiquidityReport {
        let book = match venue.get_order_book(symbol, depth_levels).await {
            Ok(book) => book,
            Err(err) => {
                error!("[LIQUIDITY] book fetch failed for {}:{symbol}: {err}", venue.name());
                return LiquidityReport::pessimistic(Recommendation::AnalysisFailed);
            }
        };

        if book.bids.is_empty() || book.asks.is_empty() {
            warn!(
                "[LIQUIDITY] empty book for {}:{symbol} ({} bids, {} asks)",
                venue.name(),
                book.bids.len(),
                book.asks.len()
            );
            return LiquidityReport::pessimistic(Recommendation::InsufficientDepth);
        }

        let best_bid = book.bids[0].price;
        let best_ask = book.asks[0].price;
        let two = Decimal::from(2);
        let mid_price = (best_bid + best_ask) / two;
        let spread_bps = spread_bps(best_bid, best_ask, mid_price);

        let book_side = match side {
            Side::Buy => &book.asks,
            Side::Sell => &book.bids,
        };
        let sim = simulate_fill(book_side, size_usd);

        if !sim.filled_completely {
            warn!(
                "[LIQUIDITY] insufficient depth for {side} ${size_usd} {symbol}: \
                 only ${:.2} available (shortfall ${:.2})",
                sim.total_cost, sim.remaining_usd
            );
        }

        let (avg_price, slippage_pct) = if sim.total_quantity > Decimal::ZERO {
            let avg = sim.total_cost / sim.total_quantity;
            let expected = match side {
                Side::Buy => best_ask,
                Side::Sell => best_bid,
            };
            (avg, (avg - expected).abs() / expected)
        } else {
            (Decimal::ZERO, Decimal::ONE)
        };

        let score = liquidity_score(sim.filled_completely, slippage_pct, spread_bps);
        let recommendation = self.recommend(sim.filled_completely, slippage_pct, spread_bps);

        if let Some(prices) = &self.prices {
            prices.cache_order_book(venue.name(), symbol, &book, "liquidity_check");
        }

        info!(
            "[LIQUIDITY] {side} ${size_usd} {symbol} on {}: {recommendation} \
             (score {score:.2}, slippage {:.3}%, spread {spread_bps}bps)",
            venue.name(),
            slippage_pct * dec!(100)
        );

        LiquidityReport {
            depth_sufficient: sim.filled_completely,
            expected_slippage_pct: slippage_pct,
            expected_avg_price: avg_price,
            spread_bps,
            liquidity_score: score,
            recommendation,
            required_levels: sim.levels_consumed,
            total_depth_usd: sim.total_cost,
            mid_price,
            best_bid,
            best_ask,
        }
    }

    /// Gate used by pre-flight: depth, slippage, spread and score all pass.
    pub fn is_execution_acceptable(&self, report: &LiquidityReport) -> bool {
        if !report.depth_sufficient {
            return false;
        }
        if report.expected_slippage_pct > self.max_slippage_pct {
            warn!(
                "[LIQUIDITY] slippage {:.3}% exceeds max {:.3}%",
                report.expected_slippage_pct * dec!(100),
                self.max_slippage_pct * dec!(100)
            );
            return false;
        }
        if report.spread_bps > self.max_spread_bps {
            warn!(
                "[LIQUIDITY] spread {}bps exceeds max {}bps",
                report.spread_bps, self.max_spread_bps
            );
            return false;
        }
        if report.liquidity_score < self.min_liquidity_score {
            warn!(
                "[LIQUIDITY] score {:.2} below min {:.2}",
                report.liquidity_score, self.min_liquidity_score
            );
            return false;
        }
        true
    }

    fn recommend(&self, depth: bool, slippage_pct: Decimal, spread_bps: u32) -> Recommendation {
        if !depth {
            return Recommendation::InsufficientDepth;
        }
        if slippage_pct > self.max_slippage_pct {
            return Recommendation::HighSlippageWarning;
        }
        if spread_bps > self.max_spread_bps {
            return Recommendation::WideSpreadWarning;
        }
        if slippage_pct < dec!(0.001) {
            return Recommendation::UseLimit;
        }
        if slippage_pct < dec!(0.005) {
            return Recommendation::UseMarketAcceptable;
        }
        Recommendation::ModerateLiquidity
    }
}

fn spread_bps(best_bid: Decimal, best_ask: Decimal, mid: Decimal) -> u32 {
    if mid <= Decimal::ZERO {
        return 9_999;
    }
    ((best_ask - best_bid) / mid * dec!(10000))
        .trunc()
        .to_u32()
        .unwrap_or(9_999)
}

/// Walk the book accumulating levels until `size_usd` is covered.
fn simulate_fill(book_side: &[BookLevel], size_usd: Decimal) -> FillSimulation {
    let mut remaining_usd = size_usd;
    let mut total_quantity = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    let mut levels_consumed = 0usize;

    for level in book_side {
        let level_usd = level.price * level.size;
        levels_consumed += 1;

        if remaining_usd <= level_usd {
            total_quantity += remaining_usd / level.price;
            total_cost += remaining_usd;
            remaining_usd = Decimal::ZERO;
            break;
        }
        total_quantity += level.size;
        total_cost += level_usd;
        remaining_usd -= level_usd;
    }

    FillSimulation {
        filled_completely: remaining_usd == Decimal::ZERO,
        total_quantity,
        total_cost,
        levels_consumed,
        remaining_usd,
    }
}

/// 50% depth, 30% slippage, 20% spread.
fn liquidity_score(depth_sufficient: bool, slippage_pct: Decimal, spread_bps: u32) -> f64 {
    let depth_score = if depth_sufficient { 1.0 } else { 0.0 };
    let slippage_score = (1.0 - slippage_pct.to_f64().unwrap_or(1.0) * 100.0).max(0.0);
    let spread_score = (1.0 - f64::from(spread_bps) / 100.0).max(0.0);
    depth_score * 0.5 + slippage_score * 0.3 + spread_score * 0.2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: Decimal, size: Decimal) -> BookLevel {
        BookLevel { price, size }
    }

    #[test]
    fn fill_simulation_walks_levels() {
        let side = vec![
            level(dec!(100), dec!(5)),  // $500
            level(dec!(101), dec!(5)),  // $505
            level(dec!(102), dec!(10)), // $1020
        ];
        let sim = simulate_fill(&side, dec!(1000));
        assert!(sim.filled_completely);
        assert_eq!(sim.levels_consumed, 2);
        assert_eq!(sim.total_cost, dec!(1000));
    }

    #[test]
    fn fill_simulation_reports_shortfall() {
        let side = vec![level(dec!(100), dec!(2))]; // $200 available
        let sim = simulate_fill(&side, dec!(1000));
        assert!(!sim.filled_completely);
        assert_eq!(sim.remaining_usd, dec!(800));
    }

    #[test]
    fn perfect_book_scores_full() {
        let score = liquidity_score(true, Decimal::ZERO, 0);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn insufficient_depth_is_never_acceptable() {
        let analyzer = LiquidityAnalyzer::new(dec!(0.005), 50, 0.6, None);
        let report = LiquidityReport::pessimistic(Recommendation::InsufficientDepth);
        assert!(!analyzer.is_execution_acceptable(&report));
    }
}
