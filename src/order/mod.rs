/// Order specifications, per-leg reports, and live per-leg state.

pub mod context;

pub use context::{CancelSignal, OrderContext};

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::venue::VenueClient;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// Get opposite side (for hedging and position closes)
    #[inline]
    pub const fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single leg should be worked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    LimitOnly,
    LimitWithFallback,
    MarketOnly,
    /// Currently equivalent to `LimitWithFallback`.
    Adaptive,
}

/// Immutable specification for one leg of an atomic batch.
#[derive(Clone)]
pub struct OrderSpec {
    pub venue: Arc<dyn VenueClient>,
    pub symbol: String,
    pub side: Side,
    pub size_usd: Decimal,
    /// Explicit base quantity; derived from `size_usd / reference price`
    /// when absent.
    pub quantity: Option<Decimal>,
    pub execution_mode: ExecutionMode,
    pub timeout: Duration,
    /// Maker price improvement as a fraction (e.g. 0.0001 = 1 bp).
    pub limit_price_offset_pct: Option<Decimal>,
    /// Closing leg: may only reduce an existing position.
    pub reduce_only: bool,
}

impl OrderSpec {
    pub fn venue_name(&self) -> String {
        self.venue.name().to_uppercase()
    }
}

impl std::fmt::Debug for OrderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderSpec")
            .field("venue", &self.venue.name())
            .field("symbol", &self.symbol)
            .field("side", &self.side)
            .field("size_usd", &self.size_usd)
            .field("quantity", &self.quantity)
            .field("execution_mode", &self.execution_mode)
            .field("timeout", &self.timeout)
            .field("reduce_only", &self.reduce_only)
            .finish()
    }
}

/// Per-order fill attribution inside an [`OrderReport`].
///
/// `quantity` is the order's cumulative fill total, not an increment, so
/// replays and websocket races reconcile instead of double counting.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: Option<String>,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

/// Normalized outcome of one order attempt (or one leg task).
#[derive(Debug, Clone, Default)]
pub struct OrderReport {
    pub success: bool,
    pub filled: bool,
    pub fill_price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub slippage_usd: Decimal,
    pub execution_mode_used: String,
    pub order_id: Option<String>,
    pub error: Option<String>,
    /// True when the failure should be re-placed with fresh BBO.
    pub retryable: bool,
    /// True when this report came out of the hedge path.
    pub hedge: bool,
    pub execution_time_ms: u64,
    /// Populated only for reports spanning multiple orders (fallback
    /// merges); single-order reports derive one entry on demand.
    pub fills: Vec<OrderFill>,
}

impl OrderReport {
    pub fn failure(mode: &str, error: impl Into<String>) -> Self {
        Self {
            execution_mode_used: mode.to_string(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Per-order fill entries for ledger reconciliation.
    pub fn fill_entries(&self) -> Vec<OrderFill> {
        if !self.fills.is_empty() {
            return self.fills.clone();
        }
        if self.filled_quantity > Decimal::ZERO {
            return vec![OrderFill {
                order_id: self.order_id.clone(),
                quantity: self.filled_quantity,
                price: self.fill_price,
            }];
        }
        Vec::new()
    }
}
