use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle states a venue reports for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// True when no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acknowledgement returned by place/cancel calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    /// Fill size known at acknowledgement time (cancel acks may carry it).
    pub filled_size: Option<Decimal>,
    pub price: Option<Decimal>,
    pub error_message: Option<String>,
}

impl OrderResult {
    pub fn accepted(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            filled_size: None,
            price: None,
            error_message: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            filled_size: None,
            price: None,
            error_message: Some(message.into()),
        }
    }
}

/// Point-in-time view of one order as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: String,
    pub status: OrderStatus,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub remaining_size: Decimal,
    pub price: Option<Decimal>,
    pub cancel_reason: Option<String>,
}

/// Signed position snapshot for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Positive = long, negative = short, zero = flat.
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
    pub exposure_usd: Option<Decimal>,
    /// "long" / "short" when the venue reports it explicitly.
    pub side: Option<String>,
}

/// Leverage limits a venue enforces for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeverageInfo {
    pub max_leverage: Option<Decimal>,
    pub max_notional: Option<Decimal>,
    /// e.g. 0.20 = 20% initial margin = 5x effective leverage.
    pub margin_requirement: Option<Decimal>,
}

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Depth snapshot, best levels first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// How to react to a venue-side cancellation reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDisposition {
    /// Re-place with fresh BBO (post-only violation, expiry).
    Retryable,
    /// Venue slippage protection fired; market-fallback the remainder.
    SlippageFallback,
    /// Anything else is fatal for the attempt.
    Fatal,
}

const RETRYABLE_REASONS: &[&str] = &["post_only", "post-only", "gtx", "expired", "did_not_remain_open"];

const SLIPPAGE_REASONS: &[&str] = &[
    "exceeds_max_slippage",
    "max_slippage",
    "slippage",
    "insufficient_liquidity",
    "price_impact_too_high",
];

/// Classify a venue cancellation reason (case-insensitive substring match).
pub fn classify_cancel_reason(reason: &str) -> CancelDisposition {
    let lower = reason.to_lowercase();
    if RETRYABLE_REASONS.iter().any(|kw| lower.contains(kw)) {
        return CancelDisposition::Retryable;
    }
    if SLIPPAGE_REASONS.iter().any(|kw| lower.contains(kw)) {
        return CancelDisposition::SlippageFallback;
    }
    CancelDisposition::Fatal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reason_taxonomy() {
        assert_eq!(classify_cancel_reason("POST_ONLY"), CancelDisposition::Retryable);
        assert_eq!(classify_cancel_reason("gtx rejected"), CancelDisposition::Retryable);
        assert_eq!(classify_cancel_reason("order expired"), CancelDisposition::Retryable);
        assert_eq!(
            classify_cancel_reason("EXCEEDS_MAX_SLIPPAGE"),
            CancelDisposition::SlippageFallback
        );
        assert_eq!(
            classify_cancel_reason("insufficient_liquidity"),
            CancelDisposition::SlippageFallback
        );
        assert_eq!(classify_cancel_reason("user_cancelled"), CancelDisposition::Fatal);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(!OrderStatus::Open.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
