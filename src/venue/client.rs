use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::order::Side;

use super::types::{LeverageInfo, OrderBook, OrderInfo, OrderResult, PositionSnapshot};

/// Fill callback: `(order_id, price, incremental_filled, sequence)`.
///
/// Invoked from the venue's websocket task. Must not panic.
pub type FillHook = Arc<dyn Fn(&str, Decimal, Decimal, Option<u64>) + Send + Sync>;

/// Status callback: `(order_id, status, total_filled, price)`.
///
/// `total_filled` is cumulative, not incremental. Must not panic.
pub type StatusHook =
    Arc<dyn Fn(&str, super::types::OrderStatus, Decimal, Option<Decimal>) + Send + Sync>;

/// Uniform capability set one trading venue exposes to the execution core.
///
/// Adapters own all transport concerns (REST pooling, websocket sessions,
/// request signing); the core only sees this trait. `get_order_info` with
/// `force_refresh=false` reads the adapter's websocket cache, which the
/// reconciliation path ranks above REST data.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn name(&self) -> &str;

    /// Map a venue-independent ticker to the venue's contract identifier.
    fn resolve_contract_id(&self, symbol: &str) -> String;

    fn round_to_tick(&self, price: Decimal) -> Decimal;

    fn round_to_step(&self, quantity: Decimal) -> Decimal;

    fn tick_size(&self, symbol: &str) -> Option<Decimal>;

    fn min_order_notional(&self, symbol: &str) -> Option<Decimal>;

    /// Tokens per venue base unit (e.g. 1 kTOKEN unit = 1000 tokens).
    fn quantity_multiplier(&self, _symbol: &str) -> u32 {
        1
    }

    async fn get_bbo(&self, symbol: &str) -> Result<(Decimal, Decimal)>;

    async fn get_order_book(&self, symbol: &str, levels: usize) -> Result<OrderBook>;

    async fn place_limit(
        &self,
        contract_id: &str,
        quantity: Decimal,
        price: Decimal,
        side: Side,
        reduce_only: bool,
    ) -> Result<OrderResult>;

    async fn place_market(
        &self,
        contract_id: &str,
        quantity: Decimal,
        side: Side,
        reduce_only: bool,
    ) -> Result<OrderResult>;

    async fn cancel(&self, order_id: &str) -> Result<OrderResult>;

    /// `force_refresh=false` serves the websocket cache; `true` hits REST.
    async fn get_order_info(&self, order_id: &str, force_refresh: bool)
        -> Result<Option<OrderInfo>>;

    async fn get_position_snapshot(&self, symbol: &str) -> Result<Option<PositionSnapshot>>;

    async fn get_account_balance(&self) -> Result<Option<Decimal>>;

    async fn get_leverage_info(&self, symbol: &str) -> Result<LeverageInfo>;

    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<()>;

    /// Install a fill hook, returning the previous one so callers can
    /// restore it when they are done.
    fn swap_fill_hook(&self, hook: Option<FillHook>) -> Option<FillHook>;

    /// Install a status hook, returning the previous one.
    fn swap_status_hook(&self, hook: Option<StatusHook>) -> Option<StatusHook>;
}
