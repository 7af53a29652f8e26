//! Scripted venue for exercising the execution engine without a network.
//!
//! Each placement consumes the next [`OrderScript`] from the venue's queue
//! (limit and market queues are separate) and plays it out on the tokio
//! clock, emitting the same fill/status callbacks a live adapter would.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use crate::order::Side;
use crate::venue::{
    BookLevel, FillHook, LeverageInfo, OrderBook, OrderInfo, OrderResult, OrderStatus,
    PositionSnapshot, StatusHook, VenueClient,
};

/// Scripted behavior for one placed order.
#[derive(Debug, Clone)]
pub enum OrderScript {
    /// Fill the whole order after `delay` (at `price`, or the order price).
    FillAfter {
        delay: Duration,
        price: Option<Decimal>,
    },
    /// Fill `quantity` after `delay`, then leave the order open.
    PartialFillAfter {
        quantity: Decimal,
        delay: Duration,
    },
    /// Fill `quantity` after `delay`, then cancel with `reason`.
    PartialThenCancel {
        quantity: Decimal,
        delay: Duration,
        reason: String,
    },
    /// Cancel with zero fills after `delay`.
    CancelAfter {
        delay: Duration,
        reason: String,
    },
    /// Leave the order resting until someone cancels it.
    StayOpen,
    /// Refuse the placement outright.
    FailPlacement {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementKind {
    Limit,
    Market,
}

/// One recorded placement, for assertions.
#[derive(Debug, Clone)]
pub struct PlacementRecord {
    pub kind: PlacementKind,
    pub contract_id: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    pub order_id: String,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct PositionState {
    quantity: Decimal,
    entry_price: Decimal,
}

pub struct MockVenueBuilder {
    name: String,
    multiplier: u32,
    tick: Decimal,
    step: Decimal,
    min_notional: Option<Decimal>,
    balance: Option<Decimal>,
    leverage: LeverageInfo,
    best_bid: Decimal,
    best_ask: Decimal,
    level_size: Decimal,
}

impl MockVenueBuilder {
    pub fn multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn tick_size(mut self, tick: Decimal) -> Self {
        self.tick = tick;
        self
    }

    pub fn step_size(mut self, step: Decimal) -> Self {
        self.step = step;
        self
    }

    pub fn min_notional(mut self, min_notional: Decimal) -> Self {
        self.min_notional = Some(min_notional);
        self
    }

    pub fn balance(mut self, balance: Decimal) -> Self {
        self.balance = Some(balance);
        self
    }

    pub fn leverage(mut self, info: LeverageInfo) -> Self {
        self.leverage = info;
        self
    }

    pub fn book(mut self, best_bid: Decimal, best_ask: Decimal) -> Self {
        self.best_bid = best_bid;
        self.best_ask = best_ask;
        self
    }

    pub fn level_size(mut self, level_size: Decimal) -> Self {
        self.level_size = level_size;
        self
    }

    pub fn build(self) -> Arc<MockVenue> {
        Arc::new_cyclic(|weak| MockVenue {
            self_ref: weak.clone(),
            name: self.name,
            multiplier: self.multiplier,
            tick: self.tick,
            step: self.step,
            min_notional: self.min_notional,
            balance: Mutex::new(self.balance),
            leverage: Mutex::new(self.leverage),
            leverage_set: Mutex::new(Vec::new()),
            book: Mutex::new((self.best_bid, self.best_ask)),
            level_size: self.level_size,
            limit_scripts: Mutex::new(VecDeque::new()),
            market_scripts: Mutex::new(VecDeque::new()),
            orders: Mutex::new(HashMap::new()),
            order_sides: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            placements: Mutex::new(Vec::new()),
            fill_hook: Mutex::new(None),
            status_hook: Mutex::new(None),
            spoof_rest_on_cancel: AtomicBool::new(false),
            rest_overrides: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }
}

/// Scripted in-memory venue implementing the full client capability set.
pub struct MockVenue {
    self_ref: Weak<MockVenue>,
    name: String,
    multiplier: u32,
    tick: Decimal,
    step: Decimal,
    min_notional: Option<Decimal>,
    balance: Mutex<Option<Decimal>>,
    leverage: Mutex<LeverageInfo>,
    leverage_set: Mutex<Vec<(String, Decimal)>>,
    book: Mutex<(Decimal, Decimal)>,
    level_size: Decimal,
    limit_scripts: Mutex<VecDeque<OrderScript>>,
    market_scripts: Mutex<VecDeque<OrderScript>>,
    /// The venue's "websocket cache" of order state.
    orders: Mutex<HashMap<String, OrderInfo>>,
    order_sides: Mutex<HashMap<String, (String, Side, bool)>>,
    positions: Mutex<HashMap<String, PositionState>>,
    placements: Mutex<Vec<PlacementRecord>>,
    fill_hook: Mutex<Option<FillHook>>,
    status_hook: Mutex<Option<StatusHook>>,
    /// When set, force-refreshed reads of a cancelled order report
    /// `filled = size − remaining` (the spoofed-fill venue bug).
    spoof_rest_on_cancel: AtomicBool,
    /// Scripted REST responses served only on `force_refresh=true`.
    rest_overrides: Mutex<HashMap<String, OrderInfo>>,
    next_id: AtomicU64,
}

impl MockVenue {
    pub fn builder(name: impl Into<String>) -> MockVenueBuilder {
        MockVenueBuilder {
            name: name.into(),
            multiplier: 1,
            tick: dec!(0.01),
            step: dec!(0.0001),
            min_notional: None,
            balance: Some(dec!(1000000)),
            leverage: LeverageInfo {
                max_leverage: Some(dec!(20)),
                max_notional: None,
                margin_requirement: Some(dec!(0.05)),
            },
            best_bid: dec!(49999),
            best_ask: dec!(50001),
            level_size: dec!(1000),
        }
    }

    // ------------------------------------------------------------------
    // Test controls
    // ------------------------------------------------------------------

    pub fn script_limit(&self, script: OrderScript) {
        self.limit_scripts.lock().push_back(script);
    }

    pub fn script_market(&self, script: OrderScript) {
        self.market_scripts.lock().push_back(script);
    }

    pub fn set_book(&self, best_bid: Decimal, best_ask: Decimal) {
        *self.book.lock() = (best_bid, best_ask);
    }

    pub fn set_balance(&self, balance: Option<Decimal>) {
        *self.balance.lock() = balance;
    }

    pub fn set_position(&self, symbol: &str, quantity: Decimal, entry_price: Decimal) {
        self.positions.lock().insert(
            self.position_key(symbol),
            PositionState {
                quantity,
                entry_price,
            },
        );
    }

    pub fn position(&self, symbol: &str) -> Decimal {
        self.positions
            .lock()
            .get(&self.position_key(symbol))
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Positions are keyed by contract id; fills come in with the contract
    /// id while snapshot queries use the plain symbol.
    fn position_key(&self, symbol: &str) -> String {
        if symbol.ends_with("-PERP") {
            symbol.to_string()
        } else {
            self.resolve_contract_id(symbol)
        }
    }

    pub fn placements(&self) -> Vec<PlacementRecord> {
        self.placements.lock().clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, Decimal)> {
        self.leverage_set.lock().clone()
    }

    pub fn has_fill_hook(&self) -> bool {
        self.fill_hook.lock().is_some()
    }

    pub fn has_status_hook(&self) -> bool {
        self.status_hook.lock().is_some()
    }

    /// Enable the `filled = size − remaining` REST artifact for cancelled
    /// orders.
    pub fn spoof_rest_fills_on_cancel(&self) {
        self.spoof_rest_on_cancel.store(true, Ordering::Release);
    }

    /// Serve a scripted response for one order on force-refreshed reads.
    pub fn set_rest_override(&self, order_id: &str, info: OrderInfo) {
        self.rest_overrides.lock().insert(order_id.to_string(), info);
    }

    /// Current websocket-cache view of an order.
    pub fn order_info_cached(&self, order_id: &str) -> Option<OrderInfo> {
        self.orders.lock().get(order_id).cloned()
    }

    /// Mutate the cached order state directly (simulates a lagging or
    /// inconsistent venue cache).
    pub fn override_cached_order(&self, order_id: &str, info: OrderInfo) {
        self.orders.lock().insert(order_id.to_string(), info);
    }

    /// Emit a fill callback as the venue's websocket task would.
    pub fn emit_fill(&self, order_id: &str, price: Decimal, incremental: Decimal) {
        let hook = self.fill_hook.lock().clone();
        if let Some(hook) = hook {
            hook(order_id, price, incremental, None);
        }
    }

    /// Emit a status callback as the venue's websocket task would.
    pub fn emit_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        total_filled: Decimal,
        price: Option<Decimal>,
    ) {
        let hook = self.status_hook.lock().clone();
        if let Some(hook) = hook {
            hook(order_id, status, total_filled, price);
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn new_order_id(&self) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}-{}", self.name, Uuid::new_v4().simple())
    }

    fn touch_price(&self, side: Side) -> Decimal {
        let (bid, ask) = *self.book.lock();
        match side {
            Side::Buy => ask,
            Side::Sell => bid,
        }
    }

    fn apply_position_fill(&self, symbol: &str, side: Side, quantity: Decimal, price: Decimal) {
        let mut positions = self.positions.lock();
        let entry = positions.entry(symbol.to_string()).or_default();
        let signed = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };
        if entry.quantity == Decimal::ZERO && signed != Decimal::ZERO {
            entry.entry_price = price;
        }
        entry.quantity += signed;
    }

    /// Apply a fill to the ledger and fire hooks, venue-style: incremental
    /// fill callback first, then a status callback with the new total.
    fn settle_fill(&self, order_id: &str, quantity: Decimal, price: Decimal) {
        let (symbol, side, status, total) = {
            let mut orders = self.orders.lock();
            let Some(info) = orders.get_mut(order_id) else { return };
            if info.status.is_terminal() {
                return;
            }
            info.filled_size += quantity;
            info.remaining_size = (info.size - info.filled_size).max(Decimal::ZERO);
            info.price = Some(price);
            info.status = if info.remaining_size <= Decimal::ZERO {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            let sides = self.order_sides.lock();
            let (symbol, side, _) = sides.get(order_id).cloned().unwrap_or_else(|| {
                ("?".to_string(), Side::Buy, false)
            });
            (symbol, side, info.status, info.filled_size)
        };

        self.apply_position_fill(&symbol, side, quantity, price);
        self.emit_fill(order_id, price, quantity);
        if status == OrderStatus::Filled {
            self.emit_status(order_id, OrderStatus::Filled, total, Some(price));
        }
    }

    fn settle_cancel(&self, order_id: &str, reason: &str) {
        let total = {
            let mut orders = self.orders.lock();
            let Some(info) = orders.get_mut(order_id) else { return };
            if info.status.is_terminal() {
                return;
            }
            info.status = OrderStatus::Canceled;
            info.cancel_reason = Some(reason.to_string());
            info.filled_size
        };
        self.emit_status(order_id, OrderStatus::Canceled, total, None);
    }

    fn run_script(&self, order_id: String, script: OrderScript, fallback_price: Decimal) {
        let venue = self.self_ref.upgrade().expect("venue dropped mid-script");
        tokio::spawn(async move {
            match script {
                OrderScript::FillAfter { delay, price } => {
                    tokio::time::sleep(delay).await;
                    let remaining = venue
                        .orders
                        .lock()
                        .get(&order_id)
                        .map(|o| o.remaining_size)
                        .unwrap_or(Decimal::ZERO);
                    if remaining > Decimal::ZERO {
                        venue.settle_fill(&order_id, remaining, price.unwrap_or(fallback_price));
                    }
                }
                OrderScript::PartialFillAfter { quantity, delay } => {
                    tokio::time::sleep(delay).await;
                    venue.settle_fill(&order_id, quantity, fallback_price);
                }
                OrderScript::PartialThenCancel {
                    quantity,
                    delay,
                    reason,
                } => {
                    tokio::time::sleep(delay).await;
                    venue.settle_fill(&order_id, quantity, fallback_price);
                    venue.settle_cancel(&order_id, &reason);
                }
                OrderScript::CancelAfter { delay, reason } => {
                    tokio::time::sleep(delay).await;
                    venue.settle_cancel(&order_id, &reason);
                }
                OrderScript::StayOpen | OrderScript::FailPlacement { .. } => {}
            }
        });
    }

    fn place(
        &self,
        kind: PlacementKind,
        contract_id: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        side: Side,
        reduce_only: bool,
        script: OrderScript,
    ) -> OrderResult {
        if let OrderScript::FailPlacement { reason } = &script {
            return OrderResult::refused(reason.clone());
        }

        let order_id = self.new_order_id();
        let effective_price = price.unwrap_or_else(|| self.touch_price(side));

        self.orders.lock().insert(
            order_id.clone(),
            OrderInfo {
                order_id: order_id.clone(),
                status: OrderStatus::Open,
                size: quantity,
                filled_size: Decimal::ZERO,
                remaining_size: quantity,
                price: Some(effective_price),
                cancel_reason: None,
            },
        );
        self.order_sides.lock().insert(
            order_id.clone(),
            (contract_id.to_string(), side, reduce_only),
        );
        self.placements.lock().push(PlacementRecord {
            kind,
            contract_id: contract_id.to_string(),
            side,
            quantity,
            price,
            reduce_only,
            order_id: order_id.clone(),
            placed_at: Utc::now(),
        });

        self.run_script(order_id.clone(), script, effective_price);
        OrderResult::accepted(order_id)
    }
}

#[async_trait]
impl VenueClient for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_contract_id(&self, symbol: &str) -> String {
        format!("{}-PERP", symbol)
    }

    fn round_to_tick(&self, price: Decimal) -> Decimal {
        if self.tick <= Decimal::ZERO {
            return price;
        }
        (price / self.tick).floor() * self.tick
    }

    fn round_to_step(&self, quantity: Decimal) -> Decimal {
        if self.step <= Decimal::ZERO {
            return quantity;
        }
        (quantity / self.step).floor() * self.step
    }

    fn tick_size(&self, _symbol: &str) -> Option<Decimal> {
        Some(self.tick)
    }

    fn min_order_notional(&self, _symbol: &str) -> Option<Decimal> {
        self.min_notional
    }

    fn quantity_multiplier(&self, _symbol: &str) -> u32 {
        self.multiplier
    }

    async fn get_bbo(&self, _symbol: &str) -> Result<(Decimal, Decimal)> {
        Ok(*self.book.lock())
    }

    async fn get_order_book(&self, _symbol: &str, levels: usize) -> Result<OrderBook> {
        let (bid, ask) = *self.book.lock();
        let mut book = OrderBook::default();
        for i in 0..levels.max(1) {
            let offset = self.tick * Decimal::from(i as u32);
            book.bids.push(BookLevel {
                price: bid - offset,
                size: self.level_size,
            });
            book.asks.push(BookLevel {
                price: ask + offset,
                size: self.level_size,
            });
        }
        Ok(book)
    }

    async fn place_limit(
        &self,
        contract_id: &str,
        quantity: Decimal,
        price: Decimal,
        side: Side,
        reduce_only: bool,
    ) -> Result<OrderResult> {
        let script = self
            .limit_scripts
            .lock()
            .pop_front()
            .unwrap_or(OrderScript::StayOpen);
        Ok(self.place(
            PlacementKind::Limit,
            contract_id,
            quantity,
            Some(price),
            side,
            reduce_only,
            script,
        ))
    }

    async fn place_market(
        &self,
        contract_id: &str,
        quantity: Decimal,
        side: Side,
        reduce_only: bool,
    ) -> Result<OrderResult> {
        let script = self
            .market_scripts
            .lock()
            .pop_front()
            .unwrap_or(OrderScript::FillAfter {
                delay: Duration::from_millis(0),
                price: None,
            });
        Ok(self.place(
            PlacementKind::Market,
            contract_id,
            quantity,
            None,
            side,
            reduce_only,
            script,
        ))
    }

    async fn cancel(&self, order_id: &str) -> Result<OrderResult> {
        let (filled, price) = {
            let orders = self.orders.lock();
            match orders.get(order_id) {
                Some(info) => (info.filled_size, info.price),
                None => (Decimal::ZERO, None),
            }
        };
        self.settle_cancel(order_id, "cancelled_by_user");
        Ok(OrderResult {
            success: true,
            order_id: Some(order_id.to_string()),
            filled_size: Some(filled),
            price,
            error_message: None,
        })
    }

    async fn get_order_info(&self, order_id: &str, force_refresh: bool) -> Result<Option<OrderInfo>> {
        if force_refresh {
            if let Some(info) = self.rest_overrides.lock().get(order_id).cloned() {
                return Ok(Some(info));
            }
        }

        let info = self.orders.lock().get(order_id).cloned();
        let Some(mut info) = info else { return Ok(None) };

        if force_refresh
            && info.status == OrderStatus::Canceled
            && self.spoof_rest_on_cancel.load(Ordering::Acquire)
        {
            // The venue bug: REST derives fills from remaining, reporting a
            // full fill for a cancelled-but-never-filled order.
            info.filled_size = info.size;
            info.remaining_size = Decimal::ZERO;
        }
        Ok(Some(info))
    }

    async fn get_position_snapshot(&self, symbol: &str) -> Result<Option<PositionSnapshot>> {
        let key = self.position_key(symbol);
        let positions = self.positions.lock();
        Ok(positions.get(&key).map(|p| PositionSnapshot {
            quantity: p.quantity,
            entry_price: Some(p.entry_price),
            exposure_usd: Some(p.quantity.abs() * p.entry_price),
            side: Some(if p.quantity >= Decimal::ZERO {
                "long".to_string()
            } else {
                "short".to_string()
            }),
        }))
    }

    async fn get_account_balance(&self) -> Result<Option<Decimal>> {
        Ok(*self.balance.lock())
    }

    async fn get_leverage_info(&self, _symbol: &str) -> Result<LeverageInfo> {
        Ok(self.leverage.lock().clone())
    }

    async fn set_leverage(&self, symbol: &str, leverage: Decimal) -> Result<()> {
        self.leverage_set.lock().push((symbol.to_string(), leverage));
        Ok(())
    }

    fn swap_fill_hook(&self, hook: Option<FillHook>) -> Option<FillHook> {
        let mut slot = self.fill_hook.lock();
        std::mem::replace(&mut *slot, hook)
    }

    fn swap_status_hook(&self, hook: Option<StatusHook>) -> Option<StatusHook> {
        let mut slot = self.status_hook.lock();
        std::mem::replace(&mut *slot, hook)
    }
}
