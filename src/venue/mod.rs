/// Venue abstraction — the only surface the execution core talks to.

pub mod client;
pub mod types;

pub use client::{FillHook, StatusHook, VenueClient};
pub use types::{
    classify_cancel_reason, BookLevel, CancelDisposition, LeverageInfo, OrderBook, OrderInfo,
    OrderResult, OrderStatus, PositionSnapshot,
};
