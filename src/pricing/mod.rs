/// Price retrieval and hedge price computation.

pub mod hedge_price;
pub mod provider;

pub use hedge_price::{aligned_entry_prices, AlignedPrices, HedgePrice, HedgePricer, PricingStrategy};
pub use provider::{PriceData, PriceProvider};
