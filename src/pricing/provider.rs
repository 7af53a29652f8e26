use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::venue::{OrderBook, VenueClient};

/// Cached top-of-book with provenance.
#[derive(Debug, Clone)]
pub struct PriceData {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub mid_price: Decimal,
    pub fetched_at: Instant,
    /// "rest_api", "liquidity_check", ...
    pub source: &'static str,
}

impl PriceData {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    fn is_valid(&self, max_age: Duration) -> bool {
        self.age() < max_age
    }
}

/// Cache-first BBO provider with time-based invalidation.
///
/// Order book pulls made during liquidity checks are cached here, so order
/// placement moments later reuses them instead of hitting the venue again.
pub struct PriceProvider {
    cache: Mutex<HashMap<String, PriceData>>,
    default_ttl: Duration,
}

impl PriceProvider {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn cache_key(venue: &str, symbol: &str) -> String {
        format!("{venue}:{symbol}")
    }

    /// Best bid/ask from cache if fresh, otherwise from the venue's book
    /// (top level), caching the result.
    pub async fn get_bbo_prices(
        &self,
        venue: &Arc<dyn VenueClient>,
        symbol: &str,
        max_age: Option<Duration>,
    ) -> Result<(Decimal, Decimal)> {
        let key = Self::cache_key(venue.name(), symbol);
        let max_age = max_age.unwrap_or(self.default_ttl);

        if let Some(cached) = self.get_cached(&key, max_age) {
            debug!(
                "[PRICE] cached BBO for {key} (age {:.2}s, source {})",
                cached.age().as_secs_f64(),
                cached.source
            );
            return Ok((cached.best_bid, cached.best_ask));
        }

        let (best_bid, best_ask) = venue.get_bbo(symbol).await?;
        if best_bid <= Decimal::ZERO || best_ask <= Decimal::ZERO {
            bail!("empty book for {}:{symbol}: bid={best_bid} ask={best_ask}", venue.name());
        }

        self.store(&key, best_bid, best_ask, "rest_api");
        debug!("[PRICE] fresh BBO for {key}: bid={best_bid} ask={best_ask}");
        Ok((best_bid, best_ask))
    }

    /// Cache a book fetched elsewhere (the liquidity analyzer calls this).
    pub fn cache_order_book(&self, venue_name: &str, symbol: &str, book: &OrderBook, source: &'static str) {
        let (Some(best_bid), Some(best_ask)) = (book.best_bid(), book.best_ask()) else {
            warn!("[PRICE] refusing to cache empty book for {venue_name}:{symbol}");
            return;
        };
        let key = Self::cache_key(venue_name, symbol);
        self.store(&key, best_bid, best_ask, source);
    }

    /// Drop a cached entry (after a large fill the book is stale).
    pub fn invalidate(&self, venue_name: &str, symbol: &str) {
        let key = Self::cache_key(venue_name, symbol);
        self.cache.lock().remove(&key);
    }

    fn get_cached(&self, key: &str, max_age: Duration) -> Option<PriceData> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(data) if data.is_valid(max_age) => Some(data.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, best_bid: Decimal, best_ask: Decimal, source: &'static str) {
        let two = Decimal::from(2);
        self.cache.lock().insert(
            key.to_string(),
            PriceData {
                best_bid,
                best_ask,
                mid_price: (best_bid + best_ask) / two,
                fetched_at: Instant::now(),
                source,
            },
        );
    }
}

impl Default for PriceProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::BookLevel;
    use rust_decimal_macros::dec;

    fn book(bid: Decimal, ask: Decimal) -> OrderBook {
        OrderBook {
            bids: vec![BookLevel { price: bid, size: dec!(1) }],
            asks: vec![BookLevel { price: ask, size: dec!(1) }],
        }
    }

    #[test]
    fn cached_book_round_trips() {
        let provider = PriceProvider::default();
        provider.cache_order_book("venue-a", "BTC", &book(dec!(99), dec!(101)), "liquidity_check");
        let cached = provider
            .get_cached(&PriceProvider::cache_key("venue-a", "BTC"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(cached.best_bid, dec!(99));
        assert_eq!(cached.mid_price, dec!(100));
    }

    #[test]
    fn invalidate_drops_entry() {
        let provider = PriceProvider::default();
        provider.cache_order_book("venue-a", "BTC", &book(dec!(99), dec!(101)), "liquidity_check");
        provider.invalidate("venue-a", "BTC");
        assert!(provider
            .get_cached(&PriceProvider::cache_key("venue-a", "BTC"), Duration::from_secs(5))
            .is_none());
    }

    #[test]
    fn empty_book_is_not_cached() {
        let provider = PriceProvider::default();
        provider.cache_order_book("venue-a", "BTC", &OrderBook::default(), "liquidity_check");
        assert!(provider
            .get_cached(&PriceProvider::cache_key("venue-a", "BTC"), Duration::from_secs(5))
            .is_none());
    }
}
