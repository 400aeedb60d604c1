//! Keyed candle/price cache backing the hub.
//!
//! Key layout: `candles:{symbol}:{interval}` holds a bounded list of closed
//! candles, newest first; `price:{symbol}` holds the latest scalar price.
//! The backend is a trait so reads and writes can fail transiently like an
//! external store; the hub retries around it and degrades to "no data".

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

use crate::error::CacheError;
use crate::types::{candle_key, price_key, Candle, PricePoint};

/// Default retained window per `(symbol, interval)`.
pub const DEFAULT_CANDLE_DEPTH: usize = 200;

/// Storage backend for the market data hub.
#[async_trait]
pub trait CandleCache: Send + Sync {
    /// Connectivity probe. Used by `connect()` and `health_check()`.
    async fn ping(&self) -> Result<(), CacheError>;

    /// Push a closed candle onto the front of its window, trimming to depth.
    async fn store_candle(&self, candle: &Candle) -> Result<(), CacheError>;

    /// Most recent `count` candles, newest first (as stored).
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        count: usize,
    ) -> Result<Vec<Candle>, CacheError>;

    async fn set_price(&self, symbol: &str, point: PricePoint) -> Result<(), CacheError>;

    async fn get_price(&self, symbol: &str) -> Result<Option<PricePoint>, CacheError>;

    /// Idempotent shutdown; subsequent calls fail with `ConnectionClosed`.
    async fn close(&self);
}

struct CacheInner {
    candles: HashMap<String, VecDeque<Candle>>,
    prices: HashMap<String, PricePoint>,
    closed: bool,
}

/// In-process cache with bounded windows per key.
pub struct InMemoryCache {
    inner: RwLock<CacheInner>,
    depth: usize,
}

impl InMemoryCache {
    pub fn new(depth: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                candles: HashMap::new(),
                prices: HashMap::new(),
                closed: false,
            }),
            depth,
        }
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CANDLE_DEPTH)
    }
}

#[async_trait]
impl CandleCache for InMemoryCache {
    async fn ping(&self) -> Result<(), CacheError> {
        if self.inner.read().await.closed {
            return Err(CacheError::ConnectionClosed);
        }
        Ok(())
    }

    async fn store_candle(&self, candle: &Candle) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(CacheError::ConnectionClosed);
        }

        let key = candle_key(&candle.symbol, &candle.interval);
        let window = inner.candles.entry(key).or_default();

        // Replace in place when the same bar is delivered twice after a
        // reconnect replay.
        if let Some(front) = window.front_mut() {
            if front.open_time == candle.open_time {
                *front = candle.clone();
                return Ok(());
            }
        }

        window.push_front(candle.clone());
        while window.len() > self.depth {
            window.pop_back();
        }
        Ok(())
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        count: usize,
    ) -> Result<Vec<Candle>, CacheError> {
        let inner = self.inner.read().await;
        if inner.closed {
            return Err(CacheError::ConnectionClosed);
        }

        let key = candle_key(symbol, interval);
        Ok(inner
            .candles
            .get(&key)
            .map(|w| w.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }

    async fn set_price(&self, symbol: &str, point: PricePoint) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(CacheError::ConnectionClosed);
        }
        inner.prices.insert(price_key(symbol), point);
        Ok(())
    }

    async fn get_price(&self, symbol: &str) -> Result<Option<PricePoint>, CacheError> {
        let inner = self.inner.read().await;
        if inner.closed {
            return Err(CacheError::ConnectionClosed);
        }
        Ok(inner.prices.get(&price_key(symbol)).copied())
    }

    async fn close(&self) {
        self.inner.write().await.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            interval: "1m".to_string(),
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            is_closed: true,
        }
    }

    #[tokio::test]
    async fn test_window_is_bounded_and_newest_first() {
        let cache = InMemoryCache::new(3);

        for i in 0..5 {
            cache.store_candle(&candle(i * 60_000, 100.0 + i as f64)).await.unwrap();
        }

        let window = cache.get_candles("BTCUSDT", "1m", 10).await.unwrap();
        assert_eq!(window.len(), 3);
        // Newest first
        assert_eq!(window[0].open_time, 4 * 60_000);
        assert_eq!(window[2].open_time, 2 * 60_000);
    }

    #[tokio::test]
    async fn test_duplicate_open_time_replaces_front() {
        let cache = InMemoryCache::new(10);

        cache.store_candle(&candle(0, 100.0)).await.unwrap();
        cache.store_candle(&candle(0, 101.0)).await.unwrap();

        let window = cache.get_candles("BTCUSDT", "1m", 10).await.unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].close, 101.0);
    }

    #[tokio::test]
    async fn test_empty_key_returns_empty() {
        let cache = InMemoryCache::default();
        let window = cache.get_candles("ETHUSDT", "5m", 50).await.unwrap();
        assert!(window.is_empty());
        assert!(cache.get_price("ETHUSDT").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_cache_errors() {
        let cache = InMemoryCache::default();
        cache.close().await;

        assert!(cache.ping().await.is_err());
        assert!(cache.get_candles("BTCUSDT", "1m", 1).await.is_err());
        assert!(cache.store_candle(&candle(0, 1.0)).await.is_err());
    }
}
