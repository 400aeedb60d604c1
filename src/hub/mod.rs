//! Market Data Hub.
//!
//! Owns the exchange WebSocket connection and the keyed candle/price cache.
//! Many agents read concurrently; only the hub's own stream loop writes.
//! Every read degrades to "no data" instead of propagating transient
//! failures - callers treat an empty result as "skip this cycle".

pub mod backoff;
pub mod cache;
pub mod stream;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::HubError;
use crate::types::Candle;
use backoff::ExponentialBackoff;
use cache::{CandleCache, InMemoryCache};

pub use cache::DEFAULT_CANDLE_DEPTH;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Exchange WebSocket base URL, e.g. `wss://stream.binance.com:9443`.
    pub ws_base_url: String,
    /// Retained candles per `(symbol, interval)`.
    pub candle_depth: usize,
    /// Connection attempts before `connect()` gives up.
    pub max_connect_attempts: u32,
    /// Read attempts against the cache before degrading to empty.
    pub read_retries: u32,
    /// Delay between cache read retries.
    pub read_retry_delay: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "wss://stream.binance.com:9443".to_string(),
            candle_depth: DEFAULT_CANDLE_DEPTH,
            max_connect_attempts: 5,
            read_retries: 3,
            read_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Snapshot reported by `health_check()`. Never fails.
#[derive(Debug, Clone)]
pub struct HubHealth {
    pub stream_connected: bool,
    pub cache_connected: bool,
    pub active_symbols: Vec<String>,
}

/// Retry an async operation with exponential backoff, up to `max_attempts`.
/// Returns the last error alongside the attempt count when the budget is
/// exhausted.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    max_attempts: u32,
    backoff: &mut ExponentialBackoff,
    mut op: F,
) -> Result<T, (u32, E)>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err((attempts, e));
                }
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    attempt = attempts,
                    delay_secs = delay.as_secs_f64(),
                    "Connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// The shared market data hub.
pub struct MarketDataHub {
    config: HubConfig,
    cache: Arc<dyn CandleCache>,
    stream_connected: Arc<AtomicBool>,
    subs_tx: watch::Sender<Vec<(String, String)>>,
    shutdown_tx: watch::Sender<bool>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MarketDataHub {
    pub fn new(config: HubConfig) -> Self {
        let cache: Arc<dyn CandleCache> = Arc::new(InMemoryCache::new(config.candle_depth));
        Self::with_cache(config, cache)
    }

    /// Construct against an explicit cache backend.
    pub fn with_cache(config: HubConfig, cache: Arc<dyn CandleCache>) -> Self {
        let (subs_tx, _) = watch::channel(Vec::new());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            cache,
            stream_connected: Arc::new(AtomicBool::new(false)),
            subs_tx,
            shutdown_tx,
            stream_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Establish the cache connection, probe the stream endpoint, and spawn
    /// the consumption loop. Retries with backoff; exhausting the budget
    /// yields `HubError::Connection`.
    pub async fn connect(&self) -> Result<(), HubError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }

        let mut backoff = ExponentialBackoff::default();
        let cache = self.cache.clone();
        let probe_url = format!("{}/ws", self.config.ws_base_url);

        retry_with_backoff(self.config.max_connect_attempts, &mut backoff, || {
            let cache = cache.clone();
            let probe_url = probe_url.clone();
            async move {
                cache.ping().await.map_err(|e| e.to_string())?;
                let (stream, _) = tokio::time::timeout(
                    Duration::from_secs(30),
                    tokio_tungstenite::connect_async(&probe_url),
                )
                .await
                .map_err(|_| "connection timeout".to_string())?
                .map_err(|e| e.to_string())?;
                drop(stream);
                Ok::<(), String>(())
            }
        })
        .await
        .map_err(|(attempts, reason)| HubError::Connection { attempts, reason })?;

        self.spawn_stream_task().await;
        info!("Market data hub connected");
        Ok(())
    }

    async fn spawn_stream_task(&self) {
        let mut guard = self.stream_task.lock().await;
        if guard.is_some() {
            return;
        }
        let handle = tokio::spawn(stream::run_stream(
            self.config.ws_base_url.clone(),
            self.cache.clone(),
            self.stream_connected.clone(),
            self.shutdown_tx.subscribe(),
            self.subs_tx.subscribe(),
        ));
        *guard = Some(handle);
    }

    /// Idempotent: registers a kline stream for `(symbol, interval)`.
    /// Already-subscribed pairs are a no-op.
    pub fn subscribe(&self, symbol: &str, interval: &str) {
        let pair = (symbol.to_string(), interval.to_string());
        self.subs_tx.send_if_modified(|subs| {
            if subs.contains(&pair) {
                false
            } else {
                info!(symbol = %pair.0, interval = %pair.1, "Subscribing to kline stream");
                subs.push(pair.clone());
                true
            }
        });
    }

    /// Most recent `count` candles, oldest first. Empty when no data yet or
    /// when the cache stays unavailable past the retry budget.
    pub async fn get_candles(&self, symbol: &str, interval: &str, count: usize) -> Vec<Candle> {
        for attempt in 0..self.config.read_retries {
            match self.cache.get_candles(symbol, interval, count).await {
                Ok(mut candles) => {
                    // Cache stores newest first; callers want oldest first.
                    candles.reverse();
                    return candles;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Candle read failed");
                    if attempt + 1 < self.config.read_retries {
                        tokio::time::sleep(self.config.read_retry_delay).await;
                    }
                }
            }
        }
        Vec::new()
    }

    /// Last known trade price, or `None` when unavailable.
    pub async fn get_latest_price(&self, symbol: &str) -> Option<f64> {
        for attempt in 0..self.config.read_retries {
            match self.cache.get_price(symbol).await {
                Ok(point) => return point.map(|p| p.price),
                Err(e) => {
                    warn!(error = %e, attempt, "Price read failed");
                    if attempt + 1 < self.config.read_retries {
                        tokio::time::sleep(self.config.read_retry_delay).await;
                    }
                }
            }
        }
        None
    }

    pub async fn health_check(&self) -> HubHealth {
        let cache_connected = self.cache.ping().await.is_ok();
        let mut symbols: Vec<String> = self
            .subs_tx
            .borrow()
            .iter()
            .map(|(s, _)| s.clone())
            .collect();
        symbols.sort();
        symbols.dedup();

        HubHealth {
            stream_connected: self.stream_connected.load(Ordering::SeqCst),
            cache_connected,
            active_symbols: symbols,
        }
    }

    /// Idempotent graceful shutdown: stops the stream loop, joins it and
    /// closes the cache.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.stream_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Stream task join failed");
            }
        }
        self.cache.close().await;
        info!("Market data hub closed");
    }

    /// Cache handle for collaborators that share the backend (paper client).
    pub fn cache(&self) -> Arc<dyn CandleCache> {
        self.cache.clone()
    }
}
