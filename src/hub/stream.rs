//! Exchange WebSocket consumption loop.
//!
//! One socket carries every subscribed `(symbol, interval)` kline stream.
//! The loop reconnects forever with exponential backoff, resets the backoff
//! after a stable session, and restarts the session when the subscription
//! set changes. Only closed candles are persisted to the cache window; the
//! latest-price key is refreshed on every tick.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::backoff::ExponentialBackoff;
use super::cache::CandleCache;
use crate::types::{Candle, PricePoint};

/// Duration of a stable session before the backoff resets.
const STABLE_CONNECTION_THRESHOLD: Duration = Duration::from_secs(300);

/// Timeout for WebSocket connection attempts.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the combined-stream URL for the subscribed kline streams.
pub fn build_stream_url(base_url: &str, subscriptions: &[(String, String)]) -> String {
    let streams: Vec<String> = subscriptions
        .iter()
        .map(|(symbol, interval)| format!("{}@kline_{}", symbol.to_lowercase(), interval))
        .collect();

    if streams.len() == 1 {
        format!("{}/ws/{}", base_url, streams[0])
    } else {
        format!("{}/stream?streams={}", base_url, streams.join("/"))
    }
}

#[derive(Debug, Deserialize)]
struct CombinedFrame {
    #[allow(dead_code)]
    stream: String,
    data: KlineEvent,
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "e")]
    event: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Parse a kline frame (combined or raw). Non-kline events yield `None`.
pub fn parse_kline(text: &str) -> Result<Option<Candle>> {
    let event = if let Ok(frame) = serde_json::from_str::<CombinedFrame>(text) {
        frame.data
    } else {
        match serde_json::from_str::<KlineEvent>(text) {
            Ok(event) => event,
            // Subscription acks and other control frames are not klines.
            Err(_) => return Ok(None),
        }
    };

    if event.event != "kline" {
        return Ok(None);
    }

    let k = event.kline;
    Ok(Some(Candle {
        symbol: event.symbol,
        interval: k.interval,
        open_time: k.open_time,
        open: k.open.parse()?,
        high: k.high.parse()?,
        low: k.low.parse()?,
        close: k.close.parse()?,
        volume: k.volume.parse()?,
        is_closed: k.is_closed,
    }))
}

/// Apply one text frame to the cache. The latest-price key is refreshed on
/// every kline tick; the candle window only takes closed bars.
async fn handle_text_message(text: &str, cache: &Arc<dyn CandleCache>) {
    match parse_kline(text) {
        Ok(Some(candle)) => {
            let point = PricePoint {
                price: candle.close,
                updated_at: chrono::Utc::now().timestamp_millis(),
            };
            if let Err(e) = cache.set_price(&candle.symbol, point).await {
                warn!(error = %e, "Failed to update latest price");
            }
            if candle.is_closed {
                debug!(
                    symbol = %candle.symbol,
                    interval = %candle.interval,
                    close = candle.close,
                    "Closed candle"
                );
                if let Err(e) = cache.store_candle(&candle).await {
                    warn!(error = %e, "Failed to persist candle");
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Failed to parse stream message");
        }
    }
}

enum SessionEnd {
    Shutdown,
    SubscriptionsChanged,
    /// Session connected and later dropped; carries how long it lasted.
    Disconnected(Duration),
    ConnectFailed(String),
}

async fn run_session(
    url: &str,
    cache: &Arc<dyn CandleCache>,
    connected: &AtomicBool,
    shutdown_rx: &mut watch::Receiver<bool>,
    subs_rx: &mut watch::Receiver<Vec<(String, String)>>,
) -> SessionEnd {
    info!(url = %url, "Connecting to exchange stream");

    let ws_stream = tokio::select! {
        biased;

        _ = shutdown_rx.changed() => return SessionEnd::Shutdown,

        result = tokio::time::timeout(CONNECTION_TIMEOUT, connect_async(url)) => {
            match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(e)) => return SessionEnd::ConnectFailed(e.to_string()),
                Err(_) => return SessionEnd::ConnectFailed("connection timeout".to_string()),
            }
        }
    };

    info!("Exchange stream connected");
    connected.store(true, Ordering::SeqCst);
    let connected_at = std::time::Instant::now();

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received, closing stream");
                    let _ = write.close().await;
                    connected.store(false, Ordering::SeqCst);
                    return SessionEnd::Shutdown;
                }
            }

            _ = subs_rx.changed() => {
                info!("Subscription set changed, restarting stream session");
                let _ = write.close().await;
                connected.store(false, Ordering::SeqCst);
                return SessionEnd::SubscriptionsChanged;
            }

            msg_opt = read.next() => {
                let msg = match msg_opt {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        connected.store(false, Ordering::SeqCst);
                        return SessionEnd::Disconnected(connected_at.elapsed());
                    }
                    None => {
                        info!("WebSocket stream ended");
                        connected.store(false, Ordering::SeqCst);
                        return SessionEnd::Disconnected(connected_at.elapsed());
                    }
                };

                match msg {
                    Message::Text(text) => handle_text_message(&text, cache).await,
                    Message::Ping(data) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!(error = %e, "Failed to send pong");
                            connected.store(false, Ordering::SeqCst);
                            return SessionEnd::Disconnected(connected_at.elapsed());
                        }
                    }
                    Message::Close(_) => {
                        info!("Stream closed by server");
                        connected.store(false, Ordering::SeqCst);
                        return SessionEnd::Disconnected(connected_at.elapsed());
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Run the stream loop until shutdown. Reconnects with backoff on every
/// failure; never returns an error to the caller.
pub async fn run_stream(
    base_url: String,
    cache: Arc<dyn CandleCache>,
    connected: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut subs_rx: watch::Receiver<Vec<(String, String)>>,
) {
    let mut backoff = ExponentialBackoff::default();

    loop {
        if *shutdown_rx.borrow() {
            info!("Stream loop shutdown complete");
            return;
        }

        let subscriptions = subs_rx.borrow_and_update().clone();
        if subscriptions.is_empty() {
            // Nothing to stream yet; wait for the first subscribe().
            tokio::select! {
                _ = shutdown_rx.changed() => continue,
                _ = subs_rx.changed() => continue,
            }
        }

        let url = build_stream_url(&base_url, &subscriptions);

        match run_session(&url, &cache, &connected, &mut shutdown_rx, &mut subs_rx).await {
            SessionEnd::Shutdown => {
                info!("Stream loop shutdown complete");
                return;
            }
            SessionEnd::SubscriptionsChanged => {
                backoff.reset();
                continue;
            }
            SessionEnd::Disconnected(duration) => {
                if duration >= STABLE_CONNECTION_THRESHOLD {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                warn!(
                    attempt = backoff.attempt(),
                    delay_secs = delay.as_secs_f64(),
                    "Stream lost, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
            SessionEnd::ConnectFailed(reason) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %reason,
                    attempt = backoff.attempt(),
                    delay_secs = delay.as_secs_f64(),
                    "Stream connection failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }
}
