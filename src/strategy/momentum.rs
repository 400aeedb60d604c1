//! Built-in SMA momentum strategy.
//!
//! Buys when the fast moving average of closes sits above the slow one,
//! sells on the opposite cross. Confidence scales with the relative spread
//! between the two averages.

use serde::Deserialize;

use super::{SignalKind, Strategy, StrategySignal};
use crate::error::OrchestratorError;
use crate::types::Candle;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct MomentumParams {
    fast: usize,
    slow: usize,
    /// Relative spread at which confidence saturates at 1.0.
    full_confidence_spread: f64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            fast: 10,
            slow: 30,
            full_confidence_spread: 0.01,
        }
    }
}

pub struct MomentumStrategy {
    params: MomentumParams,
}

/// Registry constructor.
pub fn build(
    params: &serde_json::Value,
) -> Result<Box<dyn Strategy>, OrchestratorError> {
    // Absent params mean defaults.
    let params: MomentumParams = if params.is_null() {
        MomentumParams::default()
    } else {
        serde_json::from_value(params.clone()).map_err(|e| {
            OrchestratorError::InvalidStrategyParams {
                name: "momentum".to_string(),
                reason: e.to_string(),
            }
        })?
    };

    if params.fast == 0 || params.fast >= params.slow {
        return Err(OrchestratorError::InvalidStrategyParams {
            name: "momentum".to_string(),
            reason: format!("require 0 < fast < slow, got fast={} slow={}", params.fast, params.slow),
        });
    }

    Ok(Box::new(MomentumStrategy { params }))
}

fn sma(candles: &[Candle], period: usize) -> f64 {
    let window = &candles[candles.len() - period..];
    window.iter().map(|c| c.close).sum::<f64>() / period as f64
}

impl Strategy for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    fn analyze(&self, candles: &[Candle], _symbol: &str) -> StrategySignal {
        if candles.len() < self.params.slow {
            return StrategySignal::hold(format!(
                "insufficient history: {} < {}",
                candles.len(),
                self.params.slow
            ));
        }

        let fast = sma(candles, self.params.fast);
        let slow = sma(candles, self.params.slow);
        if slow == 0.0 {
            return StrategySignal::hold("degenerate window");
        }

        let spread = (fast - slow) / slow;
        let confidence = (spread.abs() / self.params.full_confidence_spread).min(1.0);

        if spread > 0.0 {
            StrategySignal {
                signal: SignalKind::Buy,
                confidence,
                reason: format!("fast SMA {:.4} above slow SMA {:.4}", fast, slow),
            }
        } else if spread < 0.0 {
            StrategySignal {
                signal: SignalKind::Sell,
                confidence,
                reason: format!("fast SMA {:.4} below slow SMA {:.4}", fast, slow),
            }
        } else {
            StrategySignal::hold("averages flat")
        }
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({
            "fast": self.params.fast,
            "slow": self.params.slow,
            "full_confidence_spread": self.params.full_confidence_spread,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                symbol: "BTCUSDT".to_string(),
                interval: "1m".to_string(),
                open_time: i as i64 * 60_000,
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
                is_closed: true,
            })
            .collect()
    }

    #[test]
    fn test_holds_without_history() {
        let strategy = build(&serde_json::json!({})).unwrap();
        let signal = strategy.analyze(&candles(&[100.0; 5]), "BTCUSDT");
        assert_eq!(signal.signal, SignalKind::Hold);
    }

    #[test]
    fn test_rising_closes_signal_buy() {
        let strategy = build(&serde_json::json!({"fast": 3, "slow": 10})).unwrap();
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let signal = strategy.analyze(&candles(&closes), "BTCUSDT");
        assert_eq!(signal.signal, SignalKind::Buy);
        assert!(signal.confidence > 0.0);
    }

    #[test]
    fn test_falling_closes_signal_sell() {
        let strategy = build(&serde_json::json!({"fast": 3, "slow": 10})).unwrap();
        let closes: Vec<f64> = (0..20).map(|i| 200.0 - i as f64).collect();
        let signal = strategy.analyze(&candles(&closes), "BTCUSDT");
        assert_eq!(signal.signal, SignalKind::Sell);
    }

    #[test]
    fn test_deterministic() {
        let strategy = build(&serde_json::json!({"fast": 3, "slow": 10})).unwrap();
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 7) as f64).collect();
        let window = candles(&closes);
        let a = strategy.analyze(&window, "BTCUSDT");
        let b = strategy.analyze(&window, "BTCUSDT");
        assert_eq!(a.signal, b.signal);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(build(&serde_json::json!({"fast": 30, "slow": 10})).is_err());
        assert!(build(&serde_json::json!({"fast": 0})).is_err());
    }
}
