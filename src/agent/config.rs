//! Per-agent configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::OrchestratorError;

/// What happens to an open position once the drawdown guard halts an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HaltPolicy {
    /// Keep managing the position to its stop or target; the trailing stop
    /// may still tighten.
    #[default]
    TightenOnly,
    /// Close the position immediately on halt.
    ForceClose,
}

/// Immutable per-bot configuration, created by the orchestrator and mirrored
/// to persistence. One config drives exactly one agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub bot_id: Uuid,
    pub name: String,
    pub symbol: String,
    pub interval: String,
    pub strategy_name: String,
    #[serde(default)]
    pub strategy_params: Value,

    /// Capital allocated to this agent in quote currency.
    pub capital: f64,
    /// Fraction of capital risked per entry.
    pub risk_per_trade: f64,
    /// Hard cap on one position as a fraction of agent capital.
    pub max_position_size_pct: f64,
    /// Trailing distance; zero means a fixed stop instead.
    pub trailing_stop_pct: f64,
    /// Fixed stop distance from entry when not trailing.
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Agent self-halts once its own drawdown reaches this fraction.
    pub drawdown_guard_pct: f64,
    /// Signals below this confidence are ignored.
    pub min_confidence: f64,
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub halt_policy: HaltPolicy,

    /// Inactive configs are skipped entirely on restore.
    pub is_active: bool,
    /// Whether the agent should be running; restored on startup.
    pub is_running: bool,
}

impl AgentConfig {
    pub fn new(name: &str, symbol: &str, strategy_name: &str, capital: f64) -> Self {
        Self {
            bot_id: Uuid::new_v4(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            interval: "1m".to_string(),
            strategy_name: strategy_name.to_string(),
            strategy_params: Value::Null,
            capital,
            risk_per_trade: 0.02,
            max_position_size_pct: 0.20,
            trailing_stop_pct: 0.015,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            drawdown_guard_pct: 0.10,
            min_confidence: 0.5,
            poll_interval_secs: 5,
            halt_policy: HaltPolicy::default(),
            is_active: true,
            is_running: false,
        }
    }

    /// Sanity-check the numeric fields before the config reaches an agent.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let invalid = |reason: &str| OrchestratorError::InvalidStrategyParams {
            name: self.strategy_name.clone(),
            reason: reason.to_string(),
        };
        if self.symbol.is_empty() {
            return Err(invalid("symbol is empty"));
        }
        if self.capital <= 0.0 {
            return Err(invalid("capital must be positive"));
        }
        if !(0.0..=1.0).contains(&self.risk_per_trade) {
            return Err(invalid("risk_per_trade must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.max_position_size_pct) {
            return Err(invalid("max_position_size_pct must be in [0, 1]"));
        }
        if self.trailing_stop_pct < 0.0 || self.stop_loss_pct <= 0.0 {
            return Err(invalid("stop distances must be positive"));
        }
        if self.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = AgentConfig::new("btc-momentum", "BTCUSDT", "momentum", 10_000.0);
        assert!(config.validate().is_ok());
        assert!(config.is_active);
        assert!(!config.is_running);
    }

    #[test]
    fn test_bad_fields_rejected() {
        let mut config = AgentConfig::new("x", "BTCUSDT", "momentum", 10_000.0);
        config.risk_per_trade = 1.5;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::new("x", "BTCUSDT", "momentum", 0.0);
        config.capital = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = AgentConfig::new("eth-momentum", "ETHUSDT", "momentum", 5_000.0);
        let json = serde_json::to_string(&config).unwrap();
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bot_id, config.bot_id);
        assert_eq!(back.symbol, "ETHUSDT");
        assert_eq!(back.halt_policy, HaltPolicy::TightenOnly);
    }
}
