//! Trading agents: one strategy instance trading one symbol.

pub mod config;
pub mod position;
pub mod trader;

use serde::{Deserialize, Serialize};

use position::Position;

pub use config::{AgentConfig, HaltPolicy};
pub use position::{ClosedTrade, ExitReason};
pub use trader::TradingAgent;

/// Read-only snapshot of one agent's runtime state, published through a
/// watch channel after every cycle. The agent task is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRuntimeState {
    pub running: bool,
    pub current_position: Option<Position>,
    /// Realized P&L over the agent's lifetime.
    pub total_pnl: f64,
    pub peak_equity: f64,
    pub current_drawdown_pct: f64,
    pub trading_halted: bool,
    pub halt_reason: Option<String>,
    pub total_trades: u32,
    pub winning_trades: u32,
}

impl AgentRuntimeState {
    pub fn initial(capital: f64) -> Self {
        Self {
            running: false,
            current_position: None,
            total_pnl: 0.0,
            peak_equity: capital,
            current_drawdown_pct: 0.0,
            trading_halted: false,
            halt_reason: None,
            total_trades: 0,
            winning_trades: 0,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            0.0
        } else {
            self.winning_trades as f64 / self.total_trades as f64
        }
    }
}
