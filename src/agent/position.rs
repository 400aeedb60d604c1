//! Open positions and closed-trade records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Side;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    AgentStopped,
    ForcedByHalt,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::AgentStopped => write!(f, "agent_stopped"),
            ExitReason::ForcedByHalt => write!(f, "forced_by_halt"),
        }
    }
}

/// One open position. Exactly one per agent; mutated on every tick while
/// open, converted to a `ClosedTrade` on exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Zero disables trailing; the stop stays fixed.
    pub trailing_stop_pct: f64,
    pub highest_price_seen: f64,
    pub lowest_price_seen: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn open_long(
        symbol: &str,
        quantity: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        trailing_stop_pct: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: Side::Long,
            quantity,
            entry_price,
            stop_loss,
            take_profit,
            trailing_stop_pct,
            highest_price_seen: entry_price,
            lowest_price_seen: entry_price,
            opened_at: Utc::now(),
        }
    }

    /// Track extremes and ratchet a trailing stop. The stop only ever moves
    /// in the favorable direction.
    pub fn update_on_tick(&mut self, price: f64) {
        self.highest_price_seen = self.highest_price_seen.max(price);
        self.lowest_price_seen = self.lowest_price_seen.min(price);

        if self.trailing_stop_pct <= 0.0 {
            return;
        }
        match self.side {
            Side::Long => {
                let candidate = self.highest_price_seen * (1.0 - self.trailing_stop_pct);
                if candidate > self.stop_loss {
                    self.stop_loss = candidate;
                }
            }
            Side::Short => {
                let candidate = self.lowest_price_seen * (1.0 + self.trailing_stop_pct);
                if candidate < self.stop_loss {
                    self.stop_loss = candidate;
                }
            }
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        match self.side {
            Side::Long => (price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - price) * self.quantity,
        }
    }

    /// Exit check with stop-loss taking priority over take-profit.
    pub fn exit_signal(&self, price: f64) -> Option<ExitReason> {
        match self.side {
            Side::Long => {
                if price <= self.stop_loss {
                    Some(ExitReason::StopLoss)
                } else if self.take_profit > 0.0 && price >= self.take_profit {
                    Some(ExitReason::TakeProfit)
                } else {
                    None
                }
            }
            Side::Short => {
                if price >= self.stop_loss {
                    Some(ExitReason::StopLoss)
                } else if self.take_profit > 0.0 && price <= self.take_profit {
                    Some(ExitReason::TakeProfit)
                } else {
                    None
                }
            }
        }
    }

    pub fn into_closed(self, exit_price: f64, reason: ExitReason) -> ClosedTrade {
        let realized_pnl = match self.side {
            Side::Long => (exit_price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - exit_price) * self.quantity,
        };
        let closed_at = Utc::now();
        ClosedTrade {
            symbol: self.symbol,
            side: self.side,
            quantity: self.quantity,
            entry_price: self.entry_price,
            exit_price,
            realized_pnl,
            reason,
            opened_at: self.opened_at,
            closed_at,
        }
    }
}

/// Immutable record of a finished position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub reason: ExitReason,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn duration(&self) -> chrono::Duration {
        self.closed_at - self.opened_at
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(entry: f64, stop: f64, target: f64, trail: f64) -> Position {
        Position::open_long("BTCUSDT", 0.1, entry, stop, target, trail)
    }

    #[test]
    fn test_trailing_stop_ratchets_up_only() {
        let mut pos = long(100.0, 95.0, 120.0, 0.05);

        pos.update_on_tick(110.0);
        assert!((pos.stop_loss - 104.5).abs() < 1e-9);

        // Pullback must not loosen the stop.
        pos.update_on_tick(105.0);
        assert!((pos.stop_loss - 104.5).abs() < 1e-9);

        pos.update_on_tick(115.0);
        assert!((pos.stop_loss - 109.25).abs() < 1e-9);
    }

    #[test]
    fn test_fixed_stop_never_moves() {
        let mut pos = long(100.0, 95.0, 120.0, 0.0);
        pos.update_on_tick(118.0);
        assert_eq!(pos.stop_loss, 95.0);
    }

    #[test]
    fn test_stop_takes_priority_over_target() {
        // Degenerate config where a single price satisfies both.
        let pos = long(100.0, 90.0, 90.0, 0.0);
        assert_eq!(pos.exit_signal(90.0), Some(ExitReason::StopLoss));
    }

    #[test]
    fn test_exit_signals() {
        let pos = long(100.0, 95.0, 110.0, 0.0);
        assert_eq!(pos.exit_signal(100.0), None);
        assert_eq!(pos.exit_signal(94.0), Some(ExitReason::StopLoss));
        assert_eq!(pos.exit_signal(111.0), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_close_computes_realized_pnl() {
        let pos = long(100.0, 95.0, 110.0, 0.0);
        let trade = pos.into_closed(110.0, ExitReason::TakeProfit);
        assert!((trade.realized_pnl - 1.0).abs() < 1e-9);
        assert!(trade.is_win());
    }
}
