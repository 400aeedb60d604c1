//! Process-wide risk limits.

use serde::{Deserialize, Serialize};

/// Portfolio-wide limits consumed by `validate_order` and the circuit
/// breakers. Loaded once at startup and hot-updatable by an operator via
/// `RiskGovernor::update_limits`. The breaker reduction factors used to be
/// hardcoded; they live here so they can be tuned without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max fraction of total equity a single position may reach after a buy.
    pub max_position_concentration: f64,

    /// Free cash must stay at or above this fraction of equity after a buy.
    pub min_cash_reserve_pct: f64,

    /// New entries are rejected once daily P&L falls below this fraction.
    pub max_daily_loss_pct: f64,

    /// Daily-loss circuit breaker trigger (fraction of starting equity).
    pub daily_loss_threshold: f64,

    /// Fraction by which the daily-loss breaker reduces every open position.
    pub daily_loss_reduction: f64,

    /// Position-size breaker trigger: single position as a fraction of equity.
    pub position_size_breach_threshold: f64,

    /// Target concentration the position-size breaker reduces down to.
    pub concentration_target: f64,

    /// Drawdown fraction beyond which the emergency halt closes everything.
    pub critical_drawdown_threshold: f64,

    /// Ceiling applied to the Kelly fraction.
    pub kelly_cap: f64,

    /// Notional bounds for volatility-targeted sizing.
    pub min_position_size: f64,
    pub max_position_size: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_concentration: 0.25,
            min_cash_reserve_pct: 0.10,
            max_daily_loss_pct: 0.05,
            daily_loss_threshold: 0.03,
            daily_loss_reduction: 0.5,
            position_size_breach_threshold: 0.35,
            concentration_target: 0.20,
            critical_drawdown_threshold: 0.15,
            kelly_cap: 0.25,
            min_position_size: 100.0,
            max_position_size: 50_000.0,
        }
    }
}
