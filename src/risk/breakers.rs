//! Circuit breakers.
//!
//! Pure evaluation over a portfolio snapshot plus current prices; the
//! governor executes whatever actions come back. Keeping the checks free of
//! I/O makes every threshold testable with plain structs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::account::PortfolioSnapshot;
use crate::risk::limits::RiskLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerKind {
    DailyLoss,
    PositionSize,
    EmergencyHalt,
}

impl std::fmt::Display for BreakerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerKind::DailyLoss => write!(f, "DAILY_LOSS"),
            BreakerKind::PositionSize => write!(f, "POSITION_SIZE"),
            BreakerKind::EmergencyHalt => write!(f, "EMERGENCY_HALT"),
        }
    }
}

/// What a tripped breaker wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerAction {
    /// Sell `quantity` of `symbol` to bring exposure back inside limits.
    ReducePosition { symbol: String, quantity: f64 },
    /// Liquidate every open position and halt new entries.
    CloseAllAndHalt,
}

/// Record of one breaker firing, kept for operator review.
#[derive(Debug, Clone)]
pub struct CircuitBreakerEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: BreakerKind,
    pub trigger_value: f64,
    pub threshold: f64,
    pub actions: Vec<BreakerAction>,
}

/// Evaluate all breakers against the current portfolio state.
///
/// The emergency halt preempts everything else: when drawdown from the peak
/// equity watermark crosses the critical threshold there is no point
/// trimming positions that are about to be closed outright. Evaluation is
/// idempotent: a snapshot already inside limits (or already flat) produces
/// no events, so re-running after the actions execute is safe.
pub fn evaluate(
    snapshot: &PortfolioSnapshot,
    prices: &HashMap<String, f64>,
    limits: &RiskLimits,
    now: DateTime<Utc>,
) -> Vec<CircuitBreakerEvent> {
    let equity = snapshot.equity(prices);
    if equity <= 0.0 {
        return Vec::new();
    }

    // Emergency halt: drawdown from peak.
    if snapshot.peak_equity > 0.0 {
        let drawdown = (snapshot.peak_equity - equity) / snapshot.peak_equity;
        if drawdown >= limits.critical_drawdown_threshold {
            if snapshot.holdings.is_empty() {
                // Already flat; halting again changes nothing.
                return Vec::new();
            }
            return vec![CircuitBreakerEvent {
                timestamp: now,
                kind: BreakerKind::EmergencyHalt,
                trigger_value: drawdown,
                threshold: limits.critical_drawdown_threshold,
                actions: vec![BreakerAction::CloseAllAndHalt],
            }];
        }
    }

    let mut events = Vec::new();

    // Daily-loss breaker: realized + unrealized P&L for the day.
    let daily_pnl = snapshot.daily_realized_pnl + snapshot.unrealized_pnl(prices);
    let daily_loss_pct = -daily_pnl / snapshot.starting_equity;
    if daily_loss_pct >= limits.daily_loss_threshold && !snapshot.holdings.is_empty() {
        let actions: Vec<BreakerAction> = snapshot
            .holdings
            .iter()
            .map(|h| BreakerAction::ReducePosition {
                symbol: h.symbol.clone(),
                quantity: h.quantity * limits.daily_loss_reduction,
            })
            .collect();
        events.push(CircuitBreakerEvent {
            timestamp: now,
            kind: BreakerKind::DailyLoss,
            trigger_value: daily_loss_pct,
            threshold: limits.daily_loss_threshold,
            actions,
        });
    }

    // Position-size breaker: any single holding too large a share of equity.
    for holding in &snapshot.holdings {
        let price = match prices.get(&holding.symbol) {
            Some(p) => *p,
            None => continue,
        };
        let concentration = holding.quantity * price / equity;
        if concentration >= limits.position_size_breach_threshold {
            let target_quantity = limits.concentration_target * equity / price;
            let excess = holding.quantity - target_quantity;
            if excess <= 0.0 {
                continue;
            }
            events.push(CircuitBreakerEvent {
                timestamp: now,
                kind: BreakerKind::PositionSize,
                trigger_value: concentration,
                threshold: limits.position_size_breach_threshold,
                actions: vec![BreakerAction::ReducePosition {
                    symbol: holding.symbol.clone(),
                    quantity: excess,
                }],
            });
        }
    }

    events
}
