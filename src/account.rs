//! Portfolio ledger.
//!
//! Single logical owner of cash and holdings. Every trade is committed
//! through `apply_fill` under one lock, so concurrent agents can never
//! interleave half-applied balance updates; readers get consistent
//! snapshots. Only the component that just completed a trade writes here.

use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::types::OrderSide;

/// One held position in the ledger (spot-style, long only).
#[derive(Debug, Clone, PartialEq)]
pub struct Holding {
    pub symbol: String,
    pub quantity: f64,
    pub avg_entry: f64,
}

/// Consistent point-in-time view of the portfolio.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    pub cash: f64,
    pub holdings: Vec<Holding>,
    /// Realized P&L since the last daily reset.
    pub daily_realized_pnl: f64,
    pub starting_equity: f64,
    pub peak_equity: f64,
}

impl PortfolioSnapshot {
    /// Mark-to-market equity. Holdings without a quote fall back to entry.
    pub fn equity(&self, prices: &HashMap<String, f64>) -> f64 {
        let held: f64 = self
            .holdings
            .iter()
            .map(|h| h.quantity * prices.get(&h.symbol).copied().unwrap_or(h.avg_entry))
            .sum();
        self.cash + held
    }

    /// Notional value of one symbol's holding at the given price.
    pub fn position_value(&self, symbol: &str, price: f64) -> f64 {
        self.holdings
            .iter()
            .find(|h| h.symbol == symbol)
            .map(|h| h.quantity * price)
            .unwrap_or(0.0)
    }

    pub fn held_quantity(&self, symbol: &str) -> f64 {
        self.holdings
            .iter()
            .find(|h| h.symbol == symbol)
            .map(|h| h.quantity)
            .unwrap_or(0.0)
    }

    /// Unrealized P&L across all holdings at the given prices.
    pub fn unrealized_pnl(&self, prices: &HashMap<String, f64>) -> f64 {
        self.holdings
            .iter()
            .map(|h| {
                let price = prices.get(&h.symbol).copied().unwrap_or(h.avg_entry);
                (price - h.avg_entry) * h.quantity
            })
            .sum()
    }
}

#[derive(Debug)]
struct AccountInner {
    cash: f64,
    holdings: HashMap<String, Holding>,
    daily_realized_pnl: f64,
    starting_equity: f64,
    peak_equity: f64,
}

/// Errors surfaced by ledger commits. These are bookkeeping violations, not
/// exchange failures; the risk governor should have prevented them.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient cash: need {need:.2}, have {have:.2}")]
    InsufficientCash { need: f64, have: f64 },

    #[error("insufficient holding of {symbol}: need {need}, have {have}")]
    InsufficientHolding { symbol: String, need: f64, have: f64 },
}

/// The shared account ledger.
pub struct Account {
    inner: Mutex<AccountInner>,
}

impl Account {
    pub fn new(starting_cash: f64) -> Self {
        Self {
            inner: Mutex::new(AccountInner {
                cash: starting_cash,
                holdings: HashMap::new(),
                daily_realized_pnl: 0.0,
                starting_equity: starting_cash,
                peak_equity: starting_cash,
            }),
        }
    }

    pub async fn snapshot(&self) -> PortfolioSnapshot {
        let inner = self.inner.lock().await;
        let mut holdings: Vec<Holding> = inner.holdings.values().cloned().collect();
        holdings.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        PortfolioSnapshot {
            cash: inner.cash,
            holdings,
            daily_realized_pnl: inner.daily_realized_pnl,
            starting_equity: inner.starting_equity,
            peak_equity: inner.peak_equity,
        }
    }

    /// Commit a fill. The whole transaction happens under the ledger lock
    /// and either fully applies or leaves state untouched.
    pub async fn apply_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        commission: f64,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        match side {
            OrderSide::Buy => {
                let cost = quantity * price + commission;
                if cost > inner.cash {
                    return Err(LedgerError::InsufficientCash {
                        need: cost,
                        have: inner.cash,
                    });
                }
                inner.cash -= cost;
                let holding = inner
                    .holdings
                    .entry(symbol.to_string())
                    .or_insert_with(|| Holding {
                        symbol: symbol.to_string(),
                        quantity: 0.0,
                        avg_entry: 0.0,
                    });
                let total_cost = holding.avg_entry * holding.quantity + price * quantity;
                holding.quantity += quantity;
                holding.avg_entry = total_cost / holding.quantity;
            }
            OrderSide::Sell => {
                let held = inner
                    .holdings
                    .get(symbol)
                    .map(|h| h.quantity)
                    .unwrap_or(0.0);
                if quantity > held + 1e-12 {
                    return Err(LedgerError::InsufficientHolding {
                        symbol: symbol.to_string(),
                        need: quantity,
                        have: held,
                    });
                }
                let avg_entry = inner.holdings.get(symbol).map(|h| h.avg_entry).unwrap_or(0.0);
                inner.cash += quantity * price - commission;
                inner.daily_realized_pnl += (price - avg_entry) * quantity - commission;
                if let Some(holding) = inner.holdings.get_mut(symbol) {
                    holding.quantity -= quantity;
                    if holding.quantity <= 1e-12 {
                        inner.holdings.remove(symbol);
                    }
                }
            }
        }
        Ok(())
    }

    /// Raise the peak-equity watermark; used by drawdown tracking.
    pub async fn observe_equity(&self, equity: f64) {
        let mut inner = self.inner.lock().await;
        if equity > inner.peak_equity {
            inner.peak_equity = equity;
        }
    }

    /// Start a new trading day: clear the daily realized P&L and re-baseline
    /// the starting equity at the current mark.
    pub async fn reset_daily(&self, equity: f64) {
        let mut inner = self.inner.lock().await;
        inner.daily_realized_pnl = 0.0;
        inner.starting_equity = equity;
    }
}
