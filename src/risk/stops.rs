//! Stop-loss orders and the portfolio backstop manager.
//!
//! Each open position carries exactly one stop order. Trailing levels only
//! ever tighten: upward for a long, downward for a short. The manager runs
//! inside the risk governor as a backstop to each agent's own stop logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopKind {
    Fixed,
    Trailing,
    Volatility,
    Atr,
    Time,
}

/// Protective stop for one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossOrder {
    pub symbol: String,
    /// Side of the protected position, not of the closing order.
    pub side: Side,
    pub quantity: f64,
    pub kind: StopKind,
    pub trigger_price: f64,
    /// Trailing distance as a fraction of the extreme price.
    pub trailing_pct: f64,
    pub highest_price: f64,
    pub lowest_price: f64,
    pub expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StopLossOrder {
    pub fn new_fixed(symbol: &str, side: Side, quantity: f64, trigger_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            kind: StopKind::Fixed,
            trigger_price,
            trailing_pct: 0.0,
            highest_price: trigger_price,
            lowest_price: trigger_price,
            expiry: None,
            created_at: Utc::now(),
        }
    }

    pub fn new_trailing(
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_price: f64,
        trailing_pct: f64,
    ) -> Self {
        let trigger_price = match side {
            Side::Long => entry_price * (1.0 - trailing_pct),
            Side::Short => entry_price * (1.0 + trailing_pct),
        };
        Self {
            symbol: symbol.to_string(),
            side,
            quantity,
            kind: StopKind::Trailing,
            trigger_price,
            trailing_pct,
            highest_price: entry_price,
            lowest_price: entry_price,
            expiry: None,
            created_at: Utc::now(),
        }
    }

    /// Fixed stop placed a volatility-derived distance from entry.
    pub fn new_volatility(
        symbol: &str,
        side: Side,
        quantity: f64,
        entry_price: f64,
        distance: f64,
        kind: StopKind,
    ) -> Self {
        let trigger_price = match side {
            Side::Long => entry_price - distance,
            Side::Short => entry_price + distance,
        };
        Self {
            kind,
            ..Self::new_fixed(symbol, side, quantity, trigger_price)
        }
    }

    pub fn new_time(
        symbol: &str,
        side: Side,
        quantity: f64,
        trigger_price: f64,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: StopKind::Time,
            expiry: Some(expiry),
            ..Self::new_fixed(symbol, side, quantity, trigger_price)
        }
    }

    /// Feed a price tick. Trailing stops tighten monotonically; returns the
    /// new trigger when it moved.
    pub fn update_on_tick(&mut self, price: f64) -> Option<f64> {
        self.highest_price = self.highest_price.max(price);
        self.lowest_price = self.lowest_price.min(price);

        if self.kind != StopKind::Trailing {
            return None;
        }

        match self.side {
            Side::Long => {
                let candidate = self.highest_price * (1.0 - self.trailing_pct);
                if candidate > self.trigger_price {
                    self.trigger_price = candidate;
                    return Some(candidate);
                }
            }
            Side::Short => {
                let candidate = self.lowest_price * (1.0 + self.trailing_pct);
                if candidate < self.trigger_price {
                    self.trigger_price = candidate;
                    return Some(candidate);
                }
            }
        }
        None
    }

    pub fn is_breached(&self, price: f64, now: DateTime<Utc>) -> bool {
        if let Some(expiry) = self.expiry {
            if now >= expiry {
                return true;
            }
        }
        match self.side {
            Side::Long => price <= self.trigger_price,
            Side::Short => price >= self.trigger_price,
        }
    }
}

/// A stop that fired during a sweep.
#[derive(Debug, Clone)]
pub struct TriggeredStop {
    pub bot_id: Uuid,
    pub order: StopLossOrder,
    pub price: f64,
}

/// Backstop manager: one stop order per agent position.
#[derive(Debug, Default)]
pub struct StopLossManager {
    orders: HashMap<Uuid, StopLossOrder>,
}

impl StopLossManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the stop guarding an agent's position.
    pub fn register(&mut self, bot_id: Uuid, order: StopLossOrder) {
        self.orders.insert(bot_id, order);
    }

    pub fn remove(&mut self, bot_id: &Uuid) -> Option<StopLossOrder> {
        self.orders.remove(bot_id)
    }

    pub fn get(&self, bot_id: &Uuid) -> Option<&StopLossOrder> {
        self.orders.get(bot_id)
    }

    /// Keep only the stops for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&StopLossOrder) -> bool,
    {
        self.orders.retain(|_, order| keep(order));
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Update every stop against the latest prices and drain the breached
    /// ones. Symbols without a quote are skipped this sweep.
    pub fn sweep(
        &mut self,
        prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<TriggeredStop> {
        let mut triggered = Vec::new();

        let breached: Vec<Uuid> = self
            .orders
            .iter_mut()
            .filter_map(|(bot_id, order)| {
                let price = *prices.get(&order.symbol)?;
                order.update_on_tick(price);
                if order.is_breached(price, now) {
                    Some(*bot_id)
                } else {
                    None
                }
            })
            .collect();

        for bot_id in breached {
            if let Some(order) = self.orders.remove(&bot_id) {
                let price = prices.get(&order.symbol).copied().unwrap_or(order.trigger_price);
                triggered.push(TriggeredStop { bot_id, order, price });
            }
        }

        triggered
    }
}
