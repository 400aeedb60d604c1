//! The risk governor.
//!
//! Single authority every agent passes through before committing capital.
//! Also runs its own monitor task that watches the whole portfolio and can
//! force-unwind it, independent of any single agent.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::account::Account;
use crate::audit::AuditLog;
use crate::execution::ExecutionClient;
use crate::hub::MarketDataHub;
use crate::risk::breakers::{self, BreakerAction, CircuitBreakerEvent};
use crate::risk::limits::RiskLimits;
use crate::risk::stops::{StopLossManager, StopLossOrder};
use crate::types::OrderSide;

/// Metrics computed while validating an order, returned to the caller for
/// logging regardless of the outcome.
#[derive(Debug, Clone, Default)]
pub struct RiskMetrics {
    pub order_cost: f64,
    pub equity: f64,
    pub cash_after: f64,
    pub concentration_after: f64,
    pub cash_reserve_pct_after: f64,
    pub daily_pnl_pct: f64,
}

#[derive(Debug, Clone)]
pub struct OrderValidation {
    pub valid: bool,
    pub reason: Option<String>,
    pub metrics: RiskMetrics,
}

impl OrderValidation {
    fn approved(metrics: RiskMetrics) -> Self {
        Self { valid: true, reason: None, metrics }
    }

    fn rejected(reason: String, metrics: RiskMetrics) -> Self {
        Self { valid: false, reason: Some(reason), metrics }
    }
}

pub struct RiskGovernor {
    account: Arc<Account>,
    limits: RwLock<RiskLimits>,
    trading_halted: AtomicBool,
    execution: Arc<dyn ExecutionClient>,
    audit: Mutex<Option<AuditLog>>,
    stops: Mutex<StopLossManager>,
    events: Mutex<Vec<CircuitBreakerEvent>>,
    trading_day: Mutex<NaiveDate>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RiskGovernor {
    pub fn new(
        account: Arc<Account>,
        limits: RiskLimits,
        execution: Arc<dyn ExecutionClient>,
        audit: Option<AuditLog>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            account,
            limits: RwLock::new(limits),
            trading_halted: AtomicBool::new(false),
            execution,
            audit: Mutex::new(audit),
            stops: Mutex::new(StopLossManager::new()),
            events: Mutex::new(Vec::new()),
            trading_day: Mutex::new(Utc::now().date_naive()),
            monitor_task: Mutex::new(None),
            shutdown_tx,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.trading_halted.load(Ordering::SeqCst)
    }

    /// Manual operator reset after an emergency halt.
    pub fn reset_halt(&self) {
        if self.trading_halted.swap(false, Ordering::SeqCst) {
            info!("trading halt manually reset");
        }
    }

    pub async fn limits(&self) -> RiskLimits {
        self.limits.read().await.clone()
    }

    /// Hot-swap the limits; takes effect on the next validation or sweep.
    pub async fn update_limits(&self, limits: RiskLimits) {
        *self.limits.write().await = limits;
        info!("risk limits updated");
    }

    pub async fn recent_events(&self) -> Vec<CircuitBreakerEvent> {
        self.events.lock().await.clone()
    }

    /// Pre-trade validation. Checks run in a fixed order and the first
    /// failure short-circuits with a specific reason. Every rejection is
    /// appended to the audit log.
    pub async fn validate_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        price: f64,
        commission: f64,
        prices: &HashMap<String, f64>,
    ) -> OrderValidation {
        let limits = self.limits.read().await.clone();
        let snapshot = self.account.snapshot().await;

        let order_cost = quantity * price + commission;
        let equity = snapshot.equity(prices);
        let daily_pnl = snapshot.daily_realized_pnl + snapshot.unrealized_pnl(prices);
        let daily_pnl_pct = if snapshot.starting_equity > 0.0 {
            daily_pnl / snapshot.starting_equity
        } else {
            0.0
        };

        let mut metrics = RiskMetrics {
            order_cost,
            equity,
            cash_after: snapshot.cash,
            concentration_after: 0.0,
            cash_reserve_pct_after: 0.0,
            daily_pnl_pct,
        };

        let verdict = 'checks: {
            match side {
                OrderSide::Buy => {
                    // The halt blocks new entries only; risk-reducing sells
                    // stay allowed.
                    if self.is_halted() {
                        break 'checks Some("trading halted by circuit breaker".to_string());
                    }
                    if order_cost > snapshot.cash {
                        break 'checks Some(format!(
                            "insufficient cash: order costs {:.2}, cash is {:.2}",
                            order_cost, snapshot.cash
                        ));
                    }
                    metrics.cash_after = snapshot.cash - order_cost;

                    let position_after = snapshot.position_value(symbol, price) + quantity * price;
                    metrics.concentration_after =
                        if equity > 0.0 { position_after / equity } else { 1.0 };
                    if metrics.concentration_after > limits.max_position_concentration {
                        break 'checks Some(format!(
                            "position would reach {:.1}% of equity, limit is {:.1}%",
                            metrics.concentration_after * 100.0,
                            limits.max_position_concentration * 100.0
                        ));
                    }

                    metrics.cash_reserve_pct_after =
                        if equity > 0.0 { metrics.cash_after / equity } else { 0.0 };
                    if metrics.cash_reserve_pct_after < limits.min_cash_reserve_pct {
                        break 'checks Some(format!(
                            "cash reserve would fall to {:.1}%, minimum is {:.1}%",
                            metrics.cash_reserve_pct_after * 100.0,
                            limits.min_cash_reserve_pct * 100.0
                        ));
                    }

                    if daily_pnl_pct < -limits.max_daily_loss_pct {
                        break 'checks Some(format!(
                            "daily P&L at {:.1}% exceeds max daily loss {:.1}%",
                            daily_pnl_pct * 100.0,
                            limits.max_daily_loss_pct * 100.0
                        ));
                    }
                }
                OrderSide::Sell => {
                    let held = snapshot.held_quantity(symbol);
                    if quantity > held + 1e-12 {
                        break 'checks Some(format!(
                            "insufficient holding of {}: selling {}, hold {}",
                            symbol, quantity, held
                        ));
                    }
                    metrics.cash_after = snapshot.cash + quantity * price - commission;
                }
            }
            None
        };

        match verdict {
            None => OrderValidation::approved(metrics),
            Some(reason) => {
                warn!(symbol, %side, quantity, price, %reason, "order rejected");
                if let Some(audit) = self.audit.lock().await.as_mut() {
                    audit.log_rejection(Utc::now(), symbol, quantity, price, &reason);
                }
                OrderValidation::rejected(reason, metrics)
            }
        }
    }

    /// Register (or replace) the backstop stop for an agent's position.
    pub async fn register_stop(&self, bot_id: Uuid, order: StopLossOrder) {
        self.stops.lock().await.register(bot_id, order);
    }

    /// Drop the backstop stop once an agent closed its position itself.
    pub async fn clear_stop(&self, bot_id: &Uuid) {
        self.stops.lock().await.remove(bot_id);
    }

    /// One monitoring pass: mark equity, run the circuit breakers, sweep the
    /// backstop stops. Callable directly from tests; the spawned monitor loop
    /// does nothing else.
    pub async fn monitor_and_trigger(&self, prices: &HashMap<String, f64>) {
        self.monitor_at(prices, Utc::now()).await
    }

    async fn monitor_at(&self, prices: &HashMap<String, f64>, now: DateTime<Utc>) {
        let snapshot = self.account.snapshot().await;
        let equity = snapshot.equity(prices);
        self.account.observe_equity(equity).await;

        // UTC day rollover re-baselines the daily loss checks.
        {
            let mut day = self.trading_day.lock().await;
            let today = now.date_naive();
            if *day != today {
                *day = today;
                self.account.reset_daily(equity).await;
                info!(%today, "New trading day, daily P&L baseline reset");
            }
        }

        // Re-read: observe_equity and the rollover may have moved baselines.
        let snapshot = self.account.snapshot().await;
        let limits = self.limits.read().await.clone();
        let events = breakers::evaluate(&snapshot, prices, &limits, now);

        for event in events {
            warn!(
                kind = %event.kind,
                trigger = event.trigger_value,
                threshold = event.threshold,
                "circuit breaker tripped"
            );
            if let Some(audit) = self.audit.lock().await.as_mut() {
                audit.log_breaker(
                    event.timestamp,
                    &event.kind.to_string(),
                    &format!("trigger={:.4} threshold={:.4}", event.trigger_value, event.threshold),
                );
            }
            for action in &event.actions {
                self.execute_action(action).await;
            }
            self.events.lock().await.push(event);
        }

        self.sweep_stops(prices).await;
    }

    async fn execute_action(&self, action: &BreakerAction) {
        match action {
            BreakerAction::ReducePosition { symbol, quantity } => {
                self.forced_sell(symbol, *quantity).await;
            }
            BreakerAction::CloseAllAndHalt => {
                self.trading_halted.store(true, Ordering::SeqCst);
                let snapshot = self.account.snapshot().await;
                for holding in snapshot.holdings {
                    self.forced_sell(&holding.symbol, holding.quantity).await;
                }
                // Keep the backstop wherever a sell failed and the holding
                // survived; agents reconcile their own stale positions.
                let remaining = self.account.snapshot().await;
                self.stops
                    .lock()
                    .await
                    .retain(|order| remaining.held_quantity(&order.symbol) > 0.0);
            }
        }
    }

    /// Market-sell through the execution client and commit the fill. The
    /// quantity is clamped to what the ledger still holds, so a stale request
    /// never oversells. Failures are logged and skipped; the next sweep
    /// retries whatever is left.
    async fn forced_sell(&self, symbol: &str, quantity: f64) {
        let held = self.account.snapshot().await.held_quantity(symbol);
        let quantity = quantity.min(held);
        if quantity <= 0.0 {
            return;
        }
        match self
            .execution
            .place_market_order(symbol, OrderSide::Sell, quantity)
            .await
        {
            Ok(ack) => {
                let price = ack.fill_price;
                if let Err(err) = self
                    .account
                    .apply_fill(symbol, OrderSide::Sell, quantity, price, 0.0)
                    .await
                {
                    error!(symbol, %err, "forced sell filled but ledger commit failed");
                } else {
                    info!(symbol, quantity, price, "position force-reduced");
                }
            }
            Err(err) => {
                error!(symbol, quantity, %err, "forced sell failed");
            }
        }
    }

    async fn sweep_stops(&self, prices: &HashMap<String, f64>) {
        let triggered = self.stops.lock().await.sweep(prices, Utc::now());
        for stop in triggered {
            let snapshot = self.account.snapshot().await;
            let avg_entry = snapshot
                .holdings
                .iter()
                .find(|h| h.symbol == stop.order.symbol)
                .map(|h| h.avg_entry)
                .unwrap_or(stop.price);

            info!(
                symbol = %stop.order.symbol,
                trigger = stop.order.trigger_price,
                price = stop.price,
                "backstop stop triggered"
            );
            self.forced_sell(&stop.order.symbol, stop.order.quantity).await;

            let pnl = (stop.price - avg_entry) * stop.order.quantity;
            if let Some(audit) = self.audit.lock().await.as_mut() {
                audit.log_stop_execution(
                    Utc::now(),
                    &stop.order.symbol,
                    stop.order.quantity,
                    stop.price,
                    pnl,
                );
            }
        }
    }

    /// Spawn the monitor loop: a pass every `interval`, prices read from the
    /// hub for every held symbol.
    pub async fn start_monitor(
        self: &Arc<Self>,
        hub: Arc<MarketDataHub>,
        interval: std::time::Duration,
    ) {
        let governor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("risk monitor stopping");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let snapshot = governor.account.snapshot().await;
                        let mut prices = HashMap::new();
                        for holding in &snapshot.holdings {
                            if let Some(price) = hub.get_latest_price(&holding.symbol).await {
                                prices.insert(holding.symbol.clone(), price);
                            }
                        }
                        governor.monitor_and_trigger(&prices).await;
                    }
                }
            }
        });
        *self.monitor_task.lock().await = Some(handle);
    }

    pub async fn stop_monitor(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.monitor_task.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperExecutionClient;
    use crate::hub::cache::{CandleCache, InMemoryCache};

    async fn governor_with_cash(cash: f64) -> (Arc<RiskGovernor>, Arc<Account>, Arc<InMemoryCache>) {
        let account = Arc::new(Account::new(cash));
        let cache = Arc::new(InMemoryCache::new(200));
        let execution = Arc::new(PaperExecutionClient::new(cache.clone()));
        let governor = Arc::new(RiskGovernor::new(
            account.clone(),
            RiskLimits::default(),
            execution,
            None,
        ));
        (governor, account, cache)
    }

    #[tokio::test]
    async fn test_buy_exceeding_cash_rejected() {
        let (governor, _, _) = governor_with_cash(1_000.0).await;
        let prices = HashMap::new();

        // 0.05 * 30000 + 10 = 1510 > 1000
        let result = governor
            .validate_order("BTCUSDT", OrderSide::Buy, 0.05, 30_000.0, 10.0, &prices)
            .await;
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("insufficient cash"));
    }

    #[tokio::test]
    async fn test_concentration_limit_enforced() {
        let (governor, _, _) = governor_with_cash(10_000.0).await;
        let prices = HashMap::new();

        // 3000 notional out of 10000 equity = 30% > 25% cap.
        let result = governor
            .validate_order("BTCUSDT", OrderSide::Buy, 0.1, 30_000.0, 0.0, &prices)
            .await;
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("of equity"));

        // 2000 notional = 20% passes everything.
        let result = governor
            .validate_order("BTCUSDT", OrderSide::Buy, 0.0667, 30_000.0, 0.0, &prices)
            .await;
        assert!(result.valid, "reason: {:?}", result.reason);
    }

    #[tokio::test]
    async fn test_halted_governor_rejects_entries() {
        let (governor, _, _) = governor_with_cash(10_000.0).await;
        governor.trading_halted.store(true, Ordering::SeqCst);

        let result = governor
            .validate_order("BTCUSDT", OrderSide::Buy, 0.001, 30_000.0, 0.0, &HashMap::new())
            .await;
        assert!(!result.valid);
        assert!(result.reason.unwrap().contains("halted"));

        governor.reset_halt();
        let result = governor
            .validate_order("BTCUSDT", OrderSide::Buy, 0.001, 30_000.0, 0.0, &HashMap::new())
            .await;
        assert!(result.valid);
    }

    #[tokio::test]
    async fn test_sell_requires_held_quantity() {
        let (governor, account, _) = governor_with_cash(10_000.0).await;
        account
            .apply_fill("BTCUSDT", OrderSide::Buy, 0.01, 30_000.0, 0.0)
            .await
            .unwrap();

        let ok = governor
            .validate_order("BTCUSDT", OrderSide::Sell, 0.01, 31_000.0, 0.0, &HashMap::new())
            .await;
        assert!(ok.valid);

        let too_much = governor
            .validate_order("BTCUSDT", OrderSide::Sell, 0.02, 31_000.0, 0.0, &HashMap::new())
            .await;
        assert!(!too_much.valid);
    }

    #[tokio::test]
    async fn test_emergency_halt_closes_everything_and_is_idempotent() {
        let (governor, account, cache) = governor_with_cash(10_000.0).await;

        // Two positions bought near the top.
        account
            .apply_fill("BTCUSDT", OrderSide::Buy, 0.1, 48_000.0, 0.0)
            .await
            .unwrap();
        account
            .apply_fill("ETHUSDT", OrderSide::Buy, 2.0, 2_400.0, 0.0)
            .await
            .unwrap();
        account.observe_equity(10_000.0).await;

        // Prices collapse: equity 400 + 4000 + 4000 = 8400, drawdown 16%.
        let prices = HashMap::from([
            ("BTCUSDT".to_string(), 40_000.0),
            ("ETHUSDT".to_string(), 2_000.0),
        ]);
        cache.set_price("BTCUSDT", crate::types::PricePoint::now(40_000.0)).await.unwrap();
        cache.set_price("ETHUSDT", crate::types::PricePoint::now(2_000.0)).await.unwrap();

        governor
            .register_stop(
                Uuid::new_v4(),
                StopLossOrder::new_fixed("BTCUSDT", crate::types::Side::Long, 0.1, 30_000.0),
            )
            .await;

        governor.monitor_and_trigger(&prices).await;

        assert!(governor.is_halted());
        let snap = account.snapshot().await;
        assert!(snap.holdings.is_empty(), "positions not closed: {:?}", snap.holdings);
        // Nothing held means nothing left for the backstop to guard.
        assert!(governor.stops.lock().await.is_empty());
        let events = governor.recent_events().await;
        assert_eq!(events.len(), 1);

        // Second pass with nothing left open does nothing further.
        governor.monitor_and_trigger(&prices).await;
        assert_eq!(governor.recent_events().await.len(), 1);
        assert!(governor.is_halted());
    }

    #[tokio::test]
    async fn test_daily_baseline_resets_on_utc_rollover() {
        let (governor, account, _) = governor_with_cash(10_000.0).await;
        account
            .apply_fill("BTCUSDT", OrderSide::Buy, 0.1, 50_000.0, 0.0)
            .await
            .unwrap();
        account
            .apply_fill("BTCUSDT", OrderSide::Sell, 0.1, 46_000.0, 0.0)
            .await
            .unwrap();

        // Same day: the realized loss stands.
        governor.monitor_and_trigger(&HashMap::new()).await;
        assert!(account.snapshot().await.daily_realized_pnl < 0.0);

        // Day rollover: counter cleared, baseline moved to current equity.
        *governor.trading_day.lock().await = Utc::now().date_naive() - chrono::Days::new(1);
        governor.monitor_and_trigger(&HashMap::new()).await;
        let snap = account.snapshot().await;
        assert_eq!(snap.daily_realized_pnl, 0.0);
        assert_eq!(snap.starting_equity, snap.cash);
    }

    #[tokio::test]
    async fn test_stop_sweep_closes_position() {
        let (governor, account, cache) = governor_with_cash(10_000.0).await;
        account
            .apply_fill("BTCUSDT", OrderSide::Buy, 0.02, 50_000.0, 0.0)
            .await
            .unwrap();
        let bot_id = Uuid::new_v4();
        governor
            .register_stop(
                bot_id,
                StopLossOrder::new_fixed("BTCUSDT", crate::types::Side::Long, 0.02, 47_500.0),
            )
            .await;

        // Above the trigger: nothing happens.
        cache.set_price("BTCUSDT", crate::types::PricePoint::now(49_000.0)).await.unwrap();
        let prices = HashMap::from([("BTCUSDT".to_string(), 49_000.0)]);
        governor.monitor_and_trigger(&prices).await;
        assert_eq!(account.snapshot().await.held_quantity("BTCUSDT"), 0.02);

        // Below the trigger: backstop sells the position.
        cache.set_price("BTCUSDT", crate::types::PricePoint::now(47_000.0)).await.unwrap();
        let prices = HashMap::from([("BTCUSDT".to_string(), 47_000.0)]);
        governor.monitor_and_trigger(&prices).await;
        assert_eq!(account.snapshot().await.held_quantity("BTCUSDT"), 0.0);
    }
}
