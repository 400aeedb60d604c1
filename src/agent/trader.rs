//! The per-symbol trading agent task.
//!
//! A fixed-interval polling loop over a small state machine: flat and
//! scanning for entries, or managing one open position. The drawdown guard
//! is orthogonal and only disables entries; what happens to an open
//! position on halt is the configured `HaltPolicy`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::agent::config::{AgentConfig, HaltPolicy};
use crate::agent::position::{ExitReason, Position};
use crate::agent::AgentRuntimeState;
use crate::error::ExecutionError;
use crate::execution::ExecutionClient;
use crate::hub::MarketDataHub;
use crate::persistence::Persistence;
use crate::risk::governor::RiskGovernor;
use crate::risk::sizing::{calculate_position_size, SizingMethod};
use crate::risk::stops::StopLossOrder;
use crate::strategy::{SignalKind, Strategy};
use crate::types::{OrderSide, Side};

/// Candle window handed to the strategy each cycle.
const STRATEGY_WINDOW: usize = 100;

/// Taker commission applied to every fill.
const COMMISSION_RATE: f64 = 0.001;

/// Consecutive failed cycles before the cooldown sleep.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;
const ERROR_COOLDOWN: Duration = Duration::from_secs(30);

pub struct TradingAgent {
    config: AgentConfig,
    strategy: Box<dyn Strategy>,
    hub: Arc<MarketDataHub>,
    governor: Arc<RiskGovernor>,
    execution: Arc<dyn ExecutionClient>,
    account: Arc<Account>,
    persistence: Arc<dyn Persistence>,

    position: Option<Position>,
    realized_pnl: f64,
    peak_equity: f64,
    drawdown_pct: f64,
    halted: bool,
    halt_reason: Option<String>,
    total_trades: u32,
    winning_trades: u32,
    consecutive_errors: u32,

    state_tx: watch::Sender<AgentRuntimeState>,
}

impl TradingAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AgentConfig,
        strategy: Box<dyn Strategy>,
        hub: Arc<MarketDataHub>,
        governor: Arc<RiskGovernor>,
        execution: Arc<dyn ExecutionClient>,
        account: Arc<Account>,
        persistence: Arc<dyn Persistence>,
    ) -> (Self, watch::Receiver<AgentRuntimeState>) {
        let peak_equity = config.capital;
        let (state_tx, state_rx) = watch::channel(AgentRuntimeState::initial(config.capital));
        let agent = Self {
            config,
            strategy,
            hub,
            governor,
            execution,
            account,
            persistence,
            position: None,
            realized_pnl: 0.0,
            peak_equity,
            drawdown_pct: 0.0,
            halted: false,
            halt_reason: None,
            total_trades: 0,
            winning_trades: 0,
            consecutive_errors: 0,
            state_tx,
        };
        (agent, state_rx)
    }

    /// The agent task. Runs until shutdown is signaled, then force-closes
    /// any open position before parking.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(bot = %self.config.name, symbol = %self.config.symbol, "Agent started");
        self.hub.subscribe(&self.config.symbol, &self.config.interval);
        self.publish_state(true);

        let poll = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = tokio::time::sleep(poll) => {
                    match self.cycle().await {
                        Ok(()) => {
                            self.consecutive_errors = 0;
                        }
                        Err(e) => {
                            self.consecutive_errors += 1;
                            warn!(
                                bot = %self.config.name,
                                error = %e,
                                consecutive = self.consecutive_errors,
                                "Cycle failed"
                            );
                            if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                warn!(bot = %self.config.name, "Too many failures, cooling down");
                                tokio::time::sleep(ERROR_COOLDOWN).await;
                                self.consecutive_errors = 0;
                            }
                        }
                    }
                    self.publish_state(true);
                }
            }
        }

        if self.position.is_some() {
            info!(bot = %self.config.name, "Closing open position before stopping");
            if let Err(e) = self.close_position(ExitReason::AgentStopped).await {
                error!(bot = %self.config.name, error = %e, "Failed to close position on stop");
            }
        }
        self.publish_state(false);
        info!(bot = %self.config.name, "Agent stopped");
    }

    /// One pass of the state machine. Missing market data is a skip, not an
    /// error.
    async fn cycle(&mut self) -> Result<(), ExecutionError> {
        let price = match self.hub.get_latest_price(&self.config.symbol).await {
            Some(p) => p,
            None => {
                debug!(bot = %self.config.name, "No price yet, skipping cycle");
                return Ok(());
            }
        };

        if self.position.is_some() {
            self.manage_position(price).await?;
        } else if !self.halted {
            self.scan_for_entry(price).await?;
        }

        Ok(())
    }

    async fn scan_for_entry(&mut self, price: f64) -> Result<(), ExecutionError> {
        let candles = self
            .hub
            .get_candles(&self.config.symbol, &self.config.interval, STRATEGY_WINDOW)
            .await;
        if candles.is_empty() {
            return Ok(());
        }

        let signal = self.strategy.analyze(&candles, &self.config.symbol);
        if signal.signal != SignalKind::Buy || signal.confidence < self.config.min_confidence {
            return Ok(());
        }
        debug!(
            bot = %self.config.name,
            confidence = signal.confidence,
            reason = %signal.reason,
            "Entry signal"
        );

        let capital = self.config.capital + self.realized_pnl;
        let fraction = self
            .config
            .risk_per_trade
            .min(self.config.max_position_size_pct);
        let notional =
            calculate_position_size(&SizingMethod::FixedFractional { fraction }, capital);
        let quantity = notional / price;
        if quantity <= 0.0 {
            return Ok(());
        }

        let commission = quantity * price * COMMISSION_RATE;
        let prices = HashMap::from([(self.config.symbol.clone(), price)]);
        let validation = self
            .governor
            .validate_order(
                &self.config.symbol,
                OrderSide::Buy,
                quantity,
                price,
                commission,
                &prices,
            )
            .await;
        if !validation.valid {
            // Normal negative result; logged by the governor.
            return Ok(());
        }

        let ack = self
            .execution
            .place_market_order(&self.config.symbol, OrderSide::Buy, quantity)
            .await?;
        let fill_price = ack.fill_price;
        let commission = quantity * fill_price * COMMISSION_RATE;

        if let Err(e) = self
            .account
            .apply_fill(&self.config.symbol, OrderSide::Buy, quantity, fill_price, commission)
            .await
        {
            // Order filled but the ledger refused; surface loudly, leave flat.
            error!(bot = %self.config.name, error = %e, "Ledger rejected entry fill");
            return Err(ExecutionError::Rejected(e.to_string()));
        }

        let stop_loss = fill_price * (1.0 - self.config.stop_loss_pct);
        let take_profit = fill_price * (1.0 + self.config.take_profit_pct);
        let position = Position::open_long(
            &self.config.symbol,
            quantity,
            fill_price,
            stop_loss,
            take_profit,
            self.config.trailing_stop_pct,
        );

        let backstop = if self.config.trailing_stop_pct > 0.0 {
            StopLossOrder::new_trailing(
                &self.config.symbol,
                Side::Long,
                quantity,
                fill_price,
                self.config.trailing_stop_pct,
            )
        } else {
            StopLossOrder::new_fixed(&self.config.symbol, Side::Long, quantity, stop_loss)
        };
        self.governor.register_stop(self.config.bot_id, backstop).await;

        info!(
            bot = %self.config.name,
            symbol = %self.config.symbol,
            quantity,
            fill_price,
            stop_loss,
            take_profit,
            "Position opened"
        );
        self.position = Some(position);
        Ok(())
    }

    async fn manage_position(&mut self, price: f64) -> Result<(), ExecutionError> {
        let (unrealized, exit) = match self.position.as_mut() {
            Some(position) => {
                position.update_on_tick(price);
                (position.unrealized_pnl(price), position.exit_signal(price))
            }
            None => return Ok(()),
        };

        // Drawdown tracking over realized + unrealized equity.
        let equity = self.config.capital + self.realized_pnl + unrealized;
        self.peak_equity = self.peak_equity.max(equity);
        self.drawdown_pct = if self.peak_equity > 0.0 {
            (self.peak_equity - equity) / self.peak_equity
        } else {
            0.0
        };

        if !self.halted && self.drawdown_pct >= self.config.drawdown_guard_pct {
            let reason = format!(
                "drawdown {:.1}% reached guard {:.1}%",
                self.drawdown_pct * 100.0,
                self.config.drawdown_guard_pct * 100.0
            );
            warn!(bot = %self.config.name, %reason, "Agent halted");
            self.halted = true;
            self.halt_reason = Some(reason);

            if self.config.halt_policy == HaltPolicy::ForceClose {
                return self.close_position(ExitReason::ForcedByHalt).await;
            }
        }

        if let Some(reason) = exit {
            self.close_position(reason).await?;
        }
        Ok(())
    }

    async fn close_position(&mut self, reason: ExitReason) -> Result<(), ExecutionError> {
        let mut position = match self.position.take() {
            Some(p) => p,
            None => return Ok(()),
        };

        // The governor's backstop or a circuit breaker may already have sold
        // part or all of this holding; close only what the ledger still has.
        let held = self.account.snapshot().await.held_quantity(&position.symbol);
        let quantity = position.quantity.min(held);
        if quantity <= 0.0 {
            info!(
                bot = %self.config.name,
                symbol = %position.symbol,
                "Position was closed externally, nothing left to book"
            );
            self.governor.clear_stop(&self.config.bot_id).await;
            return Ok(());
        }

        let ack = match self
            .execution
            .place_market_order(&position.symbol, OrderSide::Sell, quantity)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                // Roll back: the position is still open.
                self.position = Some(position);
                return Err(e);
            }
        };
        let exit_price = ack.fill_price;
        let commission = quantity * exit_price * COMMISSION_RATE;

        if let Err(e) = self
            .account
            .apply_fill(&position.symbol, OrderSide::Sell, quantity, exit_price, commission)
            .await
        {
            // Lost the race against a forced unwind between the snapshot and
            // the fill; the holding is gone, so there is no trade to book.
            error!(bot = %self.config.name, error = %e, "Exit fill refused, dropping the close");
            self.governor.clear_stop(&self.config.bot_id).await;
            return Ok(());
        }

        self.governor.clear_stop(&self.config.bot_id).await;

        position.quantity = quantity;
        let trade = position.into_closed(exit_price, reason);
        self.realized_pnl += trade.realized_pnl;
        self.total_trades += 1;
        if trade.is_win() {
            self.winning_trades += 1;
        }
        info!(
            bot = %self.config.name,
            symbol = %trade.symbol,
            exit_price,
            pnl = trade.realized_pnl,
            %reason,
            "Position closed"
        );

        if let Err(e) = self.persistence.record_trade(self.config.bot_id, &trade).await {
            warn!(bot = %self.config.name, error = %e, "Failed to record trade");
        }
        Ok(())
    }

    fn publish_state(&self, running: bool) {
        self.state_tx.send_replace(AgentRuntimeState {
            running,
            current_position: self.position.clone(),
            total_pnl: self.realized_pnl,
            peak_equity: self.peak_equity,
            current_drawdown_pct: self.drawdown_pct,
            trading_halted: self.halted,
            halt_reason: self.halt_reason.clone(),
            total_trades: self.total_trades,
            winning_trades: self.winning_trades,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperExecutionClient;
    use crate::hub::cache::CandleCache;
    use crate::hub::{HubConfig, MarketDataHub};
    use crate::persistence::InMemoryStore;
    use crate::risk::limits::RiskLimits;
    use crate::strategy::StrategySignal;
    use crate::types::Candle;
    use serde_json::Value;

    struct AlwaysBuy;

    impl Strategy for AlwaysBuy {
        fn name(&self) -> &str {
            "always_buy"
        }
        fn analyze(&self, _candles: &[Candle], _symbol: &str) -> StrategySignal {
            StrategySignal {
                signal: SignalKind::Buy,
                confidence: 1.0,
                reason: "test".to_string(),
            }
        }
        fn params(&self) -> Value {
            Value::Null
        }
    }

    struct Harness {
        agent: TradingAgent,
        hub: Arc<MarketDataHub>,
        store: Arc<InMemoryStore>,
    }

    async fn harness() -> Harness {
        let hub = Arc::new(MarketDataHub::new(HubConfig {
            read_retry_delay: Duration::from_millis(1),
            ..Default::default()
        }));
        let account = Arc::new(Account::new(100_000.0));
        let execution = Arc::new(PaperExecutionClient::new(hub.cache()));
        let governor = Arc::new(RiskGovernor::new(
            account.clone(),
            RiskLimits::default(),
            execution.clone(),
            None,
        ));
        let store = Arc::new(InMemoryStore::new());

        let mut config = AgentConfig::new("test-bot", "BTCUSDT", "always_buy", 10_000.0);
        config.trailing_stop_pct = 0.0;
        let (agent, _state_rx) = TradingAgent::new(
            config,
            Box::new(AlwaysBuy),
            hub.clone(),
            governor,
            execution,
            account,
            store.clone(),
        );
        Harness { agent, hub, store }
    }

    async fn seed_market(hub: &MarketDataHub, price: f64) {
        let cache = hub.cache();
        for i in 0..40 {
            cache
                .store_candle(&Candle {
                    symbol: "BTCUSDT".to_string(),
                    interval: "1m".to_string(),
                    open_time: i * 60_000,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1.0,
                    is_closed: true,
                })
                .await
                .unwrap();
        }
        cache.set_price("BTCUSDT", crate::types::PricePoint::now(price)).await.unwrap();
    }

    #[tokio::test]
    async fn test_entry_creates_single_position() {
        let mut h = harness().await;
        seed_market(&h.hub, 50_000.0).await;

        h.agent.cycle().await.unwrap();
        assert!(h.agent.position.is_some());

        // Further cycles while in position never pyramid.
        for _ in 0..5 {
            h.agent.cycle().await.unwrap();
            assert!(h.agent.position.is_some());
        }
    }

    #[tokio::test]
    async fn test_no_entry_without_market_data() {
        let mut h = harness().await;
        h.agent.cycle().await.unwrap();
        assert!(h.agent.position.is_none());
    }

    #[tokio::test]
    async fn test_stop_loss_exit_records_trade() {
        let mut h = harness().await;
        seed_market(&h.hub, 50_000.0).await;
        h.agent.cycle().await.unwrap();
        let bot_id = h.agent.config.bot_id;
        assert!(h.agent.position.is_some());

        // Drop through the 2% stop.
        h.hub.cache().set_price("BTCUSDT", crate::types::PricePoint::now(48_500.0)).await.unwrap();
        h.agent.cycle().await.unwrap();

        assert!(h.agent.position.is_none());
        assert_eq!(h.agent.total_trades, 1);
        assert!(h.agent.realized_pnl < 0.0);

        let trades = h.store.trades_for(bot_id).await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, ExitReason::StopLoss);
    }

    #[tokio::test]
    async fn test_take_profit_exit() {
        let mut h = harness().await;
        seed_market(&h.hub, 50_000.0).await;
        h.agent.cycle().await.unwrap();

        // Rally through the 4% target.
        h.hub.cache().set_price("BTCUSDT", crate::types::PricePoint::now(52_500.0)).await.unwrap();
        h.agent.cycle().await.unwrap();

        assert!(h.agent.position.is_none());
        assert_eq!(h.agent.winning_trades, 1);
        assert!(h.agent.realized_pnl > 0.0);
    }

    #[tokio::test]
    async fn test_drawdown_guard_halts_entries_but_manages_position() {
        let mut h = harness().await;
        h.agent.config.drawdown_guard_pct = 0.0001;
        h.agent.config.stop_loss_pct = 0.5;
        seed_market(&h.hub, 50_000.0).await;
        h.agent.cycle().await.unwrap();
        assert!(h.agent.position.is_some());

        // Small adverse move trips the tiny guard but not the wide stop.
        h.hub.cache().set_price("BTCUSDT", crate::types::PricePoint::now(49_500.0)).await.unwrap();
        h.agent.cycle().await.unwrap();
        assert!(h.agent.halted);
        assert!(h.agent.position.is_some(), "TightenOnly keeps managing");

        // Once flat, the halt blocks re-entry.
        h.hub.cache().set_price("BTCUSDT", crate::types::PricePoint::now(20_000.0)).await.unwrap();
        h.agent.cycle().await.unwrap();
        assert!(h.agent.position.is_none());
        h.agent.cycle().await.unwrap();
        assert!(h.agent.position.is_none(), "halted agent re-entered");
    }

    #[tokio::test]
    async fn test_force_close_halt_policy() {
        let mut h = harness().await;
        h.agent.config.drawdown_guard_pct = 0.0001;
        h.agent.config.stop_loss_pct = 0.5;
        h.agent.config.halt_policy = HaltPolicy::ForceClose;
        seed_market(&h.hub, 50_000.0).await;
        h.agent.cycle().await.unwrap();

        h.hub.cache().set_price("BTCUSDT", crate::types::PricePoint::now(49_500.0)).await.unwrap();
        h.agent.cycle().await.unwrap();

        assert!(h.agent.halted);
        assert!(h.agent.position.is_none());
        let trades = h.store.trades_for(h.agent.config.bot_id).await;
        assert_eq!(trades[0].reason, ExitReason::ForcedByHalt);
    }

    #[tokio::test]
    async fn test_external_liquidation_leaves_no_phantom_trade() {
        let mut h = harness().await;
        seed_market(&h.hub, 50_000.0).await;
        h.agent.cycle().await.unwrap();
        let bot_id = h.agent.config.bot_id;
        let quantity = h.agent.position.as_ref().unwrap().quantity;

        // A backstop stop sells the holding out from under the agent.
        h.agent
            .account
            .apply_fill("BTCUSDT", OrderSide::Sell, quantity, 49_000.0, 0.0)
            .await
            .unwrap();
        let cash_before = h.agent.account.snapshot().await.cash;

        // The agent's own stop fires next cycle; nothing is left to book.
        h.hub.cache().set_price("BTCUSDT", crate::types::PricePoint::now(48_500.0)).await.unwrap();
        h.agent.cycle().await.unwrap();

        assert!(h.agent.position.is_none());
        assert_eq!(h.agent.total_trades, 0);
        assert_eq!(h.agent.realized_pnl, 0.0);
        assert_eq!(h.agent.account.snapshot().await.cash, cash_before);
        assert!(h.store.trades_for(bot_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_external_reduction_books_remainder_only() {
        let mut h = harness().await;
        seed_market(&h.hub, 50_000.0).await;
        h.agent.cycle().await.unwrap();
        let quantity = h.agent.position.as_ref().unwrap().quantity;

        // A breaker force-reduced half the holding.
        h.agent
            .account
            .apply_fill("BTCUSDT", OrderSide::Sell, quantity / 2.0, 50_000.0, 0.0)
            .await
            .unwrap();

        h.hub.cache().set_price("BTCUSDT", crate::types::PricePoint::now(48_500.0)).await.unwrap();
        h.agent.cycle().await.unwrap();

        assert!(h.agent.position.is_none());
        assert_eq!(h.agent.total_trades, 1);
        let trades = h.store.trades_for(h.agent.config.bot_id).await;
        assert!((trades[0].quantity - quantity / 2.0).abs() < 1e-12);
        assert_eq!(h.agent.account.snapshot().await.held_quantity("BTCUSDT"), 0.0);
    }
}
