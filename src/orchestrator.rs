//! Bot orchestrator: agent lifecycle, restore, and periodic persistence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::account::Account;
use crate::agent::{AgentConfig, AgentRuntimeState, TradingAgent};
use crate::error::OrchestratorError;
use crate::execution::ExecutionClient;
use crate::hub::MarketDataHub;
use crate::persistence::Persistence;
use crate::risk::governor::RiskGovernor;
use crate::strategy::StrategyRegistry;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(30);

struct BotEntry {
    config: AgentConfig,
    state_rx: watch::Receiver<AgentRuntimeState>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl BotEntry {
    fn is_running(&self) -> bool {
        self.task.is_some()
    }
}

pub struct Orchestrator {
    hub: Arc<MarketDataHub>,
    governor: Arc<RiskGovernor>,
    execution: Arc<dyn ExecutionClient>,
    account: Arc<Account>,
    persistence: Arc<dyn Persistence>,
    registry: StrategyRegistry,
    bots: Mutex<HashMap<Uuid, BotEntry>>,
    save_task: Mutex<Option<JoinHandle<()>>>,
    save_shutdown_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        hub: Arc<MarketDataHub>,
        governor: Arc<RiskGovernor>,
        execution: Arc<dyn ExecutionClient>,
        account: Arc<Account>,
        persistence: Arc<dyn Persistence>,
        registry: StrategyRegistry,
    ) -> Self {
        let (save_shutdown_tx, _) = watch::channel(false);
        Self {
            hub,
            governor,
            execution,
            account,
            persistence,
            registry,
            bots: Mutex::new(HashMap::new()),
            save_task: Mutex::new(None),
            save_shutdown_tx,
        }
    }

    /// Validate and register a new bot. The config is persisted; the agent
    /// is not started.
    pub async fn create_bot(&self, config: AgentConfig) -> Result<Uuid, OrchestratorError> {
        config.validate()?;
        // Fails fast on unknown strategies and bad params.
        self.registry
            .build(&config.strategy_name, &config.strategy_params)?;

        self.persistence.save_config(&config).await?;

        let bot_id = config.bot_id;
        let (_, state_rx) = watch::channel(AgentRuntimeState::initial(config.capital));
        self.bots.lock().await.insert(
            bot_id,
            BotEntry {
                config,
                state_rx,
                shutdown_tx: None,
                task: None,
            },
        );
        info!(%bot_id, "Bot created");
        Ok(bot_id)
    }

    pub async fn start_bot(&self, bot_id: Uuid) -> Result<(), OrchestratorError> {
        let mut bots = self.bots.lock().await;
        let entry = bots
            .get_mut(&bot_id)
            .ok_or(OrchestratorError::UnknownBot(bot_id))?;
        if entry.is_running() {
            return Err(OrchestratorError::AlreadyRunning(bot_id));
        }

        let strategy = self
            .registry
            .build(&entry.config.strategy_name, &entry.config.strategy_params)?;

        let (agent, state_rx) = TradingAgent::new(
            entry.config.clone(),
            strategy,
            self.hub.clone(),
            self.governor.clone(),
            self.execution.clone(),
            self.account.clone(),
            self.persistence.clone(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(agent.run(shutdown_rx));

        entry.state_rx = state_rx;
        entry.shutdown_tx = Some(shutdown_tx);
        entry.task = Some(task);
        entry.config.is_running = true;
        drop(bots);

        self.persistence.update_status(bot_id, true, true).await?;
        info!(%bot_id, "Bot started");
        Ok(())
    }

    /// Stop a running agent. The agent closes any open position before its
    /// task exits; the final state snapshot is persisted afterwards.
    pub async fn stop_bot(&self, bot_id: Uuid) -> Result<(), OrchestratorError> {
        let (shutdown_tx, task) = {
            let mut bots = self.bots.lock().await;
            let entry = bots
                .get_mut(&bot_id)
                .ok_or(OrchestratorError::UnknownBot(bot_id))?;
            entry.config.is_running = false;
            (entry.shutdown_tx.take(), entry.task.take())
        };

        if let (Some(shutdown_tx), Some(task)) = (shutdown_tx, task) {
            let _ = shutdown_tx.send(true);
            if tokio::time::timeout(STOP_TIMEOUT, task).await.is_err() {
                warn!(%bot_id, "Agent did not stop within timeout");
            }
        }

        let state = {
            let bots = self.bots.lock().await;
            bots.get(&bot_id).map(|e| e.state_rx.borrow().clone())
        };
        if let Some(state) = state {
            self.persistence.save_state(bot_id, &state).await?;
        }
        self.persistence.update_status(bot_id, false, true).await?;
        info!(%bot_id, "Bot stopped");
        Ok(())
    }

    pub async fn remove_bot(&self, bot_id: Uuid) -> Result<(), OrchestratorError> {
        let running = {
            let bots = self.bots.lock().await;
            bots.get(&bot_id)
                .ok_or(OrchestratorError::UnknownBot(bot_id))?
                .is_running()
        };
        if running {
            self.stop_bot(bot_id).await?;
        }
        self.bots.lock().await.remove(&bot_id);
        self.persistence.remove_config(bot_id).await?;
        info!(%bot_id, "Bot removed");
        Ok(())
    }

    /// Restore previously-registered bots at startup. A malformed config or
    /// unknown strategy skips that single bot; the rest are restored.
    /// Bots persisted as running are auto-started.
    pub async fn restore(&self) -> Result<usize, OrchestratorError> {
        let configs = self.persistence.get_all_configs(true).await?;
        let mut restored = 0;
        let mut to_start = Vec::new();

        for config in configs {
            let bot_id = config.bot_id;
            if let Err(e) = config.validate() {
                warn!(%bot_id, error = %e, "Skipping invalid persisted config");
                continue;
            }
            if let Err(e) = self
                .registry
                .build(&config.strategy_name, &config.strategy_params)
            {
                warn!(%bot_id, error = %e, "Skipping config with unusable strategy");
                continue;
            }

            let should_start = config.is_running;
            let (_, state_rx) = watch::channel(AgentRuntimeState::initial(config.capital));
            self.bots.lock().await.insert(
                bot_id,
                BotEntry {
                    config,
                    state_rx,
                    shutdown_tx: None,
                    task: None,
                },
            );
            restored += 1;
            if should_start {
                to_start.push(bot_id);
            }
        }

        for bot_id in to_start {
            if let Err(e) = self.start_bot(bot_id).await {
                error!(%bot_id, error = %e, "Failed to auto-start restored bot");
            }
        }

        info!(restored, "Restore complete");
        Ok(restored)
    }

    /// Latest runtime snapshot for one bot.
    pub async fn bot_stats(&self, bot_id: Uuid) -> Result<AgentRuntimeState, OrchestratorError> {
        let bots = self.bots.lock().await;
        bots.get(&bot_id)
            .map(|e| e.state_rx.borrow().clone())
            .ok_or(OrchestratorError::UnknownBot(bot_id))
    }

    pub async fn list_bots(&self) -> Vec<(Uuid, AgentConfig, bool)> {
        let bots = self.bots.lock().await;
        let mut list: Vec<_> = bots
            .values()
            .map(|e| (e.config.bot_id, e.config.clone(), e.is_running()))
            .collect();
        list.sort_by_key(|(id, _, _)| *id);
        list
    }

    /// Spawn the periodic save-state loop for running bots.
    pub async fn start_save_loop(self: &Arc<Self>, interval: Duration) {
        let orchestrator = Arc::clone(self);
        let mut shutdown_rx = self.save_shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        orchestrator.save_running_states().await;
                    }
                }
            }
        });
        *self.save_task.lock().await = Some(handle);
    }

    async fn save_running_states(&self) {
        let snapshots: Vec<(Uuid, AgentRuntimeState)> = {
            let bots = self.bots.lock().await;
            bots.iter()
                .filter(|(_, e)| e.is_running())
                .map(|(id, e)| (*id, e.state_rx.borrow().clone()))
                .collect()
        };
        for (bot_id, state) in snapshots {
            if let Err(e) = self.persistence.save_state(bot_id, &state).await {
                warn!(%bot_id, error = %e, "Periodic save failed");
            }
        }
    }

    /// Full shutdown: stop every agent (closing positions), persist, stop
    /// the risk monitor, close the hub.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");

        let _ = self.save_shutdown_tx.send(true);
        if let Some(handle) = self.save_task.lock().await.take() {
            let _ = handle.await;
        }

        let ids: Vec<Uuid> = self.bots.lock().await.keys().copied().collect();
        for bot_id in ids {
            if let Err(e) = self.stop_bot(bot_id).await {
                error!(%bot_id, error = %e, "Failed to stop bot during shutdown");
            }
        }

        self.governor.stop_monitor().await;
        self.hub.close().await;
        info!("Orchestrator shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::PaperExecutionClient;
    use crate::hub::HubConfig;
    use crate::persistence::InMemoryStore;
    use crate::risk::limits::RiskLimits;

    fn test_setup() -> (Arc<Orchestrator>, Arc<InMemoryStore>) {
        let hub = Arc::new(MarketDataHub::new(HubConfig::default()));
        let account = Arc::new(Account::new(100_000.0));
        let execution = Arc::new(PaperExecutionClient::new(hub.cache()));
        let governor = Arc::new(RiskGovernor::new(
            account.clone(),
            RiskLimits::default(),
            execution.clone(),
            None,
        ));
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            hub,
            governor,
            execution,
            account,
            store.clone(),
            StrategyRegistry::new(),
        ));
        (orchestrator, store)
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_strategy() {
        let (orchestrator, _) = test_setup();
        let config = AgentConfig::new("x", "BTCUSDT", "no_such_strategy", 1_000.0);
        let err = orchestrator.create_bot(config).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownStrategy(_)));
    }

    #[tokio::test]
    async fn test_create_start_stop_lifecycle() {
        let (orchestrator, _) = test_setup();
        let config = AgentConfig::new("btc", "BTCUSDT", "momentum", 10_000.0);
        let bot_id = orchestrator.create_bot(config).await.unwrap();

        let bots = orchestrator.list_bots().await;
        assert_eq!(bots.len(), 1);
        assert!(!bots[0].2, "created bot must not be running");

        orchestrator.start_bot(bot_id).await.unwrap();
        assert!(orchestrator.list_bots().await[0].2);
        assert!(matches!(
            orchestrator.start_bot(bot_id).await,
            Err(OrchestratorError::AlreadyRunning(_))
        ));

        orchestrator.stop_bot(bot_id).await.unwrap();
        assert!(!orchestrator.list_bots().await[0].2);
        let stats = orchestrator.bot_stats(bot_id).await.unwrap();
        assert!(!stats.running);
    }

    #[tokio::test]
    async fn test_unknown_bot_operations_fail() {
        let (orchestrator, _) = test_setup();
        let bogus = Uuid::new_v4();
        assert!(matches!(
            orchestrator.start_bot(bogus).await,
            Err(OrchestratorError::UnknownBot(_))
        ));
        assert!(matches!(
            orchestrator.stop_bot(bogus).await,
            Err(OrchestratorError::UnknownBot(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_starts_active_running_bots() {
        let (orchestrator, store) = test_setup();

        // Three active-and-running configs, one inactive.
        for name in ["a", "b", "c"] {
            let mut config = AgentConfig::new(name, "BTCUSDT", "momentum", 1_000.0);
            config.is_running = true;
            store.save_config(&config).await.unwrap();
        }
        let mut inactive = AgentConfig::new("d", "ETHUSDT", "momentum", 1_000.0);
        inactive.is_active = false;
        inactive.is_running = true;
        store.save_config(&inactive).await.unwrap();

        let restored = orchestrator.restore().await.unwrap();
        assert_eq!(restored, 3);

        let bots = orchestrator.list_bots().await;
        assert_eq!(bots.len(), 3);
        assert!(bots.iter().all(|(_, _, running)| *running));
    }

    #[tokio::test]
    async fn test_restore_skips_unknown_strategy() {
        let (orchestrator, store) = test_setup();

        let good = AgentConfig::new("good", "BTCUSDT", "momentum", 1_000.0);
        let bad = AgentConfig::new("bad", "ETHUSDT", "vanished", 1_000.0);
        store.save_config(&good).await.unwrap();
        store.save_config(&bad).await.unwrap();

        let restored = orchestrator.restore().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(orchestrator.list_bots().await[0].1.name, "good");
    }

    #[tokio::test]
    async fn test_remove_bot_clears_persistence() {
        let (orchestrator, store) = test_setup();
        let config = AgentConfig::new("btc", "BTCUSDT", "momentum", 10_000.0);
        let bot_id = orchestrator.create_bot(config).await.unwrap();

        orchestrator.remove_bot(bot_id).await.unwrap();
        assert!(orchestrator.list_bots().await.is_empty());
        assert!(store.get_all_configs(false).await.unwrap().is_empty());
    }
}
