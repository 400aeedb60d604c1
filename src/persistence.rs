//! Persistence collaborator.
//!
//! Configs and state snapshots as JSON files under a data directory, trades
//! as an append-only JSON-lines log. The orchestrator persists on every
//! stop and on a periodic save loop; `get_all_configs` feeds startup
//! restore. `InMemoryStore` backs the tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agent::config::AgentConfig;
use crate::agent::position::ClosedTrade;
use crate::agent::AgentRuntimeState;
use crate::error::OrchestratorError;

type Result<T> = std::result::Result<T, OrchestratorError>;

fn persistence_err(e: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Persistence(e.to_string())
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_config(&self, config: &AgentConfig) -> Result<()>;
    async fn get_all_configs(&self, active_only: bool) -> Result<Vec<AgentConfig>>;
    async fn update_status(&self, bot_id: Uuid, running: bool, active: bool) -> Result<()>;
    async fn save_state(&self, bot_id: Uuid, state: &AgentRuntimeState) -> Result<()>;
    async fn get_latest_state(&self, bot_id: Uuid) -> Result<Option<AgentRuntimeState>>;
    async fn record_trade(&self, bot_id: Uuid, trade: &ClosedTrade) -> Result<()>;
    async fn remove_config(&self, bot_id: Uuid) -> Result<()>;
}

/// JSON files on disk: `configs/{bot_id}.json`, `states/{bot_id}.json`,
/// `trades/{bot_id}.jsonl`.
pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        for sub in ["configs", "states", "trades"] {
            fs::create_dir_all(data_dir.join(sub)).map_err(persistence_err)?;
        }
        Ok(Self { data_dir })
    }

    fn config_path(&self, bot_id: Uuid) -> PathBuf {
        self.data_dir.join("configs").join(format!("{}.json", bot_id))
    }

    fn state_path(&self, bot_id: Uuid) -> PathBuf {
        self.data_dir.join("states").join(format!("{}.json", bot_id))
    }

    fn trades_path(&self, bot_id: Uuid) -> PathBuf {
        self.data_dir.join("trades").join(format!("{}.jsonl", bot_id))
    }
}

#[async_trait]
impl Persistence for JsonFileStore {
    async fn save_config(&self, config: &AgentConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config).map_err(persistence_err)?;
        fs::write(self.config_path(config.bot_id), json).map_err(persistence_err)
    }

    async fn get_all_configs(&self, active_only: bool) -> Result<Vec<AgentConfig>> {
        let mut configs = Vec::new();
        let dir = fs::read_dir(self.data_dir.join("configs")).map_err(persistence_err)?;
        for entry in dir {
            let path = entry.map_err(persistence_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(persistence_err)?;
            // A malformed file poisons only itself, not the whole restore.
            match serde_json::from_str::<AgentConfig>(&raw) {
                Ok(config) => {
                    if !active_only || config.is_active {
                        configs.push(config);
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), %e, "skipping malformed config");
                }
            }
        }
        configs.sort_by_key(|c| c.bot_id);
        Ok(configs)
    }

    async fn update_status(&self, bot_id: Uuid, running: bool, active: bool) -> Result<()> {
        let raw = fs::read_to_string(self.config_path(bot_id)).map_err(persistence_err)?;
        let mut config: AgentConfig = serde_json::from_str(&raw).map_err(persistence_err)?;
        config.is_running = running;
        config.is_active = active;
        self.save_config(&config).await
    }

    async fn save_state(&self, bot_id: Uuid, state: &AgentRuntimeState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).map_err(persistence_err)?;
        fs::write(self.state_path(bot_id), json).map_err(persistence_err)
    }

    async fn get_latest_state(&self, bot_id: Uuid) -> Result<Option<AgentRuntimeState>> {
        let path = self.state_path(bot_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(persistence_err)?;
        serde_json::from_str(&raw).map(Some).map_err(persistence_err)
    }

    async fn record_trade(&self, bot_id: Uuid, trade: &ClosedTrade) -> Result<()> {
        let line = serde_json::to_string(trade).map_err(persistence_err)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.trades_path(bot_id))
            .map_err(persistence_err)?;
        writeln!(file, "{}", line).map_err(persistence_err)
    }

    async fn remove_config(&self, bot_id: Uuid) -> Result<()> {
        for path in [self.config_path(bot_id), self.state_path(bot_id)] {
            if path.exists() {
                fs::remove_file(path).map_err(persistence_err)?;
            }
        }
        Ok(())
    }
}

/// Test double keeping everything in maps.
#[derive(Default)]
pub struct InMemoryStore {
    configs: Mutex<HashMap<Uuid, AgentConfig>>,
    states: Mutex<HashMap<Uuid, AgentRuntimeState>>,
    trades: Mutex<HashMap<Uuid, Vec<ClosedTrade>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trades_for(&self, bot_id: Uuid) -> Vec<ClosedTrade> {
        self.trades
            .lock()
            .await
            .get(&bot_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn save_config(&self, config: &AgentConfig) -> Result<()> {
        self.configs
            .lock()
            .await
            .insert(config.bot_id, config.clone());
        Ok(())
    }

    async fn get_all_configs(&self, active_only: bool) -> Result<Vec<AgentConfig>> {
        let mut configs: Vec<AgentConfig> = self
            .configs
            .lock()
            .await
            .values()
            .filter(|c| !active_only || c.is_active)
            .cloned()
            .collect();
        configs.sort_by_key(|c| c.bot_id);
        Ok(configs)
    }

    async fn update_status(&self, bot_id: Uuid, running: bool, active: bool) -> Result<()> {
        let mut configs = self.configs.lock().await;
        let config = configs
            .get_mut(&bot_id)
            .ok_or(OrchestratorError::UnknownBot(bot_id))?;
        config.is_running = running;
        config.is_active = active;
        Ok(())
    }

    async fn save_state(&self, bot_id: Uuid, state: &AgentRuntimeState) -> Result<()> {
        self.states.lock().await.insert(bot_id, state.clone());
        Ok(())
    }

    async fn get_latest_state(&self, bot_id: Uuid) -> Result<Option<AgentRuntimeState>> {
        Ok(self.states.lock().await.get(&bot_id).cloned())
    }

    async fn record_trade(&self, bot_id: Uuid, trade: &ClosedTrade) -> Result<()> {
        self.trades
            .lock()
            .await
            .entry(bot_id)
            .or_default()
            .push(trade.clone());
        Ok(())
    }

    async fn remove_config(&self, bot_id: Uuid) -> Result<()> {
        self.configs.lock().await.remove(&bot_id);
        self.states.lock().await.remove(&bot_id);
        Ok(())
    }
}
