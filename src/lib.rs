// Library crate - multi-agent trading system components

pub mod account;
pub mod agent;
pub mod audit;
pub mod error;
pub mod execution;
pub mod hub;
pub mod orchestrator;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use account::{Account, PortfolioSnapshot};
pub use agent::{AgentConfig, AgentRuntimeState, TradingAgent};
pub use hub::{HubConfig, MarketDataHub};
pub use orchestrator::Orchestrator;
pub use risk::{RiskGovernor, RiskLimits};
pub use types::{Candle, OrderSide, PricePoint, Side};
