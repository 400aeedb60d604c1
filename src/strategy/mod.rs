//! Strategy plug-in contract and registry.
//!
//! A strategy is a pure function of the candle window: deterministic and
//! side-effect free. Construction goes through an explicit name-to-builder
//! registry validated at bot-creation time, so a bad strategy name is a
//! typed error instead of a silent fallthrough.

pub mod momentum;

use std::collections::HashMap;

use crate::error::OrchestratorError;
use crate::types::Candle;

/// Direction of a strategy signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Buy,
    Sell,
    Hold,
}

/// Output of one `analyze` call.
#[derive(Debug, Clone)]
pub struct StrategySignal {
    pub signal: SignalKind,
    /// 0..1; the agent rejects signals below its configured minimum.
    pub confidence: f64,
    pub reason: String,
}

impl StrategySignal {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            signal: SignalKind::Hold,
            confidence: 0.0,
            reason: reason.into(),
        }
    }
}

/// The plug-in contract every trading strategy implements.
///
/// `analyze` must be deterministic given the same window and must not
/// perform I/O; the agent depends only on this trait.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn analyze(&self, candles: &[Candle], symbol: &str) -> StrategySignal;

    /// Effective parameters, for persistence and diagnostics.
    fn params(&self) -> serde_json::Value {
        serde_json::json!({})
    }
}

/// Constructor for a registered strategy.
pub type StrategyCtor =
    fn(&serde_json::Value) -> Result<Box<dyn Strategy>, OrchestratorError>;

/// Explicit compile-time map from strategy name to constructor.
pub struct StrategyRegistry {
    ctors: HashMap<String, StrategyCtor>,
}

impl StrategyRegistry {
    /// Registry with the built-in strategies.
    pub fn new() -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
        };
        registry.register("momentum", momentum::build);
        registry
    }

    /// Empty registry, for callers that wire their own set.
    pub fn empty() -> Self {
        Self {
            ctors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, ctor: StrategyCtor) {
        self.ctors.insert(name.to_string(), ctor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Build a strategy instance; unknown names are a typed error.
    pub fn build(
        &self,
        name: &str,
        params: &serde_json::Value,
    ) -> Result<Box<dyn Strategy>, OrchestratorError> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| OrchestratorError::UnknownStrategy(name.to_string()))?;
        ctor(params)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.ctors.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builds_builtin() {
        let registry = StrategyRegistry::new();
        assert!(registry.contains("momentum"));

        let strategy = registry
            .build("momentum", &serde_json::json!({}))
            .unwrap();
        assert_eq!(strategy.name(), "momentum");
    }

    #[test]
    fn test_unknown_strategy_is_typed_error() {
        let registry = StrategyRegistry::new();
        let result = registry.build("does-not-exist", &serde_json::json!({}));
        assert!(matches!(
            result,
            Err(OrchestratorError::UnknownStrategy(name)) if name == "does-not-exist"
        ));
    }
}
