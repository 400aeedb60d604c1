//! Risk layer: pre-trade validation, sizing, stops, and circuit breakers.

pub mod breakers;
pub mod governor;
pub mod limits;
pub mod sizing;
pub mod stops;

pub use breakers::{BreakerAction, BreakerKind, CircuitBreakerEvent};
pub use governor::{OrderValidation, RiskGovernor, RiskMetrics};
pub use limits::RiskLimits;
pub use sizing::{calculate_position_size, kelly_fraction, SizingMethod};
pub use stops::{StopKind, StopLossManager, StopLossOrder, TriggeredStop};
