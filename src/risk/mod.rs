// Risk management module
pub mod circuit_breakers;
pub mod guards;
pub mod safety;

pub use circuit_breakers::{CircuitBreakerTrip, CircuitBreakers, TradingState};
pub use guards::{GuardViolation, TradeGuards};
pub use safety::SafetyState;
