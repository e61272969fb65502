// Core modules
pub mod api;
pub mod config;
pub mod discovery;
pub mod execution;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use api::*;
pub use models::*;
pub use strategy::ProbabilityModel;
