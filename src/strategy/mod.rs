// Market scoring module
pub mod consensus;
pub mod manual;
pub mod momentum;

pub use consensus::ConsensusModel;
pub use manual::ManualModel;
pub use momentum::MomentumModel;

use crate::models::{Market, Outcome, PriceHistory};

/// One model's view of a market: the fair probability of YES
#[derive(Debug, Clone)]
pub struct ProbabilityEstimate {
    pub market_id: String,
    pub model: String,
    pub fair_yes: f64,
    /// How much weight the model puts on its own number, in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
}

impl ProbabilityEstimate {
    pub fn fair(&self, outcome: Outcome) -> f64 {
        match outcome {
            Outcome::Yes => self.fair_yes,
            Outcome::No => 1.0 - self.fair_yes,
        }
    }

    /// Fair value minus the quoted price for this outcome. Positive when
    /// the market is selling the outcome below fair value.
    pub fn edge(&self, outcome: Outcome, price: f64) -> f64 {
        self.fair(outcome) - price
    }
}

/// Base trait for all probability models. Implementations are handed
/// the market and its recorded price history and score it without any
/// I/O of their own.
pub trait ProbabilityModel: Send + Sync {
    /// Estimate the fair YES probability, or None when the model has no
    /// view on this market
    fn estimate(&self, market: &Market, history: &PriceHistory) -> Option<ProbabilityEstimate>;

    /// Model name for logs and estimates
    fn name(&self) -> &str;
}
