use super::{ProbabilityEstimate, ProbabilityModel};
use crate::models::{Market, PriceHistory, PricePoint};

/// Thresholds for the momentum scorer
#[derive(Debug, Clone)]
pub struct MomentumConfig {
    /// Minimum relative move over the window to count as a trend
    pub min_delta_pct: f64,
    /// Fraction of steps that must agree with the overall direction
    pub consistency_threshold: f64,
    /// Minimum observations before scoring at all
    pub min_points: usize,
    /// Skip markets priced below this (near-resolved NO)
    pub min_price: f64,
    /// Skip markets priced above this (near-resolved YES)
    pub max_price: f64,
    /// Cap on how far fair value may sit from the last price
    pub max_edge: f64,
    /// How much of the observed move is projected to continue
    pub continuation_factor: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            min_delta_pct: 0.05,
            consistency_threshold: 0.65,
            min_points: 6,
            min_price: 0.10,
            max_price: 0.90,
            max_edge: 0.10,
            continuation_factor: 0.5,
        }
    }
}

/// Trend-continuation model: a consistent directional move in the YES
/// price projects partway forward. No external data, history only.
pub struct MomentumModel {
    config: MomentumConfig,
}

impl MomentumModel {
    pub fn new(config: MomentumConfig) -> Self {
        Self { config }
    }
}

impl Default for MomentumModel {
    fn default() -> Self {
        Self::new(MomentumConfig::default())
    }
}

impl ProbabilityModel for MomentumModel {
    fn estimate(&self, market: &Market, history: &PriceHistory) -> Option<ProbabilityEstimate> {
        let cfg = &self.config;
        let points = &history.yes;
        if points.len() < cfg.min_points {
            return None;
        }

        let first = points.first()?.price;
        let last = points.last()?.price;
        if first <= 0.0 {
            return None;
        }
        if last < cfg.min_price || last > cfg.max_price {
            return None;
        }

        let delta_pct = (last - first) / first;
        if delta_pct.abs() < cfg.min_delta_pct {
            return None;
        }

        let consistency = step_consistency(points, delta_pct > 0.0)?;
        if consistency < cfg.consistency_threshold {
            return None;
        }

        let projected = last * (1.0 + delta_pct * cfg.continuation_factor);
        let fair_yes = projected
            .clamp(last - cfg.max_edge, last + cfg.max_edge)
            .clamp(0.02, 0.98);

        let strength = (delta_pct.abs() / (cfg.min_delta_pct * 2.0)).min(1.0);
        let confidence = (consistency * strength).min(0.9);

        Some(ProbabilityEstimate {
            market_id: market.id.clone(),
            model: self.name().to_string(),
            fair_yes,
            confidence,
            reasoning: format!(
                "{:+.1}% move with {:.0}% consistency",
                delta_pct * 100.0,
                consistency * 100.0
            ),
        })
    }

    fn name(&self) -> &str {
        "momentum"
    }
}

/// Fraction of nonzero steps that move in the trend direction.
/// None when every step is flat.
fn step_consistency(points: &[PricePoint], upward: bool) -> Option<f64> {
    let mut moves = 0usize;
    let mut agreeing = 0usize;
    for pair in points.windows(2) {
        let step = pair[1].price - pair[0].price;
        if step == 0.0 {
            continue;
        }
        moves += 1;
        if (step > 0.0) == upward {
            agreeing += 1;
        }
    }
    if moves == 0 {
        return None;
    }
    Some(agreeing as f64 / moves as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{test_market, PricePoint};
    use chrono::{Duration, Utc};

    fn history_from(prices: &[f64]) -> PriceHistory {
        let start = Utc::now() - Duration::hours(prices.len() as i64);
        let yes = prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PricePoint {
                market: "0xmkt-yes".to_string(),
                price,
                recorded_at: start + Duration::hours(i as i64),
            })
            .collect();
        PriceHistory {
            yes,
            no: Vec::new(),
        }
    }

    #[test]
    fn test_steady_uptrend_scores() {
        let model = MomentumModel::default();
        let market = test_market("0xmkt", 0.55);
        let history = history_from(&[0.40, 0.42, 0.44, 0.45, 0.47, 0.50]);

        let estimate = model.estimate(&market, &history).unwrap();
        // 25% move projected halfway forward, capped at last + max_edge
        assert!(estimate.fair_yes > 0.50);
        assert!(estimate.fair_yes <= 0.60 + 1e-9);
        assert!(estimate.confidence > 0.5);
        assert!(estimate.reasoning.contains("+25.0%"));
    }

    #[test]
    fn test_projection_capped_at_max_edge() {
        let model = MomentumModel::default();
        let market = test_market("0xmkt", 0.80);
        // 60% move would project far past the cap
        let history = history_from(&[0.50, 0.56, 0.62, 0.68, 0.74, 0.80]);

        let estimate = model.estimate(&market, &history).unwrap();
        assert!((estimate.fair_yes - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_flat_market_gives_no_view() {
        let model = MomentumModel::default();
        let market = test_market("0xmkt", 0.50);
        let history = history_from(&[0.50, 0.50, 0.51, 0.50, 0.50, 0.51]);

        assert!(model.estimate(&market, &history).is_none());
    }

    #[test]
    fn test_choppy_trend_gives_no_view() {
        let model = MomentumModel::default();
        let market = test_market("0xmkt", 0.50);
        // Net move is there but half the steps fight it
        let history = history_from(&[0.40, 0.48, 0.42, 0.50, 0.43, 0.45]);

        assert!(model.estimate(&market, &history).is_none());
    }

    #[test]
    fn test_short_history_gives_no_view() {
        let model = MomentumModel::default();
        let market = test_market("0xmkt", 0.50);
        let history = history_from(&[0.40, 0.50]);

        assert!(model.estimate(&market, &history).is_none());
    }

    #[test]
    fn test_near_resolved_market_skipped() {
        let model = MomentumModel::default();
        let market = test_market("0xmkt", 0.93);
        let history = history_from(&[0.80, 0.83, 0.85, 0.88, 0.91, 0.93]);

        assert!(model.estimate(&market, &history).is_none());
    }

    #[test]
    fn test_downtrend_projects_lower() {
        let model = MomentumModel::default();
        let market = test_market("0xmkt", 0.40);
        let history = history_from(&[0.50, 0.48, 0.46, 0.44, 0.42, 0.40]);

        let estimate = model.estimate(&market, &history).unwrap();
        assert!(estimate.fair_yes < 0.40);
        assert!(estimate.fair_yes >= 0.30 - 1e-9);
        assert!(estimate.reasoning.contains("-20.0%"));
    }
}
