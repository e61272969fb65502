use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use super::{ProbabilityEstimate, ProbabilityModel};
use crate::models::{Market, PriceHistory};

fn default_confidence() -> f64 {
    0.8
}

/// One hand-set probability, keyed by market slug or id in the file
#[derive(Debug, Clone, Deserialize)]
pub struct ManualEntry {
    pub fair_yes: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub note: String,
}

/// Operator-maintained probabilities from a JSON file:
/// `{ "some-market-slug": { "fair_yes": 0.62, "note": "..." } }`.
/// Keys match a market's slug or id exactly, or as a case-insensitive
/// substring of the slug so short keywords cover renamed markets.
/// Entries with probabilities outside (0, 1) are dropped at load time.
pub struct ManualModel {
    entries: HashMap<String, ManualEntry>,
}

impl ManualModel {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manual estimates from {}", path.display()))?;
        let entries: HashMap<String, ManualEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid manual estimates in {}", path.display()))?;

        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: HashMap<String, ManualEntry>) -> Self {
        let (kept, dropped): (HashMap<_, _>, HashMap<_, _>) = entries
            .into_iter()
            .partition(|(_, e)| e.fair_yes > 0.0 && e.fair_yes < 1.0);

        for (key, entry) in &dropped {
            tracing::warn!(
                "Dropping manual estimate for {}: fair_yes {} is outside (0, 1)",
                key,
                entry.fair_yes
            );
        }
        tracing::info!("Loaded {} manual estimates", kept.len());

        Self { entries: kept }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact slug, then exact id, then the longest key contained in the
    /// slug. Longest wins so "rain-london" beats "rain".
    fn lookup(&self, market: &Market) -> Option<&ManualEntry> {
        if let Some(entry) = self.entries.get(&market.slug) {
            return Some(entry);
        }
        if let Some(entry) = self.entries.get(&market.id) {
            return Some(entry);
        }

        let slug = market.slug.to_lowercase();
        self.entries
            .iter()
            .filter(|(key, _)| !key.is_empty() && slug.contains(&key.to_lowercase()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, entry)| entry)
    }
}

impl ProbabilityModel for ManualModel {
    fn estimate(&self, market: &Market, _history: &PriceHistory) -> Option<ProbabilityEstimate> {
        let entry = self.lookup(market)?;

        Some(ProbabilityEstimate {
            market_id: market.id.clone(),
            model: self.name().to_string(),
            fair_yes: entry.fair_yes,
            confidence: entry.confidence.clamp(0.0, 1.0),
            reasoning: if entry.note.is_empty() {
                "manual estimate".to_string()
            } else {
                entry.note.clone()
            },
        })
    }

    fn name(&self) -> &str {
        "manual"
    }
}
