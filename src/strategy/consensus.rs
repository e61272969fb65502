use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{ProbabilityEstimate, ProbabilityModel};
use crate::api::Gateway;
use crate::models::{Market, PriceHistory};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TTL_SECS: u64 = 300;
/// Books needed before the model trusts the average outright
const FULL_CONFIDENCE_BOOKS: usize = 8;

#[derive(Debug, Deserialize)]
struct ConsensusResponse {
    books: Vec<BookOdds>,
}

#[derive(Debug, Deserialize)]
struct BookOdds {
    #[serde(default)]
    #[allow(dead_code)]
    name: String,
    /// Decimal odds quoted for the YES outcome
    yes: f64,
}

#[derive(Debug, Clone)]
struct CachedConsensus {
    fair_yes: f64,
    books: usize,
    fetched_at: Instant,
}

/// Fair value from an external odds aggregator: implied probabilities
/// averaged across books. Fetching happens in `refresh` (paced by its
/// own gateway); `estimate` only reads the cache, so scoring stays
/// synchronous and a dead aggregator just means no view.
pub struct ConsensusModel {
    client: reqwest::Client,
    gate: Arc<Gateway>,
    base_url: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedConsensus>>,
}

impl ConsensusModel {
    pub fn new(base_url: impl Into<String>, gate: Arc<Gateway>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create consensus HTTP client")?;

        Ok(Self {
            client,
            gate,
            base_url: base_url.into(),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Fetch fresh odds for a market unless the cache still covers it.
    /// Returns true when a fetch actually happened.
    pub async fn refresh(&self, market: &Market) -> Result<bool> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(&market.id) {
                if entry.fetched_at.elapsed() <= self.ttl {
                    return Ok(false);
                }
            }
        }

        let url = format!("{}/consensus?market={}", self.base_url, market.slug);
        let response = self
            .gate
            .invoke(self.client.get(&url).send())
            .await
            .with_context(|| format!("Consensus request failed for {}", market.slug))?;

        if !response.status().is_success() {
            bail!(
                "Consensus request for {} returned {}",
                market.slug,
                response.status()
            );
        }

        let parsed: ConsensusResponse = response
            .json()
            .await
            .context("Invalid consensus response")?;

        // Decimal odds at or below 1.0 are junk
        let implied: Vec<f64> = parsed
            .books
            .iter()
            .filter(|b| b.yes > 1.0)
            .map(|b| 1.0 / b.yes)
            .collect();

        let entry = if implied.is_empty() {
            tracing::debug!("No usable consensus odds for {}", market.slug);
            CachedConsensus {
                fair_yes: 0.0,
                books: 0,
                fetched_at: Instant::now(),
            }
        } else {
            let fair = implied.iter().sum::<f64>() / implied.len() as f64;
            CachedConsensus {
                fair_yes: fair.clamp(0.01, 0.99),
                books: implied.len(),
                fetched_at: Instant::now(),
            }
        };

        self.cache
            .lock()
            .unwrap()
            .insert(market.id.clone(), entry);
        Ok(true)
    }
}

impl ProbabilityModel for ConsensusModel {
    fn estimate(&self, market: &Market, _history: &PriceHistory) -> Option<ProbabilityEstimate> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(&market.id)?;
        if entry.fetched_at.elapsed() > self.ttl || entry.books == 0 {
            return None;
        }

        Some(ProbabilityEstimate {
            market_id: market.id.clone(),
            model: self.name().to_string(),
            fair_yes: entry.fair_yes,
            confidence: (entry.books as f64 / FULL_CONFIDENCE_BOOKS as f64).min(1.0),
            reasoning: format!("consensus of {} books", entry.books),
        })
    }

    fn name(&self) -> &str {
        "consensus"
    }
}
