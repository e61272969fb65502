use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use super::screen::screen_market;
use crate::api::Exchange;
use crate::execution::{Orchestrator, PositionBook, TradeOutcome};
use crate::models::{position_key, Market, Outcome, PriceHistory, Quote, Side, TradeIntent};
use crate::persistence::{kv_keys, SqlitePersistence};
use crate::risk::SafetyState;
use crate::strategy::{ConsensusModel, ProbabilityEstimate, ProbabilityModel};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How many markets to pull per scan
    pub max_candidates: usize,
    /// Minimum model edge over the offered price before entering
    pub min_edge: f64,
    /// Minimum model confidence before an estimate counts
    pub min_confidence: f64,
    /// Cap on simultaneously open positions
    pub max_open_positions: usize,
    /// Fraction of equity that is never deployed
    pub reserve_pct: f64,
    /// New entries allowed per scan cycle
    pub max_entries_per_scan: usize,
    /// Cap on a single entry's notional
    pub max_entry_notional: f64,
    /// Skip entries whose budget share falls below this
    pub min_entry_notional: f64,
    /// Price history window handed to the models
    pub history_hours: i64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_candidates: 50,
            min_edge: 0.05,
            min_confidence: 0.25,
            max_open_positions: 5,
            reserve_pct: 0.20,
            max_entries_per_scan: 2,
            max_entry_notional: 100.0,
            min_entry_notional: 5.0,
            history_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub scanned: usize,
    pub screened_out: usize,
    pub scored: usize,
    pub entered: usize,
}

/// Periodic market scan: list candidates, screen out junk, let every
/// probability model score the rest and hand the best-priced edges to
/// the orchestrator. All entries go through the orchestrator's guards;
/// the scanner itself never touches positions or the kill switch.
pub struct MarketScanner {
    exchange: Arc<dyn Exchange>,
    store: Arc<SqlitePersistence>,
    book: Arc<Mutex<PositionBook>>,
    safety: Arc<SafetyState>,
    orchestrator: Arc<Orchestrator>,
    models: Vec<Arc<dyn ProbabilityModel>>,
    consensus: Option<Arc<ConsensusModel>>,
    config: ScanConfig,
}

impl MarketScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<SqlitePersistence>,
        book: Arc<Mutex<PositionBook>>,
        safety: Arc<SafetyState>,
        orchestrator: Arc<Orchestrator>,
        models: Vec<Arc<dyn ProbabilityModel>>,
        consensus: Option<Arc<ConsensusModel>>,
        config: ScanConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            book,
            safety,
            orchestrator,
            models,
            consensus,
            config,
        }
    }

    pub async fn scan_once(&self) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();

        // Entries are blocked anyway, skip the API round trips
        if self.safety.kill_switch_active() {
            tracing::debug!("Kill switch active, skipping market scan");
            return Ok(summary);
        }

        let markets = self
            .exchange
            .list_markets(self.config.max_candidates)
            .await
            .context("Market listing failed")?;
        summary.scanned = markets.len();

        let (open_count, exposure, held) = {
            let book = self.book.lock().unwrap();
            let held: HashSet<String> = book.open_keys().into_iter().collect();
            (book.open_count(), book.total_exposure(), held)
        };

        let free_slots = self
            .config
            .max_open_positions
            .saturating_sub(open_count);
        if free_slots == 0 {
            tracing::debug!("All {} position slots in use", self.config.max_open_positions);
            self.stamp_scan().await?;
            return Ok(summary);
        }

        let equity = self.safety.equity();
        let deployable = (equity * (1.0 - self.config.reserve_pct) - exposure).max(0.0);
        let per_slot = (deployable / free_slots as f64).min(self.config.max_entry_notional);

        for market in &markets {
            let (ok, reason) = screen_market(market);
            if !ok {
                tracing::debug!("Screened out {}: {}", market.slug, reason);
                summary.screened_out += 1;
                continue;
            }

            if held.contains(&position_key(&market.token_id_yes, Outcome::Yes))
                || held.contains(&position_key(&market.token_id_no, Outcome::No))
            {
                tracing::debug!("Already holding {}, skipping", market.slug);
                continue;
            }

            self.store
                .save_price_point(&market.token_id_yes, market.price_yes)
                .await?;
            let history = PriceHistory {
                yes: self
                    .store
                    .load_price_history(&market.token_id_yes, self.config.history_hours)
                    .await?,
                no: Vec::new(),
            };

            if let Some(consensus) = &self.consensus {
                if let Err(e) = consensus.refresh(market).await {
                    tracing::warn!("Consensus refresh failed for {}: {e:#}", market.slug);
                }
            }

            let Some((estimate, outcome, entry_price)) = self.best_opportunity(market, &history)
            else {
                continue;
            };
            summary.scored += 1;

            // With the budget spent (or set to zero for a dry scan) we keep
            // scoring for the logs but stop submitting.
            if summary.entered >= self.config.max_entries_per_scan {
                tracing::info!(
                    "Would enter {} {:?} at {:.3} via {} (entry budget reached)",
                    market.slug,
                    outcome,
                    entry_price,
                    estimate.model
                );
                continue;
            }

            if per_slot < self.config.min_entry_notional {
                tracing::debug!(
                    "Budget per slot ${per_slot:.2} below floor, not entering {}",
                    market.slug
                );
                continue;
            }

            let size = (per_slot / entry_price * 100.0).floor() / 100.0;
            if size <= 0.0 {
                continue;
            }

            let quote = outcome_quote(market, outcome);
            let intent = TradeIntent::new(
                market.token_id(outcome),
                outcome,
                Side::Buy,
                size,
                entry_price,
                format!(
                    "{}: fair {:.3} vs {:.3} ({})",
                    estimate.model,
                    estimate.fair(outcome),
                    entry_price,
                    estimate.reasoning
                ),
            );

            match self.orchestrator.submit_entry(intent, &quote).await? {
                TradeOutcome::Placed { order_id } => {
                    tracing::info!(
                        "🎯 Entered {} {:?} via {} (order {})",
                        market.slug,
                        outcome,
                        estimate.model,
                        order_id
                    );
                    summary.entered += 1;
                }
                TradeOutcome::Rejected { reason } => {
                    tracing::debug!("Entry for {} rejected: {}", market.slug, reason);
                }
            }
        }

        self.stamp_scan().await?;
        tracing::info!(
            "🔍 Scan: {} markets, {} screened out, {} scored, {} entered",
            summary.scanned,
            summary.screened_out,
            summary.scored,
            summary.entered
        );
        Ok(summary)
    }

    /// Best (estimate, outcome, price) whose edge clears the bar, across
    /// all models and both outcomes. Buying NO pays the mirrored ask.
    fn best_opportunity(
        &self,
        market: &Market,
        history: &PriceHistory,
    ) -> Option<(ProbabilityEstimate, Outcome, f64)> {
        let candidates = [
            (Outcome::Yes, market.best_ask),
            (Outcome::No, 1.0 - market.best_bid),
        ];

        let mut best: Option<(ProbabilityEstimate, Outcome, f64, f64)> = None;
        for model in &self.models {
            let Some(estimate) = model.estimate(market, history) else {
                continue;
            };
            if estimate.confidence < self.config.min_confidence {
                continue;
            }

            for (outcome, price) in candidates {
                if price <= 0.0 || price >= 1.0 {
                    continue;
                }
                let edge = estimate.edge(outcome, price);
                if edge < self.config.min_edge {
                    continue;
                }
                if best.as_ref().map_or(true, |(_, _, _, b)| edge > *b) {
                    best = Some((estimate.clone(), outcome, price, edge));
                }
            }
        }

        best.map(|(estimate, outcome, price, _)| (estimate, outcome, price))
    }

    async fn stamp_scan(&self) -> Result<()> {
        self.store
            .set_state(kv_keys::LAST_SCAN_AT, &chrono::Utc::now().to_rfc3339())
            .await
    }

    /// Scan on an interval until shutdown flips.
    pub async fn run(&self, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        tracing::error!("Market scan failed: {e:#}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Market scanner stopped");
    }
}

/// Quote as seen by a buyer of the given outcome. The book is quoted in
/// YES terms; NO prices are the complement with bid and ask swapped.
fn outcome_quote(market: &Market, outcome: Outcome) -> Quote {
    match outcome {
        Outcome::Yes => Quote {
            bid: market.best_bid,
            ask: market.best_ask,
            mid: market.mid_price(),
        },
        Outcome::No => Quote {
            bid: 1.0 - market.best_ask,
            ask: 1.0 - market.best_bid,
            mid: 1.0 - market.mid_price(),
        },
    }
}
