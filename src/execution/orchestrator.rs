use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::{Arc, Mutex};

use crate::api::Exchange;
use crate::execution::order_tracker::OrderTracker;
use crate::execution::portfolio::PositionBook;
use crate::models::{Order, Quote, Side, TradeIntent};
use crate::persistence::{kv_keys, SqlitePersistence};
use crate::risk::{CircuitBreakers, SafetyState, TradeGuards};

/// Where a submitted intent ended up
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    Placed { order_id: String },
    Rejected { reason: String },
}

impl TradeOutcome {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Single entry point for orders. Every entry runs the guard chain
/// (kill switch, static guards, circuit breakers, intent dedup) before
/// the exchange is touched; exits skip the entry guards so the book can
/// always be flattened. Positions are never mutated here; they change
/// only when fills come back through the consumer.
pub struct Orchestrator {
    exchange: Arc<dyn Exchange>,
    store: Arc<SqlitePersistence>,
    tracker: Arc<OrderTracker>,
    book: Arc<Mutex<PositionBook>>,
    safety: Arc<SafetyState>,
    guards: TradeGuards,
    breakers: CircuitBreakers,
    intent_ttl_secs: i64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<SqlitePersistence>,
        tracker: Arc<OrderTracker>,
        book: Arc<Mutex<PositionBook>>,
        safety: Arc<SafetyState>,
        guards: TradeGuards,
        breakers: CircuitBreakers,
        intent_ttl_secs: i64,
    ) -> Self {
        Self {
            exchange,
            store,
            tracker,
            book,
            safety,
            guards,
            breakers,
            intent_ttl_secs,
        }
    }

    /// Open or extend a position. `quote` is the book snapshot the
    /// intent was priced from; rejections cost no API call.
    pub async fn submit_entry(&self, intent: TradeIntent, quote: &Quote) -> Result<TradeOutcome> {
        if self.safety.kill_switch_active() {
            return Ok(TradeOutcome::rejected("kill switch is engaged"));
        }

        self.roll_day_if_needed().await?;

        let exposure = self.book.lock().unwrap().total_exposure();
        if let Err(violation) = self.guards.check_entry(&intent, exposure, quote) {
            tracing::info!("Intent {} rejected: {}", intent.id, violation);
            return Ok(TradeOutcome::rejected(violation.to_string()));
        }

        if let Err(trip) = self.breakers.check(&self.safety.trading_state()) {
            self.engage_kill_switch(&trip.to_string()).await?;
            return Ok(TradeOutcome::rejected(trip.to_string()));
        }

        if !self
            .store
            .register_intent(&intent, self.intent_ttl_secs)
            .await?
        {
            tracing::info!("Intent {} is a duplicate, skipping", intent.id);
            return Ok(TradeOutcome::rejected("duplicate intent"));
        }

        let order_id = self
            .place(&intent.market, intent.side, intent.size, intent.limit_price)
            .await?;

        let order = Order::new(
            order_id.clone(),
            intent.market.clone(),
            intent.outcome,
            intent.side,
            intent.size,
            intent.limit_price,
        );
        self.tracker.track(order).await?;
        self.safety.record_trade();

        tracing::info!(
            "💹 Entry placed: {} {} {:.2} @ {:.4} ({})",
            intent.side.as_str(),
            intent.market,
            intent.size,
            intent.limit_price,
            intent.reason
        );
        Ok(TradeOutcome::Placed { order_id })
    }

    /// Close (part of) a position. Runs regardless of the kill switch
    /// and skips entry guards; the size is clamped to what is held.
    pub async fn submit_exit(
        &self,
        position_key: &str,
        size: f64,
        limit_price: f64,
        reason: &str,
    ) -> Result<TradeOutcome> {
        let (market, outcome, held) = {
            let book = self.book.lock().unwrap();
            match book.get_open(position_key) {
                Some(p) => (p.market.clone(), p.outcome, p.size),
                None => {
                    return Ok(TradeOutcome::rejected(format!(
                        "no open position for {}",
                        position_key
                    )))
                }
            }
        };

        let size = size.min(held);
        if size <= 0.0 {
            return Ok(TradeOutcome::rejected("nothing to exit"));
        }
        let limit_price = limit_price.clamp(0.01, 0.99);

        let order_id = self.place(&market, Side::Sell, size, limit_price).await?;
        let order = Order::new(order_id.clone(), market.clone(), outcome, Side::Sell, size, limit_price);
        self.tracker.track(order).await?;

        tracing::info!(
            "📉 Exit placed: {} {:.2} @ {:.4} ({})",
            position_key,
            size,
            limit_price,
            reason
        );
        Ok(TradeOutcome::Placed { order_id })
    }

    /// Submit through the exchange, keeping the consecutive error count
    /// honest on both outcomes
    async fn place(&self, market: &str, side: Side, size: f64, price: f64) -> Result<String> {
        match self.exchange.submit_order(market, side, size, price).await {
            Ok(order_id) => {
                self.safety.clear_errors();
                Ok(order_id)
            }
            Err(err) => {
                let count = self.safety.record_error();
                if count >= self.breakers.max_consecutive_errors {
                    self.engage_kill_switch(&format!("{} consecutive errors", count))
                        .await?;
                }
                Err(err).with_context(|| format!("Failed to submit {} order on {}", side.as_str(), market))
            }
        }
    }

    async fn engage_kill_switch(&self, reason: &str) -> Result<()> {
        self.safety.engage_kill_switch(reason);
        self.store.set_state(kv_keys::KILL_SWITCH, "true").await?;
        Ok(())
    }

    /// Reset daily limits on the first action of a new UTC day
    async fn roll_day_if_needed(&self) -> Result<()> {
        let today = Utc::now().date_naive();
        if self.safety.roll_day(today) {
            self.store
                .set_state(kv_keys::DAY_STAMP, &today.to_string())
                .await?;
            self.store
                .set_state(
                    kv_keys::DAY_START_REALIZED,
                    &self.safety.day_start_realized().to_string(),
                )
                .await?;
        }
        Ok(())
    }
}
