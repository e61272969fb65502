use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::execution::exit_engine::{ExitConfig, ExitEngine};
use crate::execution::order_tracker::PendingFill;
use crate::execution::portfolio::{LedgerError, PositionBook};
use crate::models::Side;
use crate::persistence::SqlitePersistence;
use crate::risk::SafetyState;

/// Sole writer of the position book. Fills arrive on a channel (live)
/// or from the store (startup replay) and pass through the same path:
/// preview the ledger update, persist it with the applied marker, then
/// commit to the in-memory book and adjust exit directives.
pub struct FillConsumer {
    store: Arc<SqlitePersistence>,
    book: Arc<Mutex<PositionBook>>,
    exits: Arc<Mutex<ExitEngine>>,
    exit_cfg: ExitConfig,
    safety: Arc<SafetyState>,
}

impl FillConsumer {
    pub fn new(
        store: Arc<SqlitePersistence>,
        book: Arc<Mutex<PositionBook>>,
        exits: Arc<Mutex<ExitEngine>>,
        exit_cfg: ExitConfig,
        safety: Arc<SafetyState>,
    ) -> Self {
        Self {
            store,
            book,
            exits,
            exit_cfg,
            safety,
        }
    }

    /// Apply one persisted fill end to end. Safe to call twice with the
    /// same fill: the applied marker makes the second call a no-op.
    pub async fn handle(&self, pending: PendingFill) -> Result<()> {
        let preview = {
            let book = self.book.lock().unwrap();
            book.preview(&pending.event)
        };

        let update = match preview {
            Ok(update) => update,
            Err(LedgerError::NoOpenPosition { key }) => {
                // A sell we have no book side for. Retire the fill so
                // it does not replay on every restart.
                tracing::error!(
                    "Desync: sell fill {} on {} has no open position; dropping",
                    pending.id,
                    key
                );
                self.store.mark_fill_applied(pending.id).await?;
                return Ok(());
            }
        };

        if update.clamped {
            tracing::warn!(
                "Desync: sell fill of {:.2} on {} exceeds held size, clamping",
                pending.event.size,
                update.position.key
            );
        }

        let new_total = {
            let book = self.book.lock().unwrap();
            book.realized_total() + update.realized_delta
        };

        // Durable first. A false return means this fill was already
        // folded in (restart replay racing a live send).
        if !self
            .store
            .apply_fill(pending.id, &update.position, new_total)
            .await?
        {
            tracing::debug!("Fill {} already applied, skipping", pending.id);
            return Ok(());
        }

        self.book.lock().unwrap().commit(&update);
        if update.realized_delta != 0.0 {
            self.safety.record_realized(update.realized_delta);
        }

        match pending.event.side {
            Side::Buy => {
                tracing::info!(
                    "📈 Position {}: {:.2} @ {:.4} avg",
                    update.position.key,
                    update.position.size,
                    update.position.avg_entry_price
                );
                let armed = self
                    .exits
                    .lock()
                    .unwrap()
                    .arm(&update.position, &self.exit_cfg);
                if let Some(directive) = armed {
                    self.store.upsert_auto_order(&directive).await?;
                }
            }
            Side::Sell => {
                if update.closed {
                    tracing::info!(
                        "💰 Position {} closed, realized ${:+.2}",
                        update.position.key,
                        update.position.realized_pnl
                    );
                    let cancelled = self.exits.lock().unwrap().cancel(&update.position.key);
                    if let Some(directive) = cancelled {
                        self.store.upsert_auto_order(&directive).await?;
                    }
                } else {
                    tracing::info!(
                        "Position {} reduced to {:.2} (realized ${:+.2} on this fill)",
                        update.position.key,
                        update.position.size,
                        update.realized_delta
                    );
                }
            }
        }

        Ok(())
    }

    /// Fold in fills that were persisted but never applied (crash
    /// between write and apply). Runs once at startup, before any
    /// worker starts producing.
    pub async fn replay_unapplied(&self) -> Result<usize> {
        let pending = self.store.load_unapplied_fills().await?;
        let count = pending.len();
        if count > 0 {
            tracing::info!("Replaying {} unapplied fills", count);
        }

        for (id, event) in pending {
            self.handle(PendingFill { id, event }).await?;
        }
        Ok(count)
    }

    /// Consume fills until the channel closes or shutdown is signalled
    pub async fn run(&self, mut fills: mpsc::Receiver<PendingFill>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                maybe = fills.recv() => match maybe {
                    Some(pending) => {
                        if let Err(err) = self.handle(pending).await {
                            tracing::error!("Failed to apply fill: {:#}", err);
                        }
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    // A dropped sender also means we are done
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Fill consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::exit_engine::ExitPriority;
    use crate::models::{AutoOrderState, FillEvent, Order, Outcome};
    use chrono::Utc;

    struct Fixture {
        consumer: FillConsumer,
        store: Arc<SqlitePersistence>,
        book: Arc<Mutex<PositionBook>>,
        exits: Arc<Mutex<ExitEngine>>,
        safety: Arc<SafetyState>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqlitePersistence::open_in_memory().await.unwrap());
        let book = Arc::new(Mutex::new(PositionBook::new()));
        let exits = Arc::new(Mutex::new(ExitEngine::new(ExitPriority::default())));
        let safety = Arc::new(SafetyState::new(1000.0));
        let consumer = FillConsumer::new(
            store.clone(),
            book.clone(),
            exits.clone(),
            ExitConfig::default(),
            safety.clone(),
        );
        Fixture {
            consumer,
            store,
            book,
            exits,
            safety,
        }
    }

    fn fill_event(side: Side, size: f64, price: f64, cumulative: f64) -> FillEvent {
        FillEvent {
            order_id: "0xorder1".to_string(),
            market: "0xtoken1".to_string(),
            outcome: Outcome::Yes,
            side,
            size,
            price,
            cumulative_filled: cumulative,
            observed_at: Utc::now(),
        }
    }

    async fn persisted_fill(store: &SqlitePersistence, event: FillEvent) -> PendingFill {
        store
            .upsert_order(&Order::new(
                event.order_id.clone(),
                event.market.clone(),
                event.outcome,
                event.side,
                event.size,
                event.price,
            ))
            .await
            .unwrap();
        let id = store.record_fill(&event).await.unwrap().unwrap();
        PendingFill { id, event }
    }

    #[tokio::test]
    async fn test_buy_fill_reaches_book_store_and_exits() {
        let fx = fixture().await;
        let pending = persisted_fill(&fx.store, fill_event(Side::Buy, 10.0, 0.55, 10.0)).await;
        fx.consumer.handle(pending).await.unwrap();

        // Book committed
        {
            let book = fx.book.lock().unwrap();
            let position = book.get_open("0xtoken1:YES").unwrap();
            assert!((position.size - 10.0).abs() < 1e-9);
            assert!((position.avg_entry_price - 0.55).abs() < 1e-9);
        }

        // Store has the position row and no unapplied fills
        assert_eq!(fx.store.load_positions().await.unwrap().len(), 1);
        assert!(fx.store.load_unapplied_fills().await.unwrap().is_empty());

        // Exit directive armed and persisted
        assert!(fx.exits.lock().unwrap().directive("0xtoken1:YES").is_some());
        let autos = fx.store.load_active_auto_orders().await.unwrap();
        assert_eq!(autos.len(), 1);
        assert_eq!(autos[0].state, AutoOrderState::Active);
    }

    #[tokio::test]
    async fn test_same_fill_applied_once() {
        let fx = fixture().await;
        let pending = persisted_fill(&fx.store, fill_event(Side::Buy, 10.0, 0.55, 10.0)).await;

        fx.consumer.handle(pending.clone()).await.unwrap();
        fx.consumer.handle(pending).await.unwrap();

        let book = fx.book.lock().unwrap();
        let position = book.get_open("0xtoken1:YES").unwrap();
        assert!((position.size - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sell_fill_realizes_and_retires_directive() {
        let fx = fixture().await;
        let buy = persisted_fill(&fx.store, fill_event(Side::Buy, 10.0, 0.42, 10.0)).await;
        fx.consumer.handle(buy).await.unwrap();

        let mut sell_event = fill_event(Side::Sell, 10.0, 0.50, 10.0);
        sell_event.order_id = "0xorder2".to_string();
        let sell = persisted_fill(&fx.store, sell_event).await;
        fx.consumer.handle(sell).await.unwrap();

        // (0.50 - 0.42) * 10 = 0.80 realized
        assert!((fx.book.lock().unwrap().realized_total() - 0.80).abs() < 1e-9);
        assert!((fx.safety.realized_total() - 0.80).abs() < 1e-9);
        assert!(fx.book.lock().unwrap().get_open("0xtoken1:YES").is_none());

        // Durable realized total matches
        let total = fx
            .store
            .get_state_f64(crate::persistence::kv_keys::REALIZED_TOTAL)
            .await
            .unwrap()
            .unwrap();
        assert!((total - 0.80).abs() < 1e-9);

        // Directive cancelled both in memory and in the store
        assert!(fx.exits.lock().unwrap().directive("0xtoken1:YES").is_none());
        assert!(fx.store.load_active_auto_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sell_without_position_is_retired_not_replayed() {
        let fx = fixture().await;
        let orphan = persisted_fill(&fx.store, fill_event(Side::Sell, 5.0, 0.50, 5.0)).await;
        fx.consumer.handle(orphan).await.unwrap();

        assert_eq!(fx.book.lock().unwrap().open_count(), 0);
        assert!(fx.store.load_unapplied_fills().await.unwrap().is_empty());
        assert!(fx.store.load_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let fx = fixture().await;

        // Two fills written down, neither applied (crash before apply)
        let _ = persisted_fill(&fx.store, fill_event(Side::Buy, 4.0, 0.55, 4.0)).await;
        fx.store
            .record_fill(&fill_event(Side::Buy, 6.0, 0.55, 10.0))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fx.consumer.replay_unapplied().await.unwrap(), 2);
        {
            let book = fx.book.lock().unwrap();
            let position = book.get_open("0xtoken1:YES").unwrap();
            assert!((position.size - 10.0).abs() < 1e-9);
        }

        // Replaying again finds nothing and changes nothing
        assert_eq!(fx.consumer.replay_unapplied().await.unwrap(), 0);
        let book = fx.book.lock().unwrap();
        assert!((book.get_open("0xtoken1:YES").unwrap().size - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_clamped_sell_closes_at_held_size() {
        let fx = fixture().await;
        let buy = persisted_fill(&fx.store, fill_event(Side::Buy, 5.0, 0.40, 5.0)).await;
        fx.consumer.handle(buy).await.unwrap();

        let mut sell_event = fill_event(Side::Sell, 8.0, 0.50, 8.0);
        sell_event.order_id = "0xorder2".to_string();
        let sell = persisted_fill(&fx.store, sell_event).await;
        fx.consumer.handle(sell).await.unwrap();

        // Realized on the held 5 only
        assert!((fx.safety.realized_total() - 0.50).abs() < 1e-9);
        assert!(fx.book.lock().unwrap().get_open("0xtoken1:YES").is_none());
    }

    #[tokio::test]
    async fn test_accumulation_rearms_directive_with_new_bands() {
        let fx = fixture().await;
        let first = persisted_fill(&fx.store, fill_event(Side::Buy, 5.0, 0.40, 5.0)).await;
        fx.consumer.handle(first).await.unwrap();

        let second_event = fill_event(Side::Buy, 5.0, 0.44, 10.0);
        let id = fx.store.record_fill(&second_event).await.unwrap().unwrap();
        fx.consumer
            .handle(PendingFill {
                id,
                event: second_event,
            })
            .await
            .unwrap();

        let exits = fx.exits.lock().unwrap();
        let directive = exits.directive("0xtoken1:YES").unwrap();
        // Bands track the new 0.42 average entry
        assert!((directive.take_profit - 0.42 * 1.30).abs() < 1e-9);
        assert!((directive.stop_loss - 0.42 * 0.85).abs() < 1e-9);
    }
}
