use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::api::{Exchange, OrderReport};
use crate::models::{FillEvent, Order, OrderStatus};
use crate::persistence::SqlitePersistence;

/// Reported volume below this is noise, not a fill
const FILL_DUST: f64 = 1e-3;

/// A fill that has been written down (row id in the store) but not yet
/// folded into a position
#[derive(Debug, Clone)]
pub struct PendingFill {
    pub id: i64,
    pub event: FillEvent,
}

/// What one polling sweep did
#[derive(Debug, Default, Clone, Copy)]
pub struct PollSummary {
    pub polled: usize,
    pub fills_emitted: usize,
    pub completed: usize,
    pub errors: usize,
}

/// Polls open orders against the exchange and turns cumulative fill
/// reports into incremental fill events. Each event is persisted before
/// it goes out on the channel, so a crash between the two replays it.
pub struct OrderTracker {
    exchange: Arc<dyn Exchange>,
    store: Arc<SqlitePersistence>,
    fills: mpsc::Sender<PendingFill>,
    orders: Mutex<HashMap<String, Order>>,
    stale_after: ChronoDuration,
}

impl OrderTracker {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<SqlitePersistence>,
        fills: mpsc::Sender<PendingFill>,
        stale_after_secs: i64,
    ) -> Self {
        Self {
            exchange,
            store,
            fills,
            orders: Mutex::new(HashMap::new()),
            stale_after: ChronoDuration::seconds(stale_after_secs),
        }
    }

    /// Reload open orders from the store after a restart
    pub async fn restore(&self) -> Result<usize> {
        let open = self.store.load_open_orders().await?;
        let count = open.len();

        let mut orders = self.orders.lock().unwrap();
        for order in open {
            orders.insert(order.id.clone(), order);
        }

        tracing::info!("Resumed tracking {} open orders", count);
        Ok(count)
    }

    /// Persist and start polling a freshly submitted order
    pub async fn track(&self, order: Order) -> Result<()> {
        self.store.upsert_order(&order).await?;
        tracing::info!(
            "Tracking order {} ({} {} {:.2} @ {:.4})",
            order.id,
            order.side.as_str(),
            order.market,
            order.size,
            order.price
        );
        self.orders.lock().unwrap().insert(order.id.clone(), order);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        self.orders.lock().unwrap().keys().cloned().collect()
    }

    /// One sweep over every tracked order. A failing order does not
    /// abort the sweep; it is retried on the next pass.
    pub async fn poll_once(&self) -> PollSummary {
        let snapshot: Vec<Order> = self.orders.lock().unwrap().values().cloned().collect();
        let mut summary = PollSummary {
            polled: snapshot.len(),
            ..Default::default()
        };

        for order in snapshot {
            match self.exchange.get_order(&order.id).await {
                Ok(report) => {
                    if let Err(err) = self.reconcile(&order, &report, &mut summary).await {
                        tracing::warn!("Failed to reconcile order {}: {:#}", order.id, err);
                        summary.errors += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!("Failed to poll order {}: {:#}", order.id, err);
                    summary.errors += 1;
                }
            }
        }

        summary
    }

    /// Fold one status report into the tracked order: emit the fill
    /// delta if volume moved, follow the reported status, and finally
    /// age out stale orders.
    async fn reconcile(
        &self,
        order: &Order,
        report: &OrderReport,
        summary: &mut PollSummary,
    ) -> Result<()> {
        let now = Utc::now();
        let mut updated = order.clone();
        updated.last_polled_at = Some(now);

        let delta = report.cumulative_filled - order.filled_size;
        if delta > FILL_DUST {
            let price = derive_fill_price(order, report, delta);

            updated.filled_size = report.cumulative_filled;
            if report.avg_fill_price > 0.0 {
                updated.avg_fill_price = report.avg_fill_price;
            }
            updated.status = effective_status(&updated, report.status);

            let event = FillEvent {
                order_id: order.id.clone(),
                market: order.market.clone(),
                outcome: order.outcome,
                side: order.side,
                size: delta,
                price,
                cumulative_filled: report.cumulative_filled,
                observed_at: now,
            };

            // Written down first; only then does it leave this task
            match self.store.record_order_fill(&updated, &event).await? {
                Some(fill_id) => {
                    tracing::info!(
                        "Fill on {}: {:.2} @ {:.4} (cumulative {:.2}/{:.2})",
                        order.id,
                        delta,
                        price,
                        report.cumulative_filled,
                        order.size
                    );
                    summary.fills_emitted += 1;
                    if self
                        .fills
                        .send(PendingFill { id: fill_id, event })
                        .await
                        .is_err()
                    {
                        // Consumer is gone (shutdown). The row stays
                        // unapplied and replays at next startup.
                        tracing::warn!("Fill channel closed; {} will replay on restart", order.id);
                    }
                }
                None => {
                    tracing::debug!(
                        "Fill boundary {}@{:.2} already recorded, skipping",
                        order.id,
                        report.cumulative_filled
                    );
                }
            }
        } else if report.status != order.status {
            updated.status = effective_status(&updated, report.status);
            self.store.upsert_order(&updated).await?;
        }

        if updated.is_terminal() {
            tracing::info!(
                "Order {} is {} ({:.2}/{:.2} filled)",
                updated.id,
                updated.status.as_str(),
                updated.filled_size,
                updated.size
            );
            summary.completed += 1;
            self.orders.lock().unwrap().remove(&updated.id);
            return Ok(());
        }

        // Still working: keep the fresher copy
        self.orders
            .lock()
            .unwrap()
            .insert(updated.id.clone(), updated.clone());

        if now.signed_duration_since(updated.created_at) >= self.stale_after {
            self.expire(&updated, summary).await?;
        }

        Ok(())
    }

    /// Best-effort cancel of an order that outlived its welcome. The
    /// order is marked cancelled locally whatever the exchange says, so
    /// a dead order can never wedge the tracker.
    async fn expire(&self, order: &Order, summary: &mut PollSummary) -> Result<()> {
        match self.exchange.cancel_order(&order.id).await {
            Ok(true) => tracing::info!("Cancelled stale order {}", order.id),
            Ok(false) => tracing::warn!("Exchange refused cancel of stale order {}", order.id),
            Err(err) => tracing::warn!(
                "Cancel of stale order {} failed: {:#}; marking cancelled anyway",
                order.id,
                err
            ),
        }

        let mut cancelled = order.clone();
        cancelled.status = OrderStatus::Cancelled;
        self.store.upsert_order(&cancelled).await?;
        self.orders.lock().unwrap().remove(&order.id);
        summary.completed += 1;
        Ok(())
    }

    /// Cancel everything still tracked (operator command). Cancels are
    /// best-effort; local state always ends up CANCELLED.
    pub async fn cancel_all(&self) -> Result<usize> {
        let snapshot: Vec<Order> = self.orders.lock().unwrap().values().cloned().collect();
        let mut summary = PollSummary::default();
        for order in &snapshot {
            self.expire(order, &mut summary).await?;
        }
        Ok(summary.completed)
    }
}

/// Price of the new volume alone. The exchange reports a running
/// average, so the marginal price is backed out of two averages; when
/// that is degenerate (first fill, missing average, float dust) it
/// falls back to the reported average, then the limit price.
fn derive_fill_price(order: &Order, report: &OrderReport, delta: f64) -> f64 {
    let marginal = if order.filled_size > FILL_DUST
        && order.avg_fill_price > 0.0
        && report.avg_fill_price > 0.0
    {
        (report.avg_fill_price * report.cumulative_filled
            - order.avg_fill_price * order.filled_size)
            / delta
    } else if report.avg_fill_price > 0.0 {
        report.avg_fill_price
    } else {
        order.price
    };

    if marginal.is_finite() && marginal > 0.0 && marginal < 1.0 {
        marginal
    } else if report.avg_fill_price > 0.0 && report.avg_fill_price < 1.0 {
        report.avg_fill_price
    } else {
        order.price
    }
}

/// Reported status refined by what we can see locally: partial volume
/// promotes LIVE, and a fully filled order is MATCHED even when the
/// exchange is slow to say so.
fn effective_status(order: &Order, reported: OrderStatus) -> OrderStatus {
    if reported.is_terminal() {
        return reported;
    }
    if order.is_fully_filled() {
        OrderStatus::Matched
    } else if order.filled_size > FILL_DUST {
        OrderStatus::PartiallyFilled
    } else {
        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Outcome, Quote, Side};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted exchange: each get_order pops the next report for that
    /// order, repeating the last one once the script runs out.
    struct FakeExchange {
        reports: Mutex<HashMap<String, VecDeque<OrderReport>>>,
        cancel_calls: AtomicUsize,
        fail_cancels: bool,
    }

    impl FakeExchange {
        fn new() -> Self {
            Self {
                reports: Mutex::new(HashMap::new()),
                cancel_calls: AtomicUsize::new(0),
                fail_cancels: false,
            }
        }

        fn failing_cancels() -> Self {
            Self {
                fail_cancels: true,
                ..Self::new()
            }
        }

        fn script(&self, order_id: &str, reports: Vec<OrderReport>) {
            self.reports
                .lock()
                .unwrap()
                .insert(order_id.to_string(), reports.into());
        }

        fn report(status: OrderStatus, cumulative: f64, avg: f64) -> OrderReport {
            OrderReport {
                status,
                cumulative_filled: cumulative,
                avg_fill_price: avg,
            }
        }
    }

    #[async_trait]
    impl Exchange for FakeExchange {
        async fn submit_order(
            &self,
            _market: &str,
            _side: Side,
            _size: f64,
            _price: f64,
        ) -> Result<String> {
            Ok("0xsubmitted".to_string())
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<bool> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_cancels {
                bail!("exchange rejected cancel");
            }
            Ok(true)
        }

        async fn get_order(&self, order_id: &str) -> Result<OrderReport> {
            let mut reports = self.reports.lock().unwrap();
            let queue = match reports.get_mut(order_id) {
                Some(q) if !q.is_empty() => q,
                _ => bail!("no scripted report for {}", order_id),
            };
            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap())
            } else {
                Ok(queue.front().unwrap().clone())
            }
        }

        async fn get_price(&self, _market: &str) -> Result<Quote> {
            bail!("not scripted")
        }

        async fn list_markets(&self, _limit: usize) -> Result<Vec<crate::models::Market>> {
            Ok(vec![])
        }
    }

    async fn tracker_with(
        exchange: Arc<FakeExchange>,
        stale_secs: i64,
    ) -> (OrderTracker, Arc<SqlitePersistence>, mpsc::Receiver<PendingFill>) {
        let store = Arc::new(SqlitePersistence::open_in_memory().await.unwrap());
        let (tx, rx) = mpsc::channel(16);
        let tracker = OrderTracker::new(exchange, store.clone(), tx, stale_secs);
        (tracker, store, rx)
    }

    fn buy_order(id: &str, size: f64, price: f64) -> Order {
        Order::new(
            id.to_string(),
            "0xtoken1".to_string(),
            Outcome::Yes,
            Side::Buy,
            size,
            price,
        )
    }

    #[tokio::test]
    async fn test_cumulative_reports_become_delta_fills() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.script(
            "0xorder1",
            vec![
                FakeExchange::report(OrderStatus::Live, 4.0, 0.55),
                FakeExchange::report(OrderStatus::Matched, 10.0, 0.55),
            ],
        );

        let (tracker, store, mut rx) = tracker_with(exchange, 3600).await;
        tracker.track(buy_order("0xorder1", 10.0, 0.55)).await.unwrap();

        let first = tracker.poll_once().await;
        assert_eq!(first.fills_emitted, 1);
        let fill = rx.recv().await.unwrap();
        assert!((fill.event.size - 4.0).abs() < 1e-9);
        assert!((fill.event.cumulative_filled - 4.0).abs() < 1e-9);

        let second = tracker.poll_once().await;
        assert_eq!(second.fills_emitted, 1);
        assert_eq!(second.completed, 1);
        let fill = rx.recv().await.unwrap();
        assert!((fill.event.size - 6.0).abs() < 1e-9);
        assert!((fill.event.cumulative_filled - 10.0).abs() < 1e-9);

        // Matched order dropped out of tracking, terminal in the store
        assert_eq!(tracker.pending_count(), 0);
        let stored = store.load_order("0xorder1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Matched);
        assert!((stored.filled_size - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unchanged_report_emits_nothing() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.script(
            "0xorder1",
            vec![FakeExchange::report(OrderStatus::Live, 4.0, 0.55)],
        );

        let (tracker, store, mut rx) = tracker_with(exchange, 3600).await;
        tracker.track(buy_order("0xorder1", 10.0, 0.55)).await.unwrap();

        assert_eq!(tracker.poll_once().await.fills_emitted, 1);
        rx.recv().await.unwrap();

        // Same cumulative volume again: no event, no extra row
        assert_eq!(tracker.poll_once().await.fills_emitted, 0);
        assert!(rx.try_recv().is_err());
        assert!(store.load_unapplied_fills().await.unwrap().len() == 1);

        // Partial status stuck locally
        let stored = store.load_order("0xorder1").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::PartiallyFilled);
    }

    #[tokio::test]
    async fn test_marginal_price_backed_out_of_averages() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.script(
            "0xorder1",
            vec![
                FakeExchange::report(OrderStatus::Live, 4.0, 0.50),
                FakeExchange::report(OrderStatus::Matched, 10.0, 0.53),
            ],
        );

        let (tracker, _store, mut rx) = tracker_with(exchange, 3600).await;
        tracker.track(buy_order("0xorder1", 10.0, 0.55)).await.unwrap();

        tracker.poll_once().await;
        let first = rx.recv().await.unwrap();
        assert!((first.event.price - 0.50).abs() < 1e-9);

        tracker.poll_once().await;
        let second = rx.recv().await.unwrap();
        // (0.53 * 10 - 0.50 * 4) / 6 = 0.55
        assert!((second.event.price - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stale_order_marked_cancelled_when_cancel_fails() {
        let exchange = Arc::new(FakeExchange::failing_cancels());
        exchange.script(
            "0xstale",
            vec![FakeExchange::report(OrderStatus::Live, 0.0, 0.0)],
        );

        let (tracker, store, _rx) = tracker_with(exchange.clone(), 1800).await;
        let mut order = buy_order("0xstale", 10.0, 0.55);
        order.created_at = Utc::now() - ChronoDuration::hours(2);
        tracker.track(order).await.unwrap();

        let summary = tracker.poll_once().await;
        assert_eq!(summary.completed, 1);
        assert_eq!(exchange.cancel_calls.load(Ordering::SeqCst), 1);

        // Locally cancelled despite the exchange error
        assert_eq!(tracker.pending_count(), 0);
        let stored = store.load_order("0xstale").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stale_order_fill_survives_the_cancel() {
        let exchange = Arc::new(FakeExchange::new());
        exchange.script(
            "0xstale",
            vec![FakeExchange::report(OrderStatus::Live, 3.0, 0.55)],
        );

        let (tracker, store, mut rx) = tracker_with(exchange, 1800).await;
        let mut order = buy_order("0xstale", 10.0, 0.55);
        order.created_at = Utc::now() - ChronoDuration::hours(2);
        tracker.track(order).await.unwrap();

        let summary = tracker.poll_once().await;
        assert_eq!(summary.fills_emitted, 1);
        assert_eq!(summary.completed, 1);

        // The partial fill went out before the order was aged out
        let fill = rx.recv().await.unwrap();
        assert!((fill.event.size - 3.0).abs() < 1e-9);
        let stored = store.load_order("0xstale").await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_poll_errors_keep_order_tracked() {
        let exchange = Arc::new(FakeExchange::new());
        // No script: get_order fails

        let (tracker, _store, _rx) = tracker_with(exchange, 3600).await;
        tracker.track(buy_order("0xorder1", 10.0, 0.55)).await.unwrap();

        let summary = tracker.poll_once().await;
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.fills_emitted, 0);
        assert_eq!(tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_resumes_open_orders() {
        let exchange = Arc::new(FakeExchange::new());
        let (tracker, store, _rx) = tracker_with(exchange.clone(), 3600).await;

        store.upsert_order(&buy_order("0xorder1", 10.0, 0.55)).await.unwrap();
        let mut matched = buy_order("0xdone", 5.0, 0.30);
        matched.status = OrderStatus::Matched;
        store.upsert_order(&matched).await.unwrap();

        let (tx, _rx2) = mpsc::channel(16);
        let fresh = OrderTracker::new(exchange, store.clone(), tx, 3600);
        assert_eq!(fresh.restore().await.unwrap(), 1);
        assert_eq!(fresh.pending_count(), 1);
        assert!(fresh.tracked_ids().contains(&"0xorder1".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_all_clears_tracking() {
        let exchange = Arc::new(FakeExchange::failing_cancels());
        let (tracker, store, _rx) = tracker_with(exchange.clone(), 3600).await;
        tracker.track(buy_order("0xa", 10.0, 0.55)).await.unwrap();
        tracker.track(buy_order("0xb", 5.0, 0.30)).await.unwrap();

        let cancelled = tracker.cancel_all().await.unwrap();
        assert_eq!(cancelled, 2);
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(exchange.cancel_calls.load(Ordering::SeqCst), 2);

        let a = store.load_order("0xa").await.unwrap().unwrap();
        assert_eq!(a.status, OrderStatus::Cancelled);
    }

    #[test]
    fn test_fill_price_fallbacks() {
        let order = buy_order("0xorder1", 10.0, 0.55);

        // First fill with a reported average uses it directly
        let report = FakeExchange::report(OrderStatus::Live, 4.0, 0.52);
        assert!((derive_fill_price(&order, &report, 4.0) - 0.52).abs() < 1e-9);

        // No average reported: fall back to the limit price
        let report = FakeExchange::report(OrderStatus::Live, 4.0, 0.0);
        assert!((derive_fill_price(&order, &report, 4.0) - 0.55).abs() < 1e-9);

        // Degenerate back-out (average jumped implausibly) falls back too
        let mut partial = buy_order("0xorder1", 10.0, 0.55);
        partial.filled_size = 4.0;
        partial.avg_fill_price = 0.99;
        let report = FakeExchange::report(OrderStatus::Live, 5.0, 0.10);
        let price = derive_fill_price(&partial, &report, 1.0);
        assert!((price - 0.10).abs() < 1e-9);
    }
}
