use anyhow::{anyhow, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{
    AutoOrder, AutoOrderState, FillEvent, Order, OrderStatus, Outcome, Position, PositionStatus,
    PricePoint, Side, TradeIntent,
};

/// Well-known keys in `kv_state`
pub mod kv_keys {
    pub const KILL_SWITCH: &str = "kill_switch";
    pub const PEAK_EQUITY: &str = "peak_equity";
    pub const REALIZED_TOTAL: &str = "realized_pnl_total";
    pub const DAY_START_REALIZED: &str = "day_start_realized";
    pub const DAY_STAMP: &str = "day_stamp";
    pub const LAST_SCAN_AT: &str = "last_scan_at";
}

/// Row counts for the status report
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub orders: i64,
    pub open_orders: i64,
    pub fills: i64,
    pub unapplied_fills: i64,
    pub open_positions: i64,
    pub closed_positions: i64,
    pub active_auto_orders: i64,
    pub price_points: i64,
}

/// SQLite-backed durable state. Single source of truth for the in-memory
/// caches rebuilt at startup; every committed mutation lands here first.
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Open (creating if missing) and migrate the database
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {}", database_url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self { pool })
    }

    /// Private throwaway database. One connection: in-memory SQLite exists
    /// per connection.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    // ── Orders ──────────────────────────────────────────────

    pub async fn upsert_order(&self, order: &Order) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, market, outcome, side, size, price, status,
                 filled_size, avg_fill_price, created_at, last_polled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                filled_size = excluded.filled_size,
                avg_fill_price = excluded.avg_fill_price,
                last_polled_at = excluded.last_polled_at
            "#,
        )
        .bind(&order.id)
        .bind(&order.market)
        .bind(order.outcome.as_str())
        .bind(order.side.as_str())
        .bind(order.size)
        .bind(order.price)
        .bind(order.status.as_str())
        .bind(order.filled_size)
        .bind(order.avg_fill_price)
        .bind(order.created_at)
        .bind(order.last_polled_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert order")?;

        Ok(())
    }

    /// Orders still in play, for rebuilding the tracker at startup
    pub async fn load_open_orders(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT * FROM orders WHERE status IN ('LIVE', 'PARTIALLY_FILLED') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load open orders")?;

        rows.iter().map(order_from_row).collect()
    }

    pub async fn load_order(&self, order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    // ── Fills ───────────────────────────────────────────────

    /// Append a fill observation. Returns the new row id, or None when the
    /// (order id, cumulative boundary) pair was already recorded.
    pub async fn record_fill(&self, fill: &FillEvent) -> Result<Option<i64>> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO fills
                (order_id, market, outcome, side, size, price,
                 cumulative_filled, observed_at, applied)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&fill.order_id)
        .bind(&fill.market)
        .bind(fill.outcome.as_str())
        .bind(fill.side.as_str())
        .bind(fill.size)
        .bind(fill.price)
        .bind(fill.cumulative_filled)
        .bind(fill.observed_at)
        .execute(&self.pool)
        .await
        .context("Failed to record fill")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    /// Record an order transition and its fill observation together, before
    /// the event is handed downstream.
    pub async fn record_order_fill(
        &self,
        order: &Order,
        fill: &FillEvent,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO fills
                (order_id, market, outcome, side, size, price,
                 cumulative_filled, observed_at, applied)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(&fill.order_id)
        .bind(&fill.market)
        .bind(fill.outcome.as_str())
        .bind(fill.side.as_str())
        .bind(fill.size)
        .bind(fill.price)
        .bind(fill.cumulative_filled)
        .bind(fill.observed_at)
        .execute(&mut *tx)
        .await?;

        let fill_id = if inserted.rows_affected() == 0 {
            None
        } else {
            Some(inserted.last_insert_rowid())
        };

        sqlx::query(
            r#"
            UPDATE orders SET
                status = ?, filled_size = ?, avg_fill_price = ?, last_polled_at = ?
            WHERE id = ?
            "#,
        )
        .bind(order.status.as_str())
        .bind(order.filled_size)
        .bind(order.avg_fill_price)
        .bind(order.last_polled_at)
        .bind(&order.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await.context("Failed to commit fill record")?;
        Ok(fill_id)
    }

    /// Fills persisted but not yet folded into a position, oldest first
    pub async fn load_unapplied_fills(&self) -> Result<Vec<(i64, FillEvent)>> {
        let rows = sqlx::query("SELECT * FROM fills WHERE applied = 0 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load unapplied fills")?;

        rows.iter()
            .map(|row| Ok((row.get::<i64, _>("id"), fill_from_row(row)?)))
            .collect()
    }

    /// Atomically mark one fill applied and persist the position it
    /// produced, plus the running realized total. Returns false when the
    /// fill was already applied; nothing is written in that case.
    pub async fn apply_fill(
        &self,
        fill_id: i64,
        position: &Position,
        realized_total: f64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query("UPDATE fills SET applied = 1 WHERE id = ? AND applied = 0")
            .bind(fill_id)
            .execute(&mut *tx)
            .await?;

        if marked.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO positions
                (key, market, outcome, size, avg_entry_price, realized_pnl,
                 status, opened_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                size = excluded.size,
                avg_entry_price = excluded.avg_entry_price,
                realized_pnl = excluded.realized_pnl,
                status = excluded.status,
                opened_at = excluded.opened_at,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(&position.key)
        .bind(&position.market)
        .bind(position.outcome.as_str())
        .bind(position.size)
        .bind(position.avg_entry_price)
        .bind(position.realized_pnl)
        .bind(position.status.as_str())
        .bind(position.opened_at)
        .bind(position.closed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO kv_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(kv_keys::REALIZED_TOTAL)
        .bind(realized_total.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await.context("Failed to commit fill apply")?;
        Ok(true)
    }

    /// Mark a fill applied without touching any position. For fills that
    /// cannot be applied (desync) and must not replay forever.
    pub async fn mark_fill_applied(&self, fill_id: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE fills SET applied = 1 WHERE id = ? AND applied = 0")
            .bind(fill_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ── Positions ───────────────────────────────────────────

    pub async fn upsert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions
                (key, market, outcome, size, avg_entry_price, realized_pnl,
                 status, opened_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                size = excluded.size,
                avg_entry_price = excluded.avg_entry_price,
                realized_pnl = excluded.realized_pnl,
                status = excluded.status,
                opened_at = excluded.opened_at,
                closed_at = excluded.closed_at
            "#,
        )
        .bind(&position.key)
        .bind(&position.market)
        .bind(position.outcome.as_str())
        .bind(position.size)
        .bind(position.avg_entry_price)
        .bind(position.realized_pnl)
        .bind(position.status.as_str())
        .bind(position.opened_at)
        .bind(position.closed_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert position")?;

        Ok(())
    }

    pub async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions ORDER BY opened_at")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load positions")?;

        rows.iter().map(position_from_row).collect()
    }

    // ── Auto orders ─────────────────────────────────────────

    pub async fn upsert_auto_order(&self, auto: &AutoOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO auto_orders
                (position_key, take_profit, stop_loss, trailing_pct,
                 high_water_mark, state, created_at, triggered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (position_key) DO UPDATE SET
                take_profit = excluded.take_profit,
                stop_loss = excluded.stop_loss,
                trailing_pct = excluded.trailing_pct,
                high_water_mark = excluded.high_water_mark,
                state = excluded.state,
                created_at = excluded.created_at,
                triggered_at = excluded.triggered_at
            "#,
        )
        .bind(&auto.position_key)
        .bind(auto.take_profit)
        .bind(auto.stop_loss)
        .bind(auto.trailing_pct)
        .bind(auto.high_water_mark)
        .bind(auto.state.as_str())
        .bind(auto.created_at)
        .bind(auto.triggered_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert auto order")?;

        Ok(())
    }

    pub async fn load_active_auto_orders(&self) -> Result<Vec<AutoOrder>> {
        let rows = sqlx::query("SELECT * FROM auto_orders WHERE state = 'ACTIVE'")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load auto orders")?;

        rows.iter().map(auto_order_from_row).collect()
    }

    // ── Key-value state ─────────────────────────────────────

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to set state {}", key))?;

        Ok(())
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn get_state_f64(&self, key: &str) -> Result<Option<f64>> {
        Ok(self
            .get_state(key)
            .await?
            .and_then(|v| v.parse::<f64>().ok()))
    }

    pub async fn get_state_bool(&self, key: &str) -> Result<bool> {
        Ok(matches!(
            self.get_state(key).await?.as_deref(),
            Some("true") | Some("1")
        ))
    }

    // ── Price history ───────────────────────────────────────

    pub async fn save_price_point(&self, market: &str, price: f64) -> Result<()> {
        sqlx::query("INSERT INTO price_points (market, price, recorded_at) VALUES (?, ?, ?)")
            .bind(market)
            .bind(price)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("Failed to save price point")?;

        Ok(())
    }

    pub async fn load_price_history(&self, market: &str, hours: i64) -> Result<Vec<PricePoint>> {
        let cutoff = Utc::now() - ChronoDuration::hours(hours);
        let rows = sqlx::query(
            r#"
            SELECT market, price, recorded_at FROM price_points
            WHERE market = ? AND recorded_at >= ?
            ORDER BY recorded_at
            "#,
        )
        .bind(market)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load price history")?;

        Ok(rows
            .iter()
            .map(|row| PricePoint {
                market: row.get("market"),
                price: row.get("price"),
                recorded_at: row.get("recorded_at"),
            })
            .collect())
    }

    /// Drop observations older than the retention window
    pub async fn prune_price_history(&self, keep_hours: i64) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::hours(keep_hours);
        let result = sqlx::query("DELETE FROM price_points WHERE recorded_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ── Intent dedup ────────────────────────────────────────

    /// Register an intent's dedup key. Returns false when an identical
    /// intent was registered within the TTL window.
    pub async fn register_intent(&self, intent: &TradeIntent, ttl_secs: i64) -> Result<bool> {
        let cutoff = Utc::now() - ChronoDuration::seconds(ttl_secs);
        let result = sqlx::query(
            r#"
            INSERT INTO order_intents (dedup_key, intent_id, market, side, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (dedup_key) DO UPDATE SET
                intent_id = excluded.intent_id,
                created_at = excluded.created_at
            WHERE order_intents.created_at < ?
            "#,
        )
        .bind(intent.dedup_key())
        .bind(intent.id.to_string())
        .bind(&intent.market)
        .bind(intent.side.as_str())
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to register intent")?;

        Ok(result.rows_affected() > 0)
    }

    // ── Stats ───────────────────────────────────────────────

    pub async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM orders) AS orders,
                (SELECT COUNT(*) FROM orders
                    WHERE status IN ('LIVE', 'PARTIALLY_FILLED')) AS open_orders,
                (SELECT COUNT(*) FROM fills) AS fills,
                (SELECT COUNT(*) FROM fills WHERE applied = 0) AS unapplied_fills,
                (SELECT COUNT(*) FROM positions WHERE status = 'OPEN') AS open_positions,
                (SELECT COUNT(*) FROM positions WHERE status = 'CLOSED') AS closed_positions,
                (SELECT COUNT(*) FROM auto_orders WHERE state = 'ACTIVE') AS active_auto_orders,
                (SELECT COUNT(*) FROM price_points) AS price_points
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to read store stats")?;

        Ok(StoreStats {
            orders: row.get("orders"),
            open_orders: row.get("open_orders"),
            fills: row.get("fills"),
            unapplied_fills: row.get("unapplied_fills"),
            open_positions: row.get("open_positions"),
            closed_positions: row.get("closed_positions"),
            active_auto_orders: row.get("active_auto_orders"),
            price_points: row.get("price_points"),
        })
    }
}

// ── Row decoding ────────────────────────────────────────────

fn order_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Order> {
    let status_str: String = row.get("status");
    let outcome_str: String = row.get("outcome");
    let side_str: String = row.get("side");

    Ok(Order {
        id: row.get("id"),
        market: row.get("market"),
        outcome: Outcome::parse(&outcome_str)
            .ok_or_else(|| anyhow!("unknown outcome {:?}", outcome_str))?,
        side: Side::parse(&side_str).ok_or_else(|| anyhow!("unknown side {:?}", side_str))?,
        size: row.get("size"),
        price: row.get("price"),
        status: OrderStatus::parse(&status_str)
            .ok_or_else(|| anyhow!("unknown order status {:?}", status_str))?,
        filled_size: row.get("filled_size"),
        avg_fill_price: row.get("avg_fill_price"),
        created_at: row.get("created_at"),
        last_polled_at: row.get("last_polled_at"),
    })
}

fn fill_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FillEvent> {
    let outcome_str: String = row.get("outcome");
    let side_str: String = row.get("side");

    Ok(FillEvent {
        order_id: row.get("order_id"),
        market: row.get("market"),
        outcome: Outcome::parse(&outcome_str)
            .ok_or_else(|| anyhow!("unknown outcome {:?}", outcome_str))?,
        side: Side::parse(&side_str).ok_or_else(|| anyhow!("unknown side {:?}", side_str))?,
        size: row.get("size"),
        price: row.get("price"),
        cumulative_filled: row.get("cumulative_filled"),
        observed_at: row.get("observed_at"),
    })
}

fn position_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
    let status_str: String = row.get("status");
    let outcome_str: String = row.get("outcome");

    Ok(Position {
        key: row.get("key"),
        market: row.get("market"),
        outcome: Outcome::parse(&outcome_str)
            .ok_or_else(|| anyhow!("unknown outcome {:?}", outcome_str))?,
        size: row.get("size"),
        avg_entry_price: row.get("avg_entry_price"),
        realized_pnl: row.get("realized_pnl"),
        status: PositionStatus::parse(&status_str)
            .ok_or_else(|| anyhow!("unknown position status {:?}", status_str))?,
        opened_at: row.get("opened_at"),
        closed_at: row.get("closed_at"),
    })
}

fn auto_order_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AutoOrder> {
    let state_str: String = row.get("state");

    Ok(AutoOrder {
        position_key: row.get("position_key"),
        take_profit: row.get("take_profit"),
        stop_loss: row.get("stop_loss"),
        trailing_pct: row.get("trailing_pct"),
        high_water_mark: row.get("high_water_mark"),
        state: AutoOrderState::parse(&state_str)
            .ok_or_else(|| anyhow!("unknown auto order state {:?}", state_str))?,
        created_at: row.get("created_at"),
        triggered_at: row.get("triggered_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::position_key;
    use tokio_test::assert_ok;

    async fn test_store() -> SqlitePersistence {
        SqlitePersistence::open_in_memory()
            .await
            .expect("in-memory store should open")
    }

    fn sample_order() -> Order {
        Order::new(
            "0xorder1".to_string(),
            "0xtoken1".to_string(),
            Outcome::Yes,
            Side::Buy,
            10.0,
            0.55,
        )
    }

    fn sample_fill(cumulative: f64, size: f64) -> FillEvent {
        FillEvent {
            order_id: "0xorder1".to_string(),
            market: "0xtoken1".to_string(),
            outcome: Outcome::Yes,
            side: Side::Buy,
            size,
            price: 0.55,
            cumulative_filled: cumulative,
            observed_at: Utc::now(),
        }
    }

    fn sample_position(size: f64) -> Position {
        Position {
            key: position_key("0xtoken1", Outcome::Yes),
            market: "0xtoken1".to_string(),
            outcome: Outcome::Yes,
            size,
            avg_entry_price: 0.55,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_order() {
        let store = test_store().await;
        let mut order = sample_order();
        assert_ok!(store.upsert_order(&order).await);

        let loaded = store.load_open_orders().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "0xorder1");
        assert_eq!(loaded[0].status, OrderStatus::Live);

        // Terminal orders drop out of the open set
        order.status = OrderStatus::Matched;
        order.filled_size = 10.0;
        store.upsert_order(&order).await.unwrap();

        assert!(store.load_open_orders().await.unwrap().is_empty());
        let by_id = store.load_order("0xorder1").await.unwrap().unwrap();
        assert_eq!(by_id.status, OrderStatus::Matched);
    }

    #[tokio::test]
    async fn test_record_fill_rejects_duplicate_boundary() {
        let store = test_store().await;
        store.upsert_order(&sample_order()).await.unwrap();

        let first = store.record_fill(&sample_fill(4.0, 4.0)).await.unwrap();
        assert!(first.is_some());

        // Same cumulative boundary replayed: not recorded again
        let replay = store.record_fill(&sample_fill(4.0, 4.0)).await.unwrap();
        assert_eq!(replay, None);

        // New boundary is a new fill
        let second = store.record_fill(&sample_fill(10.0, 6.0)).await.unwrap();
        assert!(second.is_some());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_apply_fill_is_transactional_and_idempotent() {
        let store = test_store().await;
        store.upsert_order(&sample_order()).await.unwrap();
        let fill_id = store
            .record_fill(&sample_fill(10.0, 10.0))
            .await
            .unwrap()
            .unwrap();

        let position = sample_position(10.0);
        let applied = store.apply_fill(fill_id, &position, 0.0).await.unwrap();
        assert!(applied);

        // Second apply of the same fill is a no-op
        let replayed = store.apply_fill(fill_id, &position, 99.0).await.unwrap();
        assert!(!replayed);

        let positions = store.load_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].size - 10.0).abs() < 1e-9);

        assert!(store.load_unapplied_fills().await.unwrap().is_empty());
        let total = store
            .get_state_f64(kv_keys::REALIZED_TOTAL)
            .await
            .unwrap()
            .unwrap();
        assert!((total - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unapplied_fills_replay_in_order() {
        let store = test_store().await;
        store.upsert_order(&sample_order()).await.unwrap();

        store.record_fill(&sample_fill(4.0, 4.0)).await.unwrap();
        store.record_fill(&sample_fill(10.0, 6.0)).await.unwrap();

        let pending = store.load_unapplied_fills().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!((pending[0].1.cumulative_filled - 4.0).abs() < 1e-9);
        assert!((pending[1].1.cumulative_filled - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_kv_state_roundtrip() {
        let store = test_store().await;

        assert_eq!(store.get_state(kv_keys::KILL_SWITCH).await.unwrap(), None);
        assert!(!store.get_state_bool(kv_keys::KILL_SWITCH).await.unwrap());

        store.set_state(kv_keys::KILL_SWITCH, "true").await.unwrap();
        assert!(store.get_state_bool(kv_keys::KILL_SWITCH).await.unwrap());

        store.set_state(kv_keys::PEAK_EQUITY, "1234.5").await.unwrap();
        assert_eq!(
            store.get_state_f64(kv_keys::PEAK_EQUITY).await.unwrap(),
            Some(1234.5)
        );
    }

    #[tokio::test]
    async fn test_auto_order_roundtrip() {
        let store = test_store().await;
        let auto = AutoOrder {
            position_key: "0xtoken1:YES".to_string(),
            take_profit: 0.72,
            stop_loss: 0.47,
            trailing_pct: Some(0.08),
            high_water_mark: 0.55,
            state: AutoOrderState::Active,
            created_at: Utc::now(),
            triggered_at: None,
        };
        store.upsert_auto_order(&auto).await.unwrap();

        let active = store.load_active_auto_orders().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].trailing_pct, Some(0.08));

        // Triggered directives are not restored as active
        let mut triggered = auto.clone();
        triggered.state = AutoOrderState::Triggered;
        triggered.triggered_at = Some(Utc::now());
        store.upsert_auto_order(&triggered).await.unwrap();

        assert!(store.load_active_auto_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_price_history_windowing() {
        let store = test_store().await;
        store.save_price_point("0xtoken1", 0.50).await.unwrap();
        store.save_price_point("0xtoken1", 0.52).await.unwrap();
        store.save_price_point("0xother", 0.30).await.unwrap();

        let history = store.load_price_history("0xtoken1", 1).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!((history[0].price - 0.50).abs() < 1e-9);
        assert!((history[1].price - 0.52).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_intent_dedup_within_ttl() {
        let store = test_store().await;
        let intent = TradeIntent::new("0xtoken1", Outcome::Yes, Side::Buy, 10.0, 0.55, "edge");

        assert!(store.register_intent(&intent, 300).await.unwrap());

        // Identical intent inside the TTL is suppressed
        let duplicate = TradeIntent::new("0xtoken1", Outcome::Yes, Side::Buy, 10.0, 0.55, "edge");
        assert!(!store.register_intent(&duplicate, 300).await.unwrap());

        // TTL of zero lets it through again
        assert!(store.register_intent(&duplicate, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats_counts() {
        let store = test_store().await;
        store.upsert_order(&sample_order()).await.unwrap();
        store.record_fill(&sample_fill(4.0, 4.0)).await.unwrap();
        store.upsert_position(&sample_position(4.0)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.orders, 1);
        assert_eq!(stats.open_orders, 1);
        assert_eq!(stats.fills, 1);
        assert_eq!(stats.unapplied_fills, 1);
        assert_eq!(stats.open_positions, 1);
        assert_eq!(stats.closed_positions, 0);
    }
}
