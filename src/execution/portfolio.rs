use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{
    position_key, FillEvent, Order, PortfolioSnapshot, Position, PositionStatus, Side,
};

/// Residual size below which a position counts as flat
const POSITION_DUST: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no open position for {key} to reduce")]
    NoOpenPosition { key: String },
}

/// Result of folding one fill into the book. Computed before anything is
/// persisted or mutated so the caller can write it down first.
#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub position: Position,
    pub realized_delta: f64,
    /// Sell size exceeded held size and was cut down to it
    pub clamped: bool,
    pub closed: bool,
}

/// Fold one fill into an existing position (or none), producing the next
/// position state and the realized P&L delta. Pure: no I/O, no mutation.
///
/// Buys extend or open a position at the volume-weighted average entry.
/// Sells realize `(fill_price - avg_entry) * size` against the average
/// entry, which never changes on the way down.
pub fn apply_fill(
    existing: Option<&Position>,
    fill: &FillEvent,
    now: DateTime<Utc>,
) -> Result<LedgerUpdate, LedgerError> {
    let key = position_key(&fill.market, fill.outcome);
    let held = existing.filter(|p| p.is_open());

    match fill.side {
        Side::Buy => match held {
            Some(position) => {
                let new_size = position.size + fill.size;
                let new_avg = (position.avg_entry_price * position.size
                    + fill.price * fill.size)
                    / new_size;

                let mut updated = position.clone();
                updated.size = new_size;
                updated.avg_entry_price = new_avg;

                Ok(LedgerUpdate {
                    position: updated,
                    realized_delta: 0.0,
                    clamped: false,
                    closed: false,
                })
            }
            None => Ok(LedgerUpdate {
                position: Position {
                    key,
                    market: fill.market.clone(),
                    outcome: fill.outcome,
                    size: fill.size,
                    avg_entry_price: fill.price,
                    realized_pnl: 0.0,
                    status: PositionStatus::Open,
                    opened_at: now,
                    closed_at: None,
                },
                realized_delta: 0.0,
                clamped: false,
                closed: false,
            }),
        },
        Side::Sell => {
            let position = held.ok_or(LedgerError::NoOpenPosition { key })?;

            let clamped = fill.size > position.size + POSITION_DUST;
            let effective = if clamped { position.size } else { fill.size };
            let realized = (fill.price - position.avg_entry_price) * effective;
            let remaining = (position.size - effective).max(0.0);
            let closed = remaining <= POSITION_DUST;

            let mut updated = position.clone();
            updated.size = if closed { 0.0 } else { remaining };
            updated.realized_pnl += realized;
            if closed {
                updated.status = PositionStatus::Closed;
                updated.closed_at = Some(now);
            }

            Ok(LedgerUpdate {
                position: updated,
                realized_delta: realized,
                clamped,
                closed,
            })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BookStats {
    pub closed_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    pub realized_pnl: f64,
}

/// In-memory view of all positions, rebuilt from the store at startup.
/// Write-through: callers persist a `LedgerUpdate` before committing it
/// here, so the store never lags the book.
pub struct PositionBook {
    open: HashMap<String, Position>,
    closed: Vec<Position>,
    realized_pnl: f64,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            open: HashMap::new(),
            closed: Vec::new(),
            realized_pnl: 0.0,
        }
    }

    /// Rebuild the book from persisted rows. `realized_override` carries
    /// the durable running total, which outlives position rows that get
    /// replaced on re-entry; without it the total is recomputed from rows.
    pub fn with_positions(positions: Vec<Position>, realized_override: Option<f64>) -> Self {
        let row_total: f64 = positions.iter().map(|p| p.realized_pnl).sum();
        let realized_pnl = realized_override.unwrap_or(row_total);

        let mut open = HashMap::new();
        let mut closed = Vec::new();
        for position in positions {
            if position.is_open() {
                open.insert(position.key.clone(), position);
            } else {
                closed.push(position);
            }
        }

        tracing::info!(
            "Restored {} open / {} closed positions (total realized P&L: ${:.2})",
            open.len(),
            closed.len(),
            realized_pnl
        );

        Self {
            open,
            closed,
            realized_pnl,
        }
    }

    /// Compute the update for a fill without touching the book
    pub fn preview(&self, fill: &FillEvent) -> Result<LedgerUpdate, LedgerError> {
        let key = position_key(&fill.market, fill.outcome);
        apply_fill(self.open.get(&key), fill, Utc::now())
    }

    /// Fold a previously persisted update into the book
    pub fn commit(&mut self, update: &LedgerUpdate) {
        self.realized_pnl += update.realized_delta;
        if update.closed {
            self.open.remove(&update.position.key);
            self.closed.push(update.position.clone());
        } else {
            self.open
                .insert(update.position.key.clone(), update.position.clone());
        }
    }

    pub fn has_open(&self, key: &str) -> bool {
        self.open.contains_key(key)
    }

    pub fn get_open(&self, key: &str) -> Option<&Position> {
        self.open.get(key)
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.open.values().collect()
    }

    pub fn open_keys(&self) -> Vec<String> {
        self.open.keys().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Capital currently deployed across open positions
    pub fn total_exposure(&self) -> f64 {
        self.open.values().map(|p| p.notional()).sum()
    }

    pub fn realized_total(&self) -> f64 {
        self.realized_pnl
    }

    /// Mark-to-market P&L for open positions. `marks` is keyed by
    /// position key; positions without a mark contribute nothing.
    pub fn unrealized_pnl(&self, marks: &HashMap<String, f64>) -> f64 {
        self.open
            .iter()
            .filter_map(|(key, p)| marks.get(key).map(|&mark| p.unrealized_pnl(mark)))
            .sum()
    }

    pub fn snapshot(
        &self,
        pending_orders: Vec<Order>,
        marks: &HashMap<String, f64>,
    ) -> PortfolioSnapshot {
        let mut open: Vec<Position> = self.open.values().cloned().collect();
        open.sort_by(|a, b| a.key.cmp(&b.key));

        PortfolioSnapshot {
            open_positions: open,
            closed_positions: self.closed.clone(),
            pending_orders,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: self.unrealized_pnl(marks),
        }
    }

    pub fn stats(&self) -> BookStats {
        let wins = self
            .closed
            .iter()
            .filter(|p| p.realized_pnl > 0.0)
            .count();
        let losses = self.closed.len() - wins;
        let win_rate = if self.closed.is_empty() {
            0.0
        } else {
            wins as f64 / self.closed.len() as f64
        };

        BookStats {
            closed_trades: self.closed.len(),
            wins,
            losses,
            win_rate,
            realized_pnl: self.realized_pnl,
        }
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Outcome;

    fn fill(side: Side, size: f64, price: f64) -> FillEvent {
        FillEvent {
            order_id: "0xorder1".to_string(),
            market: "0xtoken1".to_string(),
            outcome: Outcome::Yes,
            side,
            size,
            price,
            cumulative_filled: size,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_buy_opens_position_at_fill_price() {
        let update = apply_fill(None, &fill(Side::Buy, 10.0, 0.55), Utc::now()).unwrap();

        assert_eq!(update.position.key, "0xtoken1:YES");
        assert!((update.position.size - 10.0).abs() < 1e-9);
        assert!((update.position.avg_entry_price - 0.55).abs() < 1e-9);
        assert_eq!(update.position.status, PositionStatus::Open);
        assert!((update.realized_delta - 0.0).abs() < 1e-9);
        assert!(!update.closed);
    }

    #[test]
    fn test_buy_accumulates_weighted_average() {
        let now = Utc::now();
        let first = apply_fill(None, &fill(Side::Buy, 5.0, 0.40), now).unwrap();
        let second =
            apply_fill(Some(&first.position), &fill(Side::Buy, 5.0, 0.44), now).unwrap();

        // (0.40 * 5 + 0.44 * 5) / 10 = 0.42
        assert!((second.position.size - 10.0).abs() < 1e-9);
        assert!((second.position.avg_entry_price - 0.42).abs() < 1e-9);
        assert!((second.realized_delta - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_full_sell_realizes_against_average_entry() {
        let now = Utc::now();
        let first = apply_fill(None, &fill(Side::Buy, 5.0, 0.40), now).unwrap();
        let second =
            apply_fill(Some(&first.position), &fill(Side::Buy, 5.0, 0.44), now).unwrap();
        let exit =
            apply_fill(Some(&second.position), &fill(Side::Sell, 10.0, 0.50), now).unwrap();

        // (0.50 - 0.42) * 10 = 0.80
        assert!((exit.realized_delta - 0.80).abs() < 1e-9);
        assert!(exit.closed);
        assert!(!exit.clamped);
        assert_eq!(exit.position.status, PositionStatus::Closed);
        assert!((exit.position.size - 0.0).abs() < 1e-9);
        assert!(exit.position.closed_at.is_some());
    }

    #[test]
    fn test_partial_sell_keeps_average_entry() {
        let now = Utc::now();
        let entry = apply_fill(None, &fill(Side::Buy, 10.0, 0.40), now).unwrap();
        let exit =
            apply_fill(Some(&entry.position), &fill(Side::Sell, 4.0, 0.50), now).unwrap();

        assert!((exit.realized_delta - 0.40).abs() < 1e-9);
        assert!((exit.position.size - 6.0).abs() < 1e-9);
        assert!((exit.position.avg_entry_price - 0.40).abs() < 1e-9);
        assert!(!exit.closed);
        assert_eq!(exit.position.status, PositionStatus::Open);
    }

    #[test]
    fn test_oversized_sell_clamps_to_held_size() {
        let now = Utc::now();
        let entry = apply_fill(None, &fill(Side::Buy, 5.0, 0.40), now).unwrap();
        let exit =
            apply_fill(Some(&entry.position), &fill(Side::Sell, 8.0, 0.50), now).unwrap();

        // Only the held 5 realize P&L
        assert!(exit.clamped);
        assert!((exit.realized_delta - 0.50).abs() < 1e-9);
        assert!(exit.closed);
        assert!((exit.position.size - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_sell_without_position_is_rejected() {
        let result = apply_fill(None, &fill(Side::Sell, 5.0, 0.50), Utc::now());
        assert!(matches!(
            result,
            Err(LedgerError::NoOpenPosition { .. })
        ));
    }

    #[test]
    fn test_preview_does_not_mutate_book() {
        let mut book = PositionBook::new();
        let update = book.preview(&fill(Side::Buy, 10.0, 0.55)).unwrap();

        assert_eq!(book.open_count(), 0);
        assert!((book.realized_total() - 0.0).abs() < 1e-9);

        book.commit(&update);
        assert_eq!(book.open_count(), 1);
        assert!(book.has_open("0xtoken1:YES"));
    }

    #[test]
    fn test_commit_moves_closed_position_out_of_open_set() {
        let mut book = PositionBook::new();
        let entry = book.preview(&fill(Side::Buy, 10.0, 0.42)).unwrap();
        book.commit(&entry);

        let exit = book.preview(&fill(Side::Sell, 10.0, 0.50)).unwrap();
        book.commit(&exit);

        assert_eq!(book.open_count(), 0);
        assert!(!book.has_open("0xtoken1:YES"));
        assert!((book.realized_total() - 0.80).abs() < 1e-9);

        let stats = book.stats();
        assert_eq!(stats.closed_trades, 1);
        assert_eq!(stats.wins, 1);
        assert!((stats.win_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reentry_after_close_starts_fresh() {
        let mut book = PositionBook::new();
        book.commit(&book.preview(&fill(Side::Buy, 10.0, 0.40)).unwrap());
        book.commit(&book.preview(&fill(Side::Sell, 10.0, 0.50)).unwrap());
        book.commit(&book.preview(&fill(Side::Buy, 4.0, 0.60)).unwrap());

        let position = book.get_open("0xtoken1:YES").unwrap();
        assert!((position.size - 4.0).abs() < 1e-9);
        assert!((position.avg_entry_price - 0.60).abs() < 1e-9);
        // Prior realized P&L survives the re-entry
        assert!((book.realized_total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_restore_splits_open_and_closed() {
        let now = Utc::now();
        let open = Position {
            key: "0xtoken1:YES".to_string(),
            market: "0xtoken1".to_string(),
            outcome: Outcome::Yes,
            size: 10.0,
            avg_entry_price: 0.42,
            realized_pnl: 0.0,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
        };
        let closed = Position {
            key: "0xtoken2:NO".to_string(),
            market: "0xtoken2".to_string(),
            outcome: Outcome::No,
            size: 0.0,
            avg_entry_price: 0.30,
            realized_pnl: -0.50,
            status: PositionStatus::Closed,
            opened_at: now,
            closed_at: Some(now),
        };

        let book = PositionBook::with_positions(vec![open, closed], None);
        assert_eq!(book.open_count(), 1);
        assert!(book.has_open("0xtoken1:YES"));
        assert!((book.realized_total() - (-0.50)).abs() < 1e-9);

        // Durable total wins over the row sum when provided
        let book = PositionBook::with_positions(vec![], Some(3.25));
        assert!((book.realized_total() - 3.25).abs() < 1e-9);
    }

    #[test]
    fn test_unrealized_is_derived_from_marks_only() {
        let mut book = PositionBook::new();
        book.commit(&book.preview(&fill(Side::Buy, 10.0, 0.42)).unwrap());

        let mut marks = HashMap::new();
        marks.insert("0xtoken1:YES".to_string(), 0.50);

        // (0.50 - 0.42) * 10 = 0.80, and nothing realized
        assert!((book.unrealized_pnl(&marks) - 0.80).abs() < 1e-9);
        assert!((book.realized_total() - 0.0).abs() < 1e-9);

        let pending = vec![Order::new(
            "0xorder2".to_string(),
            "0xtoken2".to_string(),
            Outcome::No,
            Side::Buy,
            5.0,
            0.30,
        )];
        let snapshot = book.snapshot(pending, &marks);
        assert_eq!(snapshot.open_positions.len(), 1);
        assert_eq!(snapshot.pending_orders.len(), 1);
        assert!((snapshot.unrealized_pnl - 0.80).abs() < 1e-9);

        // Without a mark the open position contributes nothing
        assert!((book.unrealized_pnl(&HashMap::new()) - 0.0).abs() < 1e-9);
    }
}
