use chrono::{NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::risk::TradingState;

/// Shared safety flags and equity tracking. One instance lives behind
/// an Arc and every worker consults it; the kill switch here blocks new
/// entries only, never exits.
pub struct SafetyState {
    kill_switch: AtomicBool,
    consecutive_errors: AtomicU32,
    trades_today: AtomicU32,
    equity: Mutex<EquityTracker>,
}

struct EquityTracker {
    bankroll: f64,
    realized_total: f64,
    day_start_realized: f64,
    day: NaiveDate,
    unrealized: f64,
    peak_equity: f64,
}

impl EquityTracker {
    fn equity(&self) -> f64 {
        self.bankroll + self.realized_total + self.unrealized
    }

    fn ratchet_peak(&mut self) {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }
}

impl SafetyState {
    pub fn new(bankroll: f64) -> Self {
        Self {
            kill_switch: AtomicBool::new(false),
            consecutive_errors: AtomicU32::new(0),
            trades_today: AtomicU32::new(0),
            equity: Mutex::new(EquityTracker {
                bankroll,
                realized_total: 0.0,
                day_start_realized: 0.0,
                day: Utc::now().date_naive(),
                unrealized: 0.0,
                peak_equity: bankroll,
            }),
        }
    }

    /// Rebuild from persisted values at startup
    pub fn restore(
        bankroll: f64,
        kill_switch: bool,
        realized_total: f64,
        peak_equity: f64,
        day: NaiveDate,
        day_start_realized: f64,
    ) -> Self {
        Self {
            kill_switch: AtomicBool::new(kill_switch),
            consecutive_errors: AtomicU32::new(0),
            trades_today: AtomicU32::new(0),
            equity: Mutex::new(EquityTracker {
                bankroll,
                realized_total,
                day_start_realized,
                day,
                unrealized: 0.0,
                peak_equity: peak_equity.max(bankroll + realized_total),
            }),
        }
    }

    pub fn kill_switch_active(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub fn engage_kill_switch(&self, reason: &str) {
        if !self.kill_switch.swap(true, Ordering::SeqCst) {
            tracing::warn!("🛑 Kill switch engaged: {}", reason);
        }
    }

    pub fn release_kill_switch(&self) {
        if self.kill_switch.swap(false, Ordering::SeqCst) {
            tracing::info!("Kill switch released");
        }
    }

    pub fn record_error(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clear_errors(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn record_trade(&self) -> u32 {
        self.trades_today.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn record_realized(&self, delta: f64) {
        let mut equity = self.equity.lock().unwrap();
        equity.realized_total += delta;
        equity.ratchet_peak();
    }

    /// Refresh the mark-to-market component of equity
    pub fn set_unrealized(&self, unrealized: f64) {
        let mut equity = self.equity.lock().unwrap();
        equity.unrealized = unrealized;
        equity.ratchet_peak();
    }

    pub fn equity(&self) -> f64 {
        self.equity.lock().unwrap().equity()
    }

    pub fn peak_equity(&self) -> f64 {
        self.equity.lock().unwrap().peak_equity
    }

    pub fn realized_total(&self) -> f64 {
        self.equity.lock().unwrap().realized_total
    }

    pub fn daily_realized(&self) -> f64 {
        let equity = self.equity.lock().unwrap();
        equity.realized_total - equity.day_start_realized
    }

    /// Reset daily counters when the UTC day changes. Returns true on a
    /// rollover so the caller can persist the new day markers.
    pub fn roll_day(&self, today: NaiveDate) -> bool {
        let mut equity = self.equity.lock().unwrap();
        if equity.day == today {
            return false;
        }

        tracing::info!(
            "New UTC day {} (yesterday realized: ${:.2})",
            today,
            equity.realized_total - equity.day_start_realized
        );
        equity.day = today;
        equity.day_start_realized = equity.realized_total;
        drop(equity);

        self.trades_today.store(0, Ordering::SeqCst);
        true
    }

    pub fn day_start_realized(&self) -> f64 {
        self.equity.lock().unwrap().day_start_realized
    }

    pub fn trading_state(&self) -> TradingState {
        let equity = self.equity.lock().unwrap();
        TradingState {
            equity: equity.equity(),
            peak_equity: equity.peak_equity,
            daily_realized: equity.realized_total - equity.day_start_realized,
            consecutive_errors: self.consecutive_errors.load(Ordering::SeqCst),
            daily_trades: self.trades_today.load(Ordering::SeqCst),
        }
    }
}
