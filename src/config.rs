use crate::discovery::ScanConfig;
use crate::execution::{ExitConfig, ExitPriority};
use crate::risk::{CircuitBreakers, TradeGuards};

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Everything the bot reads from the environment, resolved once at
/// startup. Every knob has a default so a bare `.env` with just the
/// exchange URL is enough to run.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub database_url: String,
    pub exchange_base_url: String,
    pub exchange_calls_per_second: f64,
    /// Unset disables the consensus model entirely
    pub consensus_base_url: Option<String>,
    pub consensus_ttl_secs: u64,
    /// Unset disables the manual model
    pub manual_estimates_path: Option<String>,
    pub bankroll: f64,
    pub poll_interval_secs: u64,
    pub tick_interval_secs: u64,
    pub scan_interval_secs: u64,
    pub stale_order_secs: i64,
    pub intent_ttl_secs: i64,
    /// Cancel every tracked open order before the loops start
    pub cancel_on_start: bool,
    pub guards: TradeGuards,
    pub breakers: CircuitBreakers,
    pub exits: ExitConfig,
    pub scan: ScanConfig,
}

impl BotConfig {
    pub fn from_env() -> Self {
        let guard_defaults = TradeGuards::default();
        let breaker_defaults = CircuitBreakers::default();
        let exit_defaults = ExitConfig::default();
        let scan_defaults = ScanConfig::default();

        let priority = env_opt("EXIT_PRIORITY")
            .and_then(|v| {
                let parsed = ExitPriority::parse(&v);
                if parsed.is_none() {
                    tracing::warn!("Unrecognized EXIT_PRIORITY '{v}', using default");
                }
                parsed
            })
            .unwrap_or(exit_defaults.priority);

        Self {
            database_url: env_str("DATABASE_URL", "sqlite://edgebot.db"),
            exchange_base_url: env_str("EXCHANGE_BASE_URL", "https://clob.example.com"),
            exchange_calls_per_second: env_f64("EXCHANGE_CALLS_PER_SECOND", 10.0),
            consensus_base_url: env_opt("CONSENSUS_BASE_URL"),
            consensus_ttl_secs: env_u64("CONSENSUS_TTL_SECS", 300),
            manual_estimates_path: env_opt("MANUAL_ESTIMATES_PATH"),
            bankroll: env_f64("BANKROLL", 1000.0),
            poll_interval_secs: env_u64("ORDER_POLL_INTERVAL_SECS", 5),
            tick_interval_secs: env_u64("PRICE_TICK_INTERVAL_SECS", 15),
            scan_interval_secs: env_u64("SCAN_INTERVAL_SECS", 300),
            stale_order_secs: env_i64("STALE_ORDER_SECS", 1800),
            intent_ttl_secs: env_i64("INTENT_TTL_SECS", 300),
            cancel_on_start: env_bool("CANCEL_ALL_ON_START", false),
            guards: TradeGuards {
                max_trade_notional: env_f64("MAX_TRADE_NOTIONAL", guard_defaults.max_trade_notional),
                max_total_exposure: env_f64("MAX_TOTAL_EXPOSURE", guard_defaults.max_total_exposure),
                max_spread_bps: env_f64("MAX_SPREAD_BPS", guard_defaults.max_spread_bps),
            },
            breakers: CircuitBreakers {
                max_daily_loss: env_f64("MAX_DAILY_LOSS", breaker_defaults.max_daily_loss),
                max_drawdown_pct: env_f64("MAX_DRAWDOWN_PCT", breaker_defaults.max_drawdown_pct),
                max_consecutive_errors: env_u32(
                    "MAX_CONSECUTIVE_ERRORS",
                    breaker_defaults.max_consecutive_errors,
                ),
                max_daily_trades: env_u32("MAX_DAILY_TRADES", breaker_defaults.max_daily_trades),
            },
            exits: ExitConfig {
                take_profit_pct: env_f64("TAKE_PROFIT_PCT", exit_defaults.take_profit_pct),
                stop_loss_pct: env_f64("STOP_LOSS_PCT", exit_defaults.stop_loss_pct),
                trailing_stop_pct: env_opt("TRAILING_STOP_PCT")
                    .and_then(|v| v.parse::<f64>().ok()),
                priority,
            },
            scan: ScanConfig {
                max_candidates: env_usize("SCAN_CANDIDATES", scan_defaults.max_candidates),
                min_edge: env_f64("MIN_EDGE", scan_defaults.min_edge),
                min_confidence: env_f64("MIN_CONFIDENCE", scan_defaults.min_confidence),
                max_open_positions: env_usize("MAX_OPEN_POSITIONS", scan_defaults.max_open_positions),
                reserve_pct: env_f64("RESERVE_PCT", scan_defaults.reserve_pct),
                max_entries_per_scan: env_usize(
                    "MAX_ENTRIES_PER_SCAN",
                    scan_defaults.max_entries_per_scan,
                ),
                max_entry_notional: env_f64("MAX_TRADE_NOTIONAL", scan_defaults.max_entry_notional),
                min_entry_notional: env_f64("MIN_ENTRY_NOTIONAL", scan_defaults.min_entry_notional),
                history_hours: env_i64("HISTORY_HOURS", scan_defaults.history_hours),
            },
        }
    }

    /// Sanity checks on the resolved values. Returns every problem at
    /// once so a bad `.env` can be fixed in one pass.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.bankroll <= 0.0 {
            issues.push(format!("BANKROLL must be positive, got {}", self.bankroll));
        }
        if self.exchange_calls_per_second <= 0.0 {
            issues.push(format!(
                "EXCHANGE_CALLS_PER_SECOND must be positive, got {}",
                self.exchange_calls_per_second
            ));
        }
        if self.poll_interval_secs == 0 || self.tick_interval_secs == 0 || self.scan_interval_secs == 0
        {
            issues.push("Loop intervals must be at least 1 second".to_string());
        }
        if !(0.0..1.0).contains(&self.scan.reserve_pct) {
            issues.push(format!(
                "RESERVE_PCT must be in [0, 1), got {}",
                self.scan.reserve_pct
            ));
        }
        if self.scan.max_open_positions == 0 {
            issues.push("MAX_OPEN_POSITIONS must be at least 1".to_string());
        }
        if self.exits.take_profit_pct <= 0.0 {
            issues.push(format!(
                "TAKE_PROFIT_PCT must be positive, got {}",
                self.exits.take_profit_pct
            ));
        }
        if !(0.0..1.0).contains(&self.exits.stop_loss_pct) || self.exits.stop_loss_pct == 0.0 {
            issues.push(format!(
                "STOP_LOSS_PCT must be in (0, 1), got {}",
                self.exits.stop_loss_pct
            ));
        }
        if let Some(trailing) = self.exits.trailing_stop_pct {
            if !(0.0..1.0).contains(&trailing) || trailing == 0.0 {
                issues.push(format!("TRAILING_STOP_PCT must be in (0, 1), got {trailing}"));
            }
        }
        if self.scan.min_edge < 0.0 {
            issues.push(format!("MIN_EDGE must not be negative, got {}", self.scan.min_edge));
        }
        if self.guards.max_trade_notional <= 0.0 || self.guards.max_total_exposure <= 0.0 {
            issues.push("Trade and exposure caps must be positive".to_string());
        }

        issues
    }
}
