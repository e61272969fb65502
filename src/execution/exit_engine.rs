use chrono::Utc;
use std::collections::{HashMap, HashSet};

use crate::models::{AutoOrder, AutoOrderState, Position};

/// Tie-break when one tick satisfies both the stop-loss and take-profit
/// bands (a gap across the whole bracket). Stop-loss-first is the
/// default: on ambiguous ticks we assume the worse price was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPriority {
    #[default]
    StopLossFirst,
    TakeProfitFirst,
}

impl ExitPriority {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "STOP_LOSS_FIRST" => Some(Self::StopLossFirst),
            "TAKE_PROFIT_FIRST" => Some(Self::TakeProfitFirst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::TrailingStop => "trailing_stop",
        }
    }
}

/// A fired directive: close this much of the position at market
#[derive(Debug, Clone)]
pub struct ExitTrigger {
    pub position_key: String,
    pub reason: ExitReason,
    pub trigger_price: f64,
    pub size: f64,
}

/// What one price tick did to a directive
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub trigger: Option<ExitTrigger>,
    /// Directive state moved (high water mark or trigger) and needs persisting
    pub updated: Option<AutoOrder>,
}

/// Exit band parameters applied when arming a position
#[derive(Debug, Clone)]
pub struct ExitConfig {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trailing_stop_pct: Option<f64>,
    pub priority: ExitPriority,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: 0.30,
            stop_loss_pct: 0.15,
            trailing_stop_pct: None,
            priority: ExitPriority::default(),
        }
    }
}

/// Price bands live in (0, 1), so targets are pinned inside it
const MAX_EXIT_PRICE: f64 = 0.99;
const MIN_EXIT_PRICE: f64 = 0.01;

/// Tracks one exit directive per open position and evaluates them
/// against price ticks. Pure in-memory; callers persist the directives
/// returned from `arm`, `on_tick` and `cancel`.
pub struct ExitEngine {
    directives: HashMap<String, AutoOrder>,
    priority: ExitPriority,
}

impl ExitEngine {
    pub fn new(priority: ExitPriority) -> Self {
        Self {
            directives: HashMap::new(),
            priority,
        }
    }

    /// Restore persisted directives at startup
    pub fn with_directives(directives: Vec<AutoOrder>, priority: ExitPriority) -> Self {
        let map = directives
            .into_iter()
            .filter(|d| d.state == AutoOrderState::Active)
            .map(|d| (d.position_key.clone(), d))
            .collect::<HashMap<_, _>>();

        tracing::info!("Restored {} active exit directives", map.len());
        Self {
            directives: map,
            priority,
        }
    }

    /// Arm (or re-arm after accumulation) a directive for an open
    /// position. Bands are derived from the current average entry; a
    /// prior high water mark survives re-arming so a trailing stop never
    /// loosens. Returns None when a triggered exit is already in flight.
    pub fn arm(&mut self, position: &Position, cfg: &ExitConfig) -> Option<AutoOrder> {
        let entry = position.avg_entry_price;
        let prior_hwm = match self.directives.get(&position.key) {
            Some(existing) if existing.state == AutoOrderState::Triggered => return None,
            Some(existing) => Some(existing.high_water_mark),
            None => None,
        };

        let directive = AutoOrder {
            position_key: position.key.clone(),
            take_profit: (entry * (1.0 + cfg.take_profit_pct)).min(MAX_EXIT_PRICE),
            stop_loss: (entry * (1.0 - cfg.stop_loss_pct)).max(MIN_EXIT_PRICE),
            trailing_pct: cfg.trailing_stop_pct,
            high_water_mark: prior_hwm.map_or(entry, |h| h.max(entry)),
            state: AutoOrderState::Active,
            created_at: Utc::now(),
            triggered_at: None,
        };

        self.directives
            .insert(position.key.clone(), directive.clone());
        Some(directive)
    }

    /// Evaluate one price tick against the position's directive. The
    /// high water mark ratchets up before any band is checked; trailing
    /// is always evaluated after both fixed bands.
    pub fn on_tick(&mut self, position: &Position, price: f64) -> TickOutcome {
        let directive = match self.directives.get_mut(&position.key) {
            Some(d) if d.state == AutoOrderState::Active => d,
            _ => return TickOutcome::default(),
        };

        let mut moved = false;
        if price > directive.high_water_mark {
            directive.high_water_mark = price;
            moved = true;
        }

        let stop_hit = price <= directive.stop_loss;
        let profit_hit = price >= directive.take_profit;
        let trailing_hit = directive
            .trailing_trigger()
            .map_or(false, |t| price <= t);

        let reason = match self.priority {
            ExitPriority::StopLossFirst if stop_hit => Some(ExitReason::StopLoss),
            ExitPriority::StopLossFirst if profit_hit => Some(ExitReason::TakeProfit),
            ExitPriority::TakeProfitFirst if profit_hit => Some(ExitReason::TakeProfit),
            ExitPriority::TakeProfitFirst if stop_hit => Some(ExitReason::StopLoss),
            _ if trailing_hit => Some(ExitReason::TrailingStop),
            _ => None,
        };

        match reason {
            Some(reason) => {
                directive.state = AutoOrderState::Triggered;
                directive.triggered_at = Some(Utc::now());

                TickOutcome {
                    trigger: Some(ExitTrigger {
                        position_key: position.key.clone(),
                        reason,
                        trigger_price: price,
                        size: position.size,
                    }),
                    updated: Some(directive.clone()),
                }
            }
            None => TickOutcome {
                trigger: None,
                updated: moved.then(|| directive.clone()),
            },
        }
    }

    /// Drop a position's directive, marking it cancelled for persistence
    pub fn cancel(&mut self, key: &str) -> Option<AutoOrder> {
        self.directives.remove(key).map(|mut d| {
            d.state = AutoOrderState::Cancelled;
            d
        })
    }

    /// Sweep directives whose position no longer exists. Returns the
    /// cancelled directives for persistence.
    pub fn retain_for(&mut self, open_keys: &HashSet<String>) -> Vec<AutoOrder> {
        let orphaned: Vec<String> = self
            .directives
            .keys()
            .filter(|k| !open_keys.contains(*k))
            .cloned()
            .collect();

        orphaned
            .iter()
            .filter_map(|key| self.cancel(key))
            .collect()
    }

    pub fn directive(&self, key: &str) -> Option<&AutoOrder> {
        self.directives.get(key)
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}
