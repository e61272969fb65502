use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One binary market on the exchange, with both outcome tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub slug: String,
    pub question: String,
    pub token_id_yes: String,
    pub token_id_no: String,
    pub price_yes: f64,
    pub price_no: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub volume_24h: f64,
    pub end_date: Option<DateTime<Utc>>,
    pub active: bool,
}

impl Market {
    pub fn mid_price(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }

    /// Bid/ask spread in basis points of the mid price
    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid_price();
        if mid <= 0.0 {
            return f64::INFINITY;
        }
        (self.best_ask - self.best_bid) / mid * 10_000.0
    }

    pub fn token_id(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Yes => &self.token_id_yes,
            Outcome::No => &self.token_id_no,
        }
    }
}

/// Which outcome token of a market is held or traded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "YES" => Some(Outcome::Yes),
            "NO" => Some(Outcome::No),
            _ => None,
        }
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Live,
    PartiallyFilled,
    Matched,
    Cancelled,
    Expired,
}

impl OrderStatus {
    /// Terminal orders never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Matched | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Live => "LIVE",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Matched => "MATCHED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LIVE" => Some(OrderStatus::Live),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "MATCHED" => Some(OrderStatus::Matched),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// One exchange order as tracked locally.
///
/// `filled_size` only ever grows while the order is live; once the status is
/// terminal the record is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub market: String,
    pub outcome: Outcome,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_fill_price: f64,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(
        id: String,
        market: String,
        outcome: Outcome,
        side: Side,
        size: f64,
        price: f64,
    ) -> Self {
        Self {
            id,
            market,
            outcome,
            side,
            size,
            price,
            status: OrderStatus::Live,
            filled_size: 0.0,
            avg_fill_price: 0.0,
            created_at: Utc::now(),
            last_polled_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Exchanges report dust short of the requested size as fully matched
    pub fn is_fully_filled(&self) -> bool {
        self.filled_size >= self.size * 0.999
    }
}

/// Immutable record of newly observed fill volume on one order.
///
/// `cumulative_filled` is the order's total filled size after this fill; the
/// (order id, cumulative_filled) pair makes application idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: String,
    pub market: String,
    pub outcome: Outcome,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub cumulative_filled: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(PositionStatus::Open),
            "CLOSED" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// Storage and book key for one market/side holding
pub fn position_key(market: &str, outcome: Outcome) -> String {
    format!("{}:{}", market, outcome.as_str())
}

/// Aggregate holding of one outcome token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub key: String,
    pub market: String,
    pub outcome: Outcome,
    pub size: f64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Cost basis of the remaining size
    pub fn notional(&self) -> f64 {
        self.size * self.avg_entry_price
    }

    /// Mark-to-market P&L; computed on read, never stored
    pub fn unrealized_pnl(&self, mark_price: f64) -> f64 {
        (mark_price - self.avg_entry_price) * self.size
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AutoOrderState {
    Active,
    Triggered,
    Cancelled,
}

impl AutoOrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoOrderState::Active => "ACTIVE",
            AutoOrderState::Triggered => "TRIGGERED",
            AutoOrderState::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(AutoOrderState::Active),
            "TRIGGERED" => Some(AutoOrderState::Triggered),
            "CANCELLED" => Some(AutoOrderState::Cancelled),
            _ => None,
        }
    }
}

/// Exit directive bound to one position: fixed TP/SL bands plus an optional
/// trailing stop riding the high-water mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoOrder {
    pub position_key: String,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub trailing_pct: Option<f64>,
    pub high_water_mark: f64,
    pub state: AutoOrderState,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

impl AutoOrder {
    /// Current trailing trigger price, or None if trailing is not configured
    pub fn trailing_trigger(&self) -> Option<f64> {
        self.trailing_pct
            .map(|pct| self.high_water_mark * (1.0 - pct))
    }
}

/// A request to trade, produced by scan/exit logic and judged by the
/// orchestrator. `reason` travels into logs and the intent ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: Uuid,
    pub market: String,
    pub outcome: Outcome,
    pub side: Side,
    pub size: f64,
    pub limit_price: f64,
    pub reason: String,
}

impl TradeIntent {
    pub fn new(
        market: impl Into<String>,
        outcome: Outcome,
        side: Side,
        size: f64,
        limit_price: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            market: market.into(),
            outcome,
            side,
            size,
            limit_price,
            reason: reason.into(),
        }
    }

    /// Key for duplicate-entry suppression within the intent TTL
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{:.4}:{:.4}",
            self.market,
            self.outcome.as_str(),
            self.side.as_str(),
            self.size,
            self.limit_price
        )
    }
}

/// Top-of-book quote for one token
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub mid: f64,
}

impl Quote {
    pub fn spread_bps(&self) -> f64 {
        if self.mid <= 0.0 {
            return f64::INFINITY;
        }
        (self.ask - self.bid) / self.mid * 10_000.0
    }
}

/// One stored price observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub market: String,
    pub price: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Recent observations for both outcome tokens of a market
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    pub yes: Vec<PricePoint>,
    pub no: Vec<PricePoint>,
}

/// Read-only view of the whole portfolio for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub open_positions: Vec<Position>,
    pub closed_positions: Vec<Position>,
    pub pending_orders: Vec<Order>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
}

/// Minimal active market for tests
#[cfg(test)]
pub fn test_market(id: &str, price_yes: f64) -> Market {
    Market {
        id: id.to_string(),
        slug: format!("{}-slug", id),
        question: "Will it happen?".to_string(),
        token_id_yes: format!("{}-yes", id),
        token_id_no: format!("{}-no", id),
        price_yes,
        price_no: 1.0 - price_yes,
        best_bid: price_yes - 0.01,
        best_ask: price_yes + 0.01,
        volume_24h: 10_000.0,
        end_date: None,
        active: true,
    }
}
