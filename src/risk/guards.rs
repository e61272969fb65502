use thiserror::Error;

use crate::models::{Quote, TradeIntent};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuardViolation {
    #[error("size {size} is not a positive finite number")]
    NonPositiveSize { size: f64 },
    #[error("price {price} is outside (0, 1)")]
    PriceOutOfRange { price: f64 },
    #[error("trade notional ${notional:.2} exceeds ${cap:.2} cap")]
    TradeTooLarge { notional: f64, cap: f64 },
    #[error("exposure would reach ${would_be:.2}, cap is ${cap:.2}")]
    ExposureExceeded { would_be: f64, cap: f64 },
    #[error("spread {bps:.0} bps exceeds {cap:.0} bps cap")]
    SpreadTooWide { bps: f64, cap: f64 },
}

/// Static pre-trade checks every entry must clear. These run against
/// state already in hand; a rejection costs no API call.
#[derive(Debug, Clone)]
pub struct TradeGuards {
    /// Maximum notional per trade, in dollars
    pub max_trade_notional: f64,
    /// Maximum total capital deployed across open positions, in dollars
    pub max_total_exposure: f64,
    /// Widest tolerable bid/ask spread, in basis points of the mid
    pub max_spread_bps: f64,
}

impl Default for TradeGuards {
    fn default() -> Self {
        Self {
            max_trade_notional: 100.0,
            max_total_exposure: 1000.0,
            max_spread_bps: 150.0,
        }
    }
}

impl TradeGuards {
    /// Validate an entry against the quote it was priced from and the
    /// capital currently deployed
    pub fn check_entry(
        &self,
        intent: &TradeIntent,
        current_exposure: f64,
        quote: &Quote,
    ) -> Result<(), GuardViolation> {
        if !intent.size.is_finite() || intent.size <= 0.0 {
            return Err(GuardViolation::NonPositiveSize { size: intent.size });
        }

        if !intent.limit_price.is_finite()
            || intent.limit_price <= 0.0
            || intent.limit_price >= 1.0
        {
            return Err(GuardViolation::PriceOutOfRange {
                price: intent.limit_price,
            });
        }

        let notional = intent.size * intent.limit_price;
        if notional > self.max_trade_notional {
            return Err(GuardViolation::TradeTooLarge {
                notional,
                cap: self.max_trade_notional,
            });
        }

        let would_be = current_exposure + notional;
        if would_be > self.max_total_exposure {
            return Err(GuardViolation::ExposureExceeded {
                would_be,
                cap: self.max_total_exposure,
            });
        }

        let spread = quote.spread_bps();
        if spread > self.max_spread_bps {
            return Err(GuardViolation::SpreadTooWide {
                bps: spread,
                cap: self.max_spread_bps,
            });
        }

        Ok(())
    }
}
