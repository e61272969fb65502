use chrono::{Duration, Utc};

use crate::models::Market;

/// Quality screen for candidate markets
///
/// Applies multiple checks before a market is worth scoring:
/// 1. Input validation (prices outside (0,1), NaN, infinity)
/// 2. Book sanity (bid must not cross ask)
/// 3. Market must be active
/// 4. Near-resolved markets are skipped (no room left to trade)
/// 5. Markets expiring within a day are skipped
/// 6. Minimum 24h volume threshold
/// 7. Screen-level spread cap (per-trade cap is tighter and checked later)
///
/// Returns (is_tradeable, reason) tuple
pub fn screen_market(market: &Market) -> (bool, String) {
    // 1. Input validation: both sides of the book must be real prices
    for price in [market.best_bid, market.best_ask] {
        if !price.is_finite() || price <= 0.0 || price >= 1.0 {
            return (
                false,
                format!("InvalidData: quote {price} is outside (0, 1)"),
            );
        }
    }

    // 2. Sanity check: a crossed book means stale or broken data
    if market.best_bid > market.best_ask {
        return (
            false,
            format!(
                "CrossedBook: bid {:.3} above ask {:.3}",
                market.best_bid, market.best_ask
            ),
        );
    }

    // 3. Resolved or paused markets cannot be traded
    if !market.active {
        return (false, "Inactive: market is not accepting orders".to_string());
    }

    // 4. Near-resolved: almost no payoff left on the likely side and
    // the unlikely side is a lottery ticket
    let mid = market.mid_price();
    if !(0.05..=0.95).contains(&mid) {
        return (false, format!("NearResolved: mid price {mid:.3}"));
    }

    // 5. Markets about to expire leave no time for an exit
    if let Some(end) = market.end_date {
        if end - Utc::now() < Duration::hours(24) {
            return (false, format!("ExpiringSoon: ends {end}"));
        }
    }

    // 6. Minimum volume floor, dead markets fill badly or not at all
    if market.volume_24h < 500.0 {
        return (false, format!("LowVolume: ${:.0}/24h", market.volume_24h));
    }

    // 7. Extreme spreads are a liquidity red flag even before the
    // per-trade spread guard runs
    let spread_bps = market.spread_bps();
    if spread_bps > 800.0 {
        return (false, format!("WideSpread: {spread_bps:.0} bps"));
    }

    (true, "Tradeable".to_string())
}
