use thiserror::Error;

/// Limits that halt all new entries when breached. A trip flips the
/// kill switch; exits keep working so the book can still be flattened.
#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    /// Realized loss allowed per UTC day, in dollars
    pub max_daily_loss: f64,
    /// Drawdown from peak equity, as a fraction
    pub max_drawdown_pct: f64,
    /// Consecutive failed API interactions before trading halts
    pub max_consecutive_errors: u32,
    /// Entries allowed per UTC day
    pub max_daily_trades: u32,
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self {
            max_daily_loss: 50.0,
            max_drawdown_pct: 0.20,
            max_consecutive_errors: 10,
            max_daily_trades: 10,
        }
    }
}

/// Snapshot of the numbers the breakers look at
#[derive(Debug, Clone)]
pub struct TradingState {
    pub equity: f64,
    pub peak_equity: f64,
    pub daily_realized: f64,
    pub consecutive_errors: u32,
    pub daily_trades: u32,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CircuitBreakerTrip {
    #[error("daily loss ${loss:.2} exceeds ${limit:.2} limit")]
    DailyLoss { loss: f64, limit: f64 },
    #[error("drawdown {pct:.1}% exceeds {limit:.1}% limit")]
    Drawdown { pct: f64, limit: f64 },
    #[error("{count} consecutive errors")]
    ConsecutiveErrors { count: u32 },
    #[error("daily trade limit of {limit} reached")]
    DailyTradeLimit { limit: u32 },
}

impl CircuitBreakers {
    pub fn check(&self, state: &TradingState) -> Result<(), CircuitBreakerTrip> {
        if state.daily_realized <= -self.max_daily_loss {
            return Err(CircuitBreakerTrip::DailyLoss {
                loss: -state.daily_realized,
                limit: self.max_daily_loss,
            });
        }

        if state.peak_equity > 0.0 {
            let drawdown = (state.peak_equity - state.equity) / state.peak_equity;
            if drawdown >= self.max_drawdown_pct {
                return Err(CircuitBreakerTrip::Drawdown {
                    pct: drawdown * 100.0,
                    limit: self.max_drawdown_pct * 100.0,
                });
            }
        }

        if state.consecutive_errors >= self.max_consecutive_errors {
            return Err(CircuitBreakerTrip::ConsecutiveErrors {
                count: state.consecutive_errors,
            });
        }

        if state.daily_trades >= self.max_daily_trades {
            return Err(CircuitBreakerTrip::DailyTradeLimit {
                limit: self.max_daily_trades,
            });
        }

        Ok(())
    }
}
