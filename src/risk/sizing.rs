//! Position sizing methods.

/// Raw Kelly fraction: `win_rate - (1 - win_rate) / (avg_win / avg_loss)`.
/// Floored at 0; callers cap it to avoid over-leverage.
pub fn kelly_fraction(win_rate: f64, avg_win: f64, avg_loss: f64) -> f64 {
    if avg_win <= 0.0 || avg_loss <= 0.0 {
        return 0.0;
    }
    let ratio = avg_win / avg_loss;
    (win_rate - (1.0 - win_rate) / ratio).max(0.0)
}

/// Sizing method plus its inputs.
#[derive(Debug, Clone)]
pub enum SizingMethod {
    /// Capped Kelly criterion from observed trade statistics.
    Kelly {
        win_rate: f64,
        avg_win: f64,
        avg_loss: f64,
        cap: f64,
    },
    /// Fixed fraction of the account balance.
    FixedFractional { fraction: f64 },
    /// Scale a base allocation by target vs realized volatility, bounded
    /// to a notional range.
    VolatilityTarget {
        base_fraction: f64,
        target_volatility: f64,
        symbol_volatility: f64,
        min_position_size: f64,
        max_position_size: f64,
    },
}

/// Notional position size in quote currency for the given account balance.
pub fn calculate_position_size(method: &SizingMethod, account_balance: f64) -> f64 {
    if account_balance <= 0.0 {
        return 0.0;
    }

    match method {
        SizingMethod::Kelly {
            win_rate,
            avg_win,
            avg_loss,
            cap,
        } => {
            let fraction = kelly_fraction(*win_rate, *avg_win, *avg_loss).min(*cap);
            fraction * account_balance
        }
        SizingMethod::FixedFractional { fraction } => {
            fraction.clamp(0.0, 1.0) * account_balance
        }
        SizingMethod::VolatilityTarget {
            base_fraction,
            target_volatility,
            symbol_volatility,
            min_position_size,
            max_position_size,
        } => {
            if *symbol_volatility <= 0.0 || *target_volatility <= 0.0 {
                return 0.0;
            }
            let scaled = base_fraction * account_balance * (target_volatility / symbol_volatility);
            scaled.clamp(*min_position_size, *max_position_size)
        }
    }
}
