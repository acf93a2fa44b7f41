//! Fill simulation: commission and slippage.
//!
//! Prices arriving here are the engine's chosen fill reference (bar close or a
//! stop/take-profit trigger price); slippage always moves the fill against
//! the trader.

use crate::domain::position::Direction;

/// Costs applied by the position manager on every fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionConfig {
    pub commission_per_trade: f64,
    /// Percent of notional, e.g. 0.1 = 0.1%.
    pub commission_pct: f64,
    /// Percent of price, e.g. 0.05 = 0.05%.
    pub slippage_pct: f64,
    pub allow_shorting: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            commission_per_trade: 0.0,
            commission_pct: 0.0,
            slippage_pct: 0.0,
            allow_shorting: false,
        }
    }
}

/// Calculate commission: flat_fee + (trade_value * pct / 100).
pub fn calculate_commission(trade_value: f64, config: &ExecutionConfig) -> f64 {
    config.commission_per_trade + (trade_value * config.commission_pct / 100.0)
}

/// Buying: execution_price = market_price * (1 + slippage_pct / 100)
pub fn apply_slippage_buy(market_price: f64, slippage_pct: f64) -> f64 {
    market_price * (1.0 + slippage_pct / 100.0)
}

/// Selling: execution_price = market_price * (1 - slippage_pct / 100)
pub fn apply_slippage_sell(market_price: f64, slippage_pct: f64) -> f64 {
    market_price * (1.0 - slippage_pct / 100.0)
}

/// Fill price for opening a position in `direction`.
pub fn entry_fill_price(direction: Direction, market_price: f64, config: &ExecutionConfig) -> f64 {
    match direction {
        Direction::Long => apply_slippage_buy(market_price, config.slippage_pct),
        Direction::Short => apply_slippage_sell(market_price, config.slippage_pct),
    }
}

/// Fill price for closing a position held in `direction`.
pub fn exit_fill_price(direction: Direction, market_price: f64, config: &ExecutionConfig) -> f64 {
    match direction {
        Direction::Long => apply_slippage_sell(market_price, config.slippage_pct),
        Direction::Short => apply_slippage_buy(market_price, config.slippage_pct),
    }
}
