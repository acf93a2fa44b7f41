//! Account balance and open-position ownership.
//!
//! The position manager is the only component that mutates positions or the
//! balance. Opening debits `size × fill + commission`; closing credits the
//! escrowed notional plus realized P&L minus commission, for longs and shorts
//! alike.

use std::collections::BTreeMap;

use super::execution::{calculate_commission, entry_fill_price, exit_fill_price, ExecutionConfig};
use super::position::{Direction, ExitReason, Position, Trade};
use super::risk::StopLevels;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PositionError {
    #[error("position already open for {0}")]
    AlreadyOpen(String),

    #[error("position size {size} for {symbol} must be positive")]
    InvalidSize { symbol: String, size: f64 },

    #[error("opening {symbol} costs {cost:.4} but balance is {balance:.4}")]
    InsufficientBalance {
        symbol: String,
        cost: f64,
        balance: f64,
    },

    #[error("no open position for {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionManager {
    balance: f64,
    initial_balance: f64,
    positions: BTreeMap<String, Position>,
    execution: ExecutionConfig,
}

impl PositionManager {
    pub fn new(initial_balance: f64, execution: ExecutionConfig) -> Self {
        PositionManager {
            balance: initial_balance,
            initial_balance,
            positions: BTreeMap::new(),
            execution,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn execution(&self) -> &ExecutionConfig {
        &self.execution
    }

    pub fn get_position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Open positions in symbol order.
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Σ market value of open positions at their last mark.
    pub fn positions_value(&self) -> f64 {
        self.positions.values().map(Position::value).sum()
    }

    pub fn equity(&self) -> f64 {
        self.balance + self.positions_value()
    }

    /// Total debit (notional + commission) for opening at `market_price`.
    pub fn entry_cost(&self, direction: Direction, size: f64, market_price: f64) -> f64 {
        let fill = entry_fill_price(direction, market_price, &self.execution);
        let notional = size * fill;
        notional + calculate_commission(notional, &self.execution)
    }

    /// Whether a long of `size` at `market_price` could be opened now.
    pub fn can_open(&self, symbol: &str, size: f64, market_price: f64) -> bool {
        !self.has_position(symbol)
            && size > 0.0
            && self.entry_cost(Direction::Long, size, market_price) <= self.balance
    }

    /// Open a position without stop/take-profit levels.
    pub fn open(
        &mut self,
        symbol: &str,
        direction: Direction,
        size: f64,
        market_price: f64,
        timestamp: i64,
    ) -> Result<&Position, PositionError> {
        self.open_with_stops(
            symbol,
            direction,
            size,
            market_price,
            timestamp,
            StopLevels::NONE,
        )
    }

    /// Open a position. `stops` are absolute trigger prices.
    pub fn open_with_stops(
        &mut self,
        symbol: &str,
        direction: Direction,
        size: f64,
        market_price: f64,
        timestamp: i64,
        stops: StopLevels,
    ) -> Result<&Position, PositionError> {
        if self.has_position(symbol) {
            return Err(PositionError::AlreadyOpen(symbol.to_string()));
        }
        if !size.is_finite() || size <= 0.0 {
            return Err(PositionError::InvalidSize {
                symbol: symbol.to_string(),
                size,
            });
        }

        let fill = entry_fill_price(direction, market_price, &self.execution);
        let notional = size * fill;
        let fee = calculate_commission(notional, &self.execution);
        let total_cost = notional + fee;

        if total_cost > self.balance {
            return Err(PositionError::InsufficientBalance {
                symbol: symbol.to_string(),
                cost: total_cost,
                balance: self.balance,
            });
        }

        self.balance -= total_cost;

        let position = Position {
            symbol: symbol.to_string(),
            direction,
            size,
            entry_price: fill,
            entry_timestamp: timestamp,
            stop_loss: stops.stop_loss,
            take_profit: stops.take_profit,
            entry_fee: fee,
            unrealized_pnl: 0.0,
        };

        let stored = self
            .positions
            .entry(symbol.to_string())
            .or_insert(position);
        Ok(&*stored)
    }

    /// Close the position on `symbol` at a signal-driven market price.
    pub fn close(
        &mut self,
        symbol: &str,
        market_price: f64,
        timestamp: i64,
    ) -> Result<Trade, PositionError> {
        self.close_with_reason(symbol, market_price, timestamp, ExitReason::Signal)
    }

    pub fn close_with_reason(
        &mut self,
        symbol: &str,
        market_price: f64,
        timestamp: i64,
        reason: ExitReason,
    ) -> Result<Trade, PositionError> {
        let position = self
            .positions
            .remove(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;

        let fill = exit_fill_price(position.direction, market_price, &self.execution);
        let exit_value = position.size * fill;
        let exit_fee = calculate_commission(exit_value, &self.execution);
        let pnl = position.pnl_at(fill);

        // Long: the sale proceeds. Short: escrowed notional plus price difference.
        self.balance += position.cost_basis() + pnl - exit_fee;

        Ok(Trade {
            symbol: position.symbol,
            direction: position.direction,
            size: position.size,
            entry_price: position.entry_price,
            exit_price: fill,
            entry_timestamp: position.entry_timestamp,
            exit_timestamp: timestamp,
            pnl,
            fees: position.entry_fee + exit_fee,
            exit_reason: reason,
        })
    }

    /// Revalue the position on `symbol` at `price`, returning its unrealized P&L.
    pub fn mark_to_market(&mut self, symbol: &str, price: f64) -> Result<f64, PositionError> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| PositionError::NotFound(symbol.to_string()))?;
        position.unrealized_pnl = position.pnl_at(price);
        Ok(position.unrealized_pnl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> ExecutionConfig {
        ExecutionConfig {
            commission_per_trade: 10.0,
            commission_pct: 0.1,
            slippage_pct: 0.05,
            allow_shorting: true,
        }
    }

    fn no_fees() -> PositionManager {
        PositionManager::new(10_000.0, ExecutionConfig::default())
    }

    #[test]
    fn new_manager() {
        let pm = no_fees();
        assert_eq!(pm.balance(), 10_000.0);
        assert_eq!(pm.initial_balance(), 10_000.0);
        assert_eq!(pm.position_count(), 0);
        assert_eq!(pm.equity(), 10_000.0);
    }

    #[test]
    fn long_round_trip_without_fees() {
        let mut pm = no_fees();
        pm.open("BTCUSDT", Direction::Long, 1.0, 100.0, 1_000).unwrap();
        assert!((pm.balance() - 9_900.0).abs() < f64::EPSILON);

        let trade = pm.close("BTCUSDT", 110.0, 2_000).unwrap();
        assert!((trade.pnl - 10.0).abs() < f64::EPSILON);
        assert_eq!(trade.fees, 0.0);
        assert_eq!(trade.exit_reason, ExitReason::Signal);
        assert!((pm.balance() - 10_010.0).abs() < 1e-9);
        assert!(!pm.has_position("BTCUSDT"));
    }

    #[test]
    fn open_debits_commission_and_slippage() {
        let mut pm = PositionManager::new(100_000.0, make_config());
        let pos = pm
            .open("BTCUSDT", Direction::Long, 10.0, 100.0, 1_000)
            .unwrap()
            .clone();

        let fill = 100.0 * 1.0005;
        assert!((pos.entry_price - fill).abs() < f64::EPSILON);
        let notional = 10.0 * fill;
        let fee = 10.0 + notional * 0.1 / 100.0;
        assert!((pos.entry_fee - fee).abs() < 1e-9);
        assert!((pm.balance() - (100_000.0 - notional - fee)).abs() < 1e-9);
    }

    #[test]
    fn open_refused_when_balance_would_go_negative() {
        let mut pm = no_fees();
        let err = pm
            .open("BTCUSDT", Direction::Long, 101.0, 100.0, 1_000)
            .unwrap_err();
        assert!(matches!(err, PositionError::InsufficientBalance { .. }));
        assert_eq!(pm.balance(), 10_000.0);
        assert!(!pm.has_position("BTCUSDT"));
    }

    #[test]
    fn open_refused_for_duplicate_symbol() {
        let mut pm = no_fees();
        pm.open("BTCUSDT", Direction::Long, 1.0, 100.0, 1_000).unwrap();
        let err = pm
            .open("BTCUSDT", Direction::Long, 1.0, 100.0, 2_000)
            .unwrap_err();
        assert_eq!(err, PositionError::AlreadyOpen("BTCUSDT".into()));
        assert_eq!(pm.position_count(), 1);
    }

    #[test]
    fn open_refused_for_non_positive_size() {
        let mut pm = no_fees();
        assert!(matches!(
            pm.open("BTCUSDT", Direction::Long, 0.0, 100.0, 1_000),
            Err(PositionError::InvalidSize { .. })
        ));
    }

    #[test]
    fn can_open_checks_balance_and_duplicates() {
        let mut pm = no_fees();
        assert!(pm.can_open("BTCUSDT", 100.0, 100.0));
        assert!(!pm.can_open("BTCUSDT", 100.1, 100.0));
        pm.open("BTCUSDT", Direction::Long, 1.0, 100.0, 1_000).unwrap();
        assert!(!pm.can_open("BTCUSDT", 1.0, 100.0));
    }

    #[test]
    fn short_round_trip_profit() {
        let mut pm = no_fees();
        pm.open("ETHUSDT", Direction::Short, 10.0, 100.0, 1_000).unwrap();
        assert!((pm.balance() - 9_000.0).abs() < f64::EPSILON);

        let trade = pm.close("ETHUSDT", 90.0, 2_000).unwrap();
        assert!((trade.pnl - 100.0).abs() < 1e-9);
        assert!((pm.balance() - 10_100.0).abs() < 1e-9);
    }

    #[test]
    fn short_round_trip_with_costs() {
        let mut pm = PositionManager::new(100_000.0, make_config());
        pm.open("ETHUSDT", Direction::Short, 10.0, 100.0, 1_000).unwrap();
        let trade = pm.close("ETHUSDT", 90.0, 2_000).unwrap();

        let entry = 100.0 * 0.9995;
        let exit = 90.0 * 1.0005;
        assert!((trade.entry_price - entry).abs() < f64::EPSILON);
        assert!((trade.exit_price - exit).abs() < f64::EPSILON);
        assert!((trade.pnl - (entry - exit) * 10.0).abs() < 1e-9);

        let expected = 100_000.0 + trade.pnl - trade.fees;
        assert!((pm.balance() - expected).abs() < 1e-6);
    }

    #[test]
    fn close_unknown_symbol_is_not_found() {
        let mut pm = no_fees();
        let err = pm.close("XYZ", 100.0, 1_000).unwrap_err();
        assert_eq!(err, PositionError::NotFound("XYZ".into()));
        assert_eq!(pm.balance(), 10_000.0);
    }

    #[test]
    fn close_records_reason() {
        let mut pm = no_fees();
        pm.open("BTCUSDT", Direction::Long, 1.0, 100.0, 1_000).unwrap();
        let trade = pm
            .close_with_reason("BTCUSDT", 98.0, 2_000, ExitReason::StopLoss)
            .unwrap();
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert!((trade.pnl + 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mark_to_market_updates_equity() {
        let mut pm = no_fees();
        pm.open("BTCUSDT", Direction::Long, 10.0, 100.0, 1_000).unwrap();
        let unrealized = pm.mark_to_market("BTCUSDT", 105.0).unwrap();
        assert!((unrealized - 50.0).abs() < f64::EPSILON);
        assert!((pm.positions_value() - 1_050.0).abs() < f64::EPSILON);
        assert!((pm.equity() - 10_050.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mark_to_market_unknown_symbol() {
        let mut pm = no_fees();
        assert!(pm.mark_to_market("XYZ", 1.0).is_err());
    }

    #[test]
    fn positions_iterate_in_symbol_order() {
        let mut pm = no_fees();
        pm.open("SOLUSDT", Direction::Long, 1.0, 10.0, 1_000).unwrap();
        pm.open("ADAUSDT", Direction::Long, 1.0, 10.0, 1_000).unwrap();
        let symbols: Vec<&str> = pm.positions().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols, ["ADAUSDT", "SOLUSDT"]);
    }
}
