//! Risk budget enforcement, position sizing, and stop/take-profit triggers.
//!
//! Entry validation runs in a fixed order and stops at the first failure:
//! 1. max concurrent open positions
//! 2. per-trade risk as a fraction of balance
//! 3. aggregate portfolio risk as a fraction of equity
//! 4. stop-loss/take-profit distances strictly positive
//! 5. non-zero size that the balance can pay for
//!
//! "Risk" of a position is the loss taken if its stop is hit:
//! `size × entry_price × stop_loss_fraction`.

use log::debug;

use super::error::{BuildError, RejectReason};
use super::execution::{calculate_commission, entry_fill_price, ExecutionConfig};
use super::ohlcv::Bar;
use super::position::{Direction, ExitReason, Position};
use super::position_manager::PositionManager;

/// Relative slack for float comparisons against risk limits.
const LIMIT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskBudget {
    pub max_open_positions: usize,
    /// Fraction of balance that may be lost on one trade if its stop is hit.
    pub max_risk_per_trade: f64,
    /// Fraction of equity that may be at risk across all open positions.
    pub max_portfolio_risk: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Cap on one position's notional as a fraction of balance.
    pub max_position_fraction: f64,
    /// Sizes are rounded down to a multiple of this; 0 allows fractional sizes.
    pub size_increment: f64,
}

impl Default for RiskBudget {
    fn default() -> Self {
        RiskBudget {
            max_open_positions: 1,
            max_risk_per_trade: 0.02,
            max_portfolio_risk: 0.06,
            stop_loss: 0.02,
            take_profit: 0.04,
            max_position_fraction: 1.0,
            size_increment: 0.0,
        }
    }
}

impl RiskBudget {
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.max_open_positions == 0 {
            return Err(invalid("max_open_positions", "must be at least 1"));
        }
        check_unit_fraction("max_risk_per_trade", self.max_risk_per_trade)?;
        check_unit_fraction("max_portfolio_risk", self.max_portfolio_risk)?;
        check_unit_fraction("max_position_fraction", self.max_position_fraction)?;
        if !self.stop_loss.is_finite() || self.stop_loss <= 0.0 || self.stop_loss >= 1.0 {
            return Err(invalid("stop_loss", "must be in (0, 1)"));
        }
        if !self.take_profit.is_finite() || self.take_profit <= 0.0 {
            return Err(invalid("take_profit", "must be positive"));
        }
        if !self.size_increment.is_finite() || self.size_increment < 0.0 {
            return Err(invalid("size_increment", "must be non-negative"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> BuildError {
    BuildError::InvalidRiskBudget {
        field,
        reason: reason.to_string(),
    }
}

fn check_unit_fraction(field: &'static str, value: f64) -> Result<(), BuildError> {
    if !value.is_finite() || value <= 0.0 || value > 1.0 {
        return Err(invalid(field, "must be in (0, 1]"));
    }
    Ok(())
}

/// Absolute trigger prices; 0.0 disables a level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopLevels {
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl StopLevels {
    pub const NONE: StopLevels = StopLevels {
        stop_loss: 0.0,
        take_profit: 0.0,
    };
}

/// What the risk manager needs to know about the account.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountState {
    pub balance: f64,
    pub equity: f64,
    pub open_positions: usize,
    /// Σ risk of open positions.
    pub open_risk: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Accept,
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopTrigger {
    StopLoss(f64),
    TakeProfit(f64),
}

impl StopTrigger {
    pub fn price(self) -> f64 {
        match self {
            StopTrigger::StopLoss(p) | StopTrigger::TakeProfit(p) => p,
        }
    }

    pub fn exit_reason(self) -> ExitReason {
        match self {
            StopTrigger::StopLoss(_) => ExitReason::StopLoss,
            StopTrigger::TakeProfit(_) => ExitReason::TakeProfit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskManager {
    budget: RiskBudget,
    execution: ExecutionConfig,
}

impl RiskManager {
    pub fn new(budget: RiskBudget, execution: ExecutionConfig) -> Self {
        RiskManager { budget, execution }
    }

    pub fn budget(&self) -> &RiskBudget {
        &self.budget
    }

    /// Loss taken if a position of `size` entered at `price` hits its stop.
    pub fn trade_risk(&self, size: f64, price: f64) -> f64 {
        size * price * self.budget.stop_loss
    }

    pub fn account_state(&self, positions: &PositionManager) -> AccountState {
        AccountState {
            balance: positions.balance(),
            equity: positions.equity(),
            open_positions: positions.position_count(),
            open_risk: positions
                .positions()
                .map(|p| self.trade_risk(p.size, p.entry_price))
                .sum(),
        }
    }

    /// Size bounded by `risk_per_trade × balance ÷ (price × stop_loss)`, by the
    /// notional cap, and rounded down to the size increment.
    pub fn calculate_position_size(&self, direction: Direction, price: f64, balance: f64) -> f64 {
        if price <= 0.0 || balance <= 0.0 {
            return 0.0;
        }
        let risk_size =
            self.budget.max_risk_per_trade * balance / (price * self.budget.stop_loss);

        let fill = entry_fill_price(direction, price, &self.execution);
        let budget = self.budget.max_position_fraction * balance - self.execution.commission_per_trade;
        let cap_notional = budget / (1.0 + self.execution.commission_pct / 100.0);
        let cap_size = (cap_notional / fill).max(0.0);

        let size = risk_size.min(cap_size);
        let size = if self.budget.size_increment > 0.0 {
            (size / self.budget.size_increment).floor() * self.budget.size_increment
        } else {
            size
        };
        if size.is_finite() { size.max(0.0) } else { 0.0 }
    }

    /// Absolute stop-loss and take-profit prices for an entry at `entry_price`.
    pub fn stop_levels(&self, direction: Direction, entry_price: f64) -> StopLevels {
        match direction {
            Direction::Long => StopLevels {
                stop_loss: entry_price * (1.0 - self.budget.stop_loss),
                take_profit: entry_price * (1.0 + self.budget.take_profit),
            },
            Direction::Short => StopLevels {
                stop_loss: entry_price * (1.0 + self.budget.stop_loss),
                take_profit: entry_price * (1.0 - self.budget.take_profit),
            },
        }
    }

    pub fn validate_trade(
        &self,
        symbol: &str,
        direction: Direction,
        size: f64,
        price: f64,
        account: &AccountState,
    ) -> RiskDecision {
        let decision = self.evaluate(direction, size, price, account);
        if let RiskDecision::Reject(reason) = &decision {
            debug!("{direction} {symbol} size {size:.6} @ {price}: rejected ({reason})");
        }
        decision
    }

    fn evaluate(
        &self,
        direction: Direction,
        size: f64,
        price: f64,
        account: &AccountState,
    ) -> RiskDecision {
        if account.open_positions >= self.budget.max_open_positions {
            return RiskDecision::Reject(RejectReason::MaxOpenPositions {
                open: account.open_positions,
                max: self.budget.max_open_positions,
            });
        }

        let risk = self.trade_risk(size, price);
        let trade_limit = self.budget.max_risk_per_trade * account.balance;
        if exceeds(risk, trade_limit) {
            return RiskDecision::Reject(RejectReason::TradeRiskExceeded {
                risk,
                limit: trade_limit,
            });
        }

        let portfolio_risk = account.open_risk + risk;
        let portfolio_limit = self.budget.max_portfolio_risk * account.equity;
        if exceeds(portfolio_risk, portfolio_limit) {
            return RiskDecision::Reject(RejectReason::PortfolioRiskExceeded {
                risk: portfolio_risk,
                limit: portfolio_limit,
            });
        }

        let levels = self.stop_levels(direction, price);
        let stop_distance = (price - levels.stop_loss).abs();
        let take_distance = (levels.take_profit - price).abs();
        if !(stop_distance > 0.0 && take_distance > 0.0 && levels.take_profit > 0.0) {
            return RiskDecision::Reject(RejectReason::InvalidStopDistance);
        }

        if !(size > 0.0) {
            return RiskDecision::Reject(RejectReason::ZeroSize);
        }

        let fill = entry_fill_price(direction, price, &self.execution);
        let notional = size * fill;
        let cost = notional + calculate_commission(notional, &self.execution);
        if cost > account.balance {
            return RiskDecision::Reject(RejectReason::InsufficientBalance {
                cost,
                balance: account.balance,
            });
        }

        RiskDecision::Accept
    }

    /// Check `bar`'s intra-bar extremes against the position's trigger levels.
    /// The stop-loss wins when both levels fall inside one bar.
    pub fn check_stop_conditions(&self, position: &Position, bar: &Bar) -> Option<StopTrigger> {
        let (adverse, favourable) = match position.direction {
            Direction::Long => (bar.low, bar.high),
            Direction::Short => (bar.high, bar.low),
        };
        if position.should_stop_loss(adverse) {
            Some(StopTrigger::StopLoss(position.stop_loss))
        } else if position.should_take_profit(favourable) {
            Some(StopTrigger::TakeProfit(position.take_profit))
        } else {
            None
        }
    }
}

fn exceeds(value: f64, limit: f64) -> bool {
    value > limit + limit.abs() * LIMIT_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::timeframe::Timeframe;

    fn manager(budget: RiskBudget) -> RiskManager {
        RiskManager::new(budget, ExecutionConfig::default())
    }

    fn account(balance: f64, open_positions: usize, open_risk: f64) -> AccountState {
        AccountState {
            balance,
            equity: balance,
            open_positions,
            open_risk,
        }
    }

    fn bar(high: f64, low: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::H1,
            timestamp: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 1.0,
        }
    }

    fn long_at(entry: f64, rm: &RiskManager) -> Position {
        let levels = rm.stop_levels(Direction::Long, entry);
        Position {
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            size: 1.0,
            entry_price: entry,
            entry_timestamp: 0,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            entry_fee: 0.0,
            unrealized_pnl: 0.0,
        }
    }

    #[test]
    fn default_budget_is_valid() {
        assert!(RiskBudget::default().validate().is_ok());
    }

    #[test]
    fn budget_validation_rejects_bad_fields() {
        let cases = [
            RiskBudget {
                max_open_positions: 0,
                ..Default::default()
            },
            RiskBudget {
                max_risk_per_trade: 0.0,
                ..Default::default()
            },
            RiskBudget {
                max_portfolio_risk: 1.5,
                ..Default::default()
            },
            RiskBudget {
                stop_loss: 0.0,
                ..Default::default()
            },
            RiskBudget {
                take_profit: f64::NAN,
                ..Default::default()
            },
            RiskBudget {
                size_increment: -1.0,
                ..Default::default()
            },
        ];
        for budget in cases {
            assert!(
                matches!(budget.validate(), Err(BuildError::InvalidRiskBudget { .. })),
                "{budget:?} should be invalid"
            );
        }
    }

    #[test]
    fn size_from_risk_fraction() {
        let rm = manager(RiskBudget {
            max_risk_per_trade: 0.01,
            stop_loss: 0.05,
            ..Default::default()
        });
        // 0.01 * 10_000 / (100 * 0.05) = 20
        let size = rm.calculate_position_size(Direction::Long, 100.0, 10_000.0);
        assert!((size - 20.0).abs() < 1e-9);
    }

    #[test]
    fn size_capped_by_notional_fraction() {
        let rm = manager(RiskBudget {
            max_risk_per_trade: 0.05,
            stop_loss: 0.01,
            max_position_fraction: 0.5,
            ..Default::default()
        });
        // risk bound 0.05 * 10_000 / (100 * 0.01) = 500, cap 5_000 / 100 = 50
        let size = rm.calculate_position_size(Direction::Long, 100.0, 10_000.0);
        assert!((size - 50.0).abs() < 1e-9);
    }

    #[test]
    fn size_rounded_to_increment() {
        let rm = manager(RiskBudget {
            max_risk_per_trade: 0.01,
            stop_loss: 0.03,
            size_increment: 1.0,
            ..Default::default()
        });
        // 100 / 3 = 33.33 -> 33
        let size = rm.calculate_position_size(Direction::Long, 100.0, 10_000.0);
        assert_eq!(size, 33.0);
    }

    #[test]
    fn size_zero_without_balance() {
        let rm = manager(RiskBudget::default());
        assert_eq!(rm.calculate_position_size(Direction::Long, 100.0, 0.0), 0.0);
    }

    #[test]
    fn sized_trade_is_accepted() {
        let rm = manager(RiskBudget::default());
        let size = rm.calculate_position_size(Direction::Long, 100.0, 10_000.0);
        let decision = rm.validate_trade("BTCUSDT", Direction::Long, size, 100.0, &account(10_000.0, 0, 0.0));
        assert_eq!(decision, RiskDecision::Accept);
    }

    #[test]
    fn max_positions_checked_first() {
        let rm = manager(RiskBudget::default());
        // Oversized too, but the position count is reported.
        let decision = rm.validate_trade("ETHUSDT", Direction::Long, 1e9, 100.0, &account(10_000.0, 1, 0.0));
        assert_eq!(
            decision,
            RiskDecision::Reject(RejectReason::MaxOpenPositions { open: 1, max: 1 })
        );
    }

    #[test]
    fn per_trade_risk_rejected() {
        let rm = manager(RiskBudget::default());
        // risk = 200 * 100 * 0.02 = 400 > 0.02 * 10_000 = 200
        let decision = rm.validate_trade("BTCUSDT", Direction::Long, 200.0, 100.0, &account(10_000.0, 0, 0.0));
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::TradeRiskExceeded { .. })
        ));
    }

    #[test]
    fn portfolio_risk_rejected() {
        let rm = manager(RiskBudget {
            max_open_positions: 5,
            ..Default::default()
        });
        // open risk 550 + 100 > 0.06 * 10_000
        let decision = rm.validate_trade("BTCUSDT", Direction::Long, 50.0, 100.0, &account(10_000.0, 3, 550.0));
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::PortfolioRiskExceeded { .. })
        ));
    }

    #[test]
    fn zero_size_rejected() {
        let rm = manager(RiskBudget::default());
        let decision = rm.validate_trade("BTCUSDT", Direction::Long, 0.0, 100.0, &account(10_000.0, 0, 0.0));
        assert_eq!(decision, RiskDecision::Reject(RejectReason::ZeroSize));
    }

    #[test]
    fn unaffordable_trade_rejected() {
        let rm = RiskManager::new(
            RiskBudget {
                max_risk_per_trade: 1.0,
                max_portfolio_risk: 1.0,
                ..Default::default()
            },
            ExecutionConfig {
                commission_per_trade: 50.0,
                ..Default::default()
            },
        );
        let decision = rm.validate_trade("BTCUSDT", Direction::Long, 100.0, 100.0, &account(10_000.0, 0, 0.0));
        assert!(matches!(
            decision,
            RiskDecision::Reject(RejectReason::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn account_state_sums_open_risk() {
        let rm = manager(RiskBudget::default());
        let mut pm = PositionManager::new(10_000.0, ExecutionConfig::default());
        pm.open("BTCUSDT", Direction::Long, 10.0, 100.0, 0).unwrap();
        let state = rm.account_state(&pm);
        assert_eq!(state.open_positions, 1);
        assert!((state.balance - 9_000.0).abs() < 1e-9);
        assert!((state.equity - 10_000.0).abs() < 1e-9);
        assert!((state.open_risk - 20.0).abs() < 1e-9);
    }

    #[test]
    fn stop_levels_long_and_short() {
        let rm = manager(RiskBudget::default());
        let long = rm.stop_levels(Direction::Long, 100.0);
        assert!((long.stop_loss - 98.0).abs() < 1e-9);
        assert!((long.take_profit - 104.0).abs() < 1e-9);
        let short = rm.stop_levels(Direction::Short, 100.0);
        assert!((short.stop_loss - 102.0).abs() < 1e-9);
        assert!((short.take_profit - 96.0).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_fills_at_trigger_price() {
        let rm = manager(RiskBudget::default());
        let pos = long_at(100.0, &rm);
        let trigger = rm.check_stop_conditions(&pos, &bar(100.5, 97.0)).unwrap();
        assert!(matches!(trigger, StopTrigger::StopLoss(_)));
        assert!((trigger.price() - 98.0).abs() < 1e-9);
        assert_eq!(trigger.exit_reason(), ExitReason::StopLoss);
    }

    #[test]
    fn take_profit_triggers_on_high() {
        let rm = manager(RiskBudget::default());
        let pos = long_at(100.0, &rm);
        let trigger = rm.check_stop_conditions(&pos, &bar(105.0, 99.0)).unwrap();
        assert!((trigger.price() - 104.0).abs() < 1e-9);
        assert_eq!(trigger.exit_reason(), ExitReason::TakeProfit);
    }

    #[test]
    fn stop_loss_wins_when_both_inside_bar() {
        let rm = manager(RiskBudget::default());
        let pos = long_at(100.0, &rm);
        let trigger = rm.check_stop_conditions(&pos, &bar(110.0, 90.0)).unwrap();
        assert!(matches!(trigger, StopTrigger::StopLoss(_)));
    }

    #[test]
    fn short_stops_use_mirrored_extremes() {
        let rm = manager(RiskBudget::default());
        let levels = rm.stop_levels(Direction::Short, 100.0);
        let pos = Position {
            direction: Direction::Short,
            stop_loss: levels.stop_loss,
            take_profit: levels.take_profit,
            ..long_at(100.0, &rm)
        };
        let trigger = rm.check_stop_conditions(&pos, &bar(103.0, 99.0)).unwrap();
        assert!((trigger.price() - 102.0).abs() < 1e-9);
        let trigger = rm.check_stop_conditions(&pos, &bar(101.0, 95.0)).unwrap();
        assert_eq!(trigger.exit_reason(), ExitReason::TakeProfit);
    }

    #[test]
    fn quiet_bar_triggers_nothing() {
        let rm = manager(RiskBudget::default());
        let pos = long_at(100.0, &rm);
        assert!(rm.check_stop_conditions(&pos, &bar(101.0, 99.0)).is_none());
    }
}
