//! Trade and equity history, and the statistics derived from them.
//!
//! Percent-valued metrics (`total_return`, `win_rate`, `max_drawdown`) are
//! expressed in percent, e.g. 12.5 means 12.5%. Trade outcomes use net P&L.

use std::collections::BTreeMap;

use super::error::ConfluenceError;
use super::position::Trade;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolPerformance {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub profit_factor: f64,
    /// Milliseconds.
    pub avg_trade_duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub final_equity: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    /// Longest run of consecutive equity points below the running peak.
    pub max_drawdown_duration: usize,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub breakeven_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Milliseconds.
    pub avg_trade_duration: f64,
    pub per_symbol: BTreeMap<String, SymbolPerformance>,
}

#[derive(Debug, Clone)]
pub struct PerformanceTracker {
    initial_balance: f64,
    periods_per_year: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
}

impl PerformanceTracker {
    pub fn new(initial_balance: f64, periods_per_year: f64) -> Self {
        PerformanceTracker {
            initial_balance,
            periods_per_year,
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    pub fn record_trade(&mut self, trade: Trade) {
        self.trades.push(trade);
    }

    /// Append an equity point; timestamps must strictly increase.
    pub fn update_equity(
        &mut self,
        timestamp: i64,
        balance: f64,
        positions_value: f64,
    ) -> Result<EquityPoint, ConfluenceError> {
        if let Some(last) = self.equity_curve.last() {
            if timestamp <= last.timestamp {
                return Err(ConfluenceError::EquityOutOfOrder {
                    timestamp,
                    previous: last.timestamp,
                });
            }
        }
        let point = EquityPoint {
            timestamp,
            equity: balance + positions_value,
            balance,
        };
        self.equity_curve.push(point);
        Ok(point)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn into_parts(self) -> (Vec<Trade>, Vec<EquityPoint>) {
        (self.trades, self.equity_curve)
    }

    pub fn calculate_metrics(&self) -> PerformanceMetrics {
        let final_equity = self
            .equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(self.initial_balance);

        let total_return = if self.initial_balance > 0.0 {
            (final_equity / self.initial_balance - 1.0) * 100.0
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration) = compute_drawdown(&self.equity_curve);
        let (sharpe_ratio, sortino_ratio) =
            compute_risk_adjusted(&self.equity_curve, self.periods_per_year);

        let stats = TradeStats::collect(self.trades.iter());

        let mut by_symbol: BTreeMap<&str, Vec<&Trade>> = BTreeMap::new();
        for trade in &self.trades {
            by_symbol.entry(trade.symbol.as_str()).or_default().push(trade);
        }
        let per_symbol = by_symbol
            .into_iter()
            .map(|(symbol, trades)| {
                let s = TradeStats::collect(trades.into_iter());
                let perf = SymbolPerformance {
                    total_trades: s.total(),
                    winning_trades: s.won,
                    win_rate: s.win_rate(),
                    total_pnl: s.total_wins - s.total_losses,
                    profit_factor: s.profit_factor(),
                    avg_trade_duration: s.avg_duration(),
                };
                (symbol.to_string(), perf)
            })
            .collect();

        PerformanceMetrics {
            total_return,
            final_equity,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            max_drawdown_duration,
            total_trades: stats.total(),
            winning_trades: stats.won,
            losing_trades: stats.lost,
            breakeven_trades: stats.breakeven,
            win_rate: stats.win_rate(),
            profit_factor: stats.profit_factor(),
            avg_win: if stats.won > 0 {
                stats.total_wins / stats.won as f64
            } else {
                0.0
            },
            avg_loss: if stats.lost > 0 {
                stats.total_losses / stats.lost as f64
            } else {
                0.0
            },
            largest_win: stats.largest_win,
            largest_loss: stats.largest_loss,
            avg_trade_duration: stats.avg_duration(),
            per_symbol,
        }
    }
}

#[derive(Default)]
struct TradeStats {
    won: usize,
    lost: usize,
    breakeven: usize,
    total_wins: f64,
    /// Absolute value.
    total_losses: f64,
    largest_win: f64,
    largest_loss: f64,
    total_duration: i64,
}

impl TradeStats {
    fn collect<'a>(trades: impl Iterator<Item = &'a Trade>) -> Self {
        let mut s = TradeStats::default();
        for trade in trades {
            let pnl = trade.net_pnl();
            if pnl > 0.0 {
                s.won += 1;
                s.total_wins += pnl;
                s.largest_win = s.largest_win.max(pnl);
            } else if pnl < 0.0 {
                s.lost += 1;
                s.total_losses += pnl.abs();
                s.largest_loss = s.largest_loss.max(pnl.abs());
            } else {
                s.breakeven += 1;
            }
            s.total_duration += trade.duration_ms();
        }
        s
    }

    fn total(&self) -> usize {
        self.won + self.lost + self.breakeven
    }

    fn win_rate(&self) -> f64 {
        if self.total() > 0 {
            self.won as f64 / self.total() as f64 * 100.0
        } else {
            0.0
        }
    }

    fn profit_factor(&self) -> f64 {
        if self.total_losses > 0.0 {
            self.total_wins / self.total_losses
        } else if self.total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    }

    fn avg_duration(&self) -> f64 {
        if self.total() > 0 {
            self.total_duration as f64 / self.total() as f64
        } else {
            0.0
        }
    }
}

fn compute_drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    let Some(first) = equity_curve.first() else {
        return (0.0, 0);
    };

    let mut peak = first.equity;
    let mut max_dd = 0.0_f64;
    let mut current_duration = 0usize;
    let mut max_duration = 0usize;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_duration = 0;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak * 100.0);
            current_duration += 1;
            max_duration = max_duration.max(current_duration);
        }
    }

    (max_dd, max_duration)
}

fn population_stddev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

fn compute_risk_adjusted(equity_curve: &[EquityPoint], periods_per_year: f64) -> (f64, f64) {
    if equity_curve.len() < 2 {
        return (0.0, 0.0);
    }

    let returns: Vec<f64> = equity_curve
        .windows(2)
        .map(|w| {
            let prev = w[0].equity;
            if prev > 0.0 {
                (w[1].equity - prev) / prev
            } else {
                0.0
            }
        })
        .collect();

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let annualizer = periods_per_year.max(0.0).sqrt();

    let stddev = population_stddev(&returns);
    let sharpe = if stddev > 0.0 {
        mean / stddev * annualizer
    } else {
        0.0
    };

    // Semi-deviation below zero over every period.
    let downside = (returns
        .iter()
        .map(|r| r.min(0.0).powi(2))
        .sum::<f64>()
        / returns.len() as f64)
        .sqrt();
    let sortino = if downside > 0.0 {
        mean / downside * annualizer
    } else {
        0.0
    };

    (sharpe, sortino)
}
