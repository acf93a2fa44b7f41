#![allow(dead_code)]

use confluence::domain::backtest::{BacktestConfig, Backtester};
use confluence::domain::error::ConfluenceError;
pub use confluence::domain::ohlcv::Bar;
use confluence::domain::params::ParamBag;
use confluence::domain::signal::Signal;
use confluence::domain::signals::{ComputeFn, SignalFunction, SignalInput};
use confluence::domain::strategy::{RuleDef, Strategy, StrategyBuilder};
pub use confluence::domain::timeframe::Timeframe;
use confluence::ports::data_port::DataProvider;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

pub const HOUR: i64 = 3_600_000;

pub struct MockDataProvider {
    pub series: HashMap<(String, Timeframe), Vec<Bar>>,
    /// Fetches whose window starts after this instant fail.
    pub fail_after: Option<i64>,
    pub calls: AtomicUsize,
}

impl MockDataProvider {
    pub fn new() -> Self {
        Self {
            series: HashMap::new(),
            fail_after: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_bars(mut self, bars: Vec<Bar>) -> Self {
        if let Some(first) = bars.first() {
            self.series
                .entry((first.symbol.clone(), first.timeframe))
                .or_default()
                .extend(bars);
        }
        self
    }

    pub fn failing_after(mut self, instant: i64) -> Self {
        self.fail_after = Some(instant);
        self
    }
}

impl DataProvider for MockDataProvider {
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>, ConfluenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if start_ms > limit {
                return Err(ConfluenceError::DataProvider {
                    reason: format!("connection lost fetching {symbol} {timeframe}"),
                });
            }
        }
        Ok(self
            .series
            .get(&(symbol.to_string(), timeframe))
            .map(|bars| {
                bars.iter()
                    .filter(|b| b.timestamp >= start_ms && b.timestamp <= end_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_symbols(&self) -> Result<Vec<String>, ConfluenceError> {
        let mut symbols: Vec<String> = self.series.keys().map(|(s, _)| s.clone()).collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }
}

/// Provider whose first fetch signals `entered` and then waits for `release`.
pub struct BlockingProvider {
    pub entered: Mutex<Sender<()>>,
    pub release: Mutex<Receiver<()>>,
}

impl DataProvider for BlockingProvider {
    fn fetch_bars(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<Bar>, ConfluenceError> {
        let _ = self.entered.lock().unwrap().send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(Vec::new())
    }

    fn list_symbols(&self) -> Result<Vec<String>, ConfluenceError> {
        Ok(Vec::new())
    }
}

pub fn make_bar(symbol: &str, timeframe: Timeframe, timestamp: i64, close: f64) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timeframe,
        timestamp,
        open: close,
        high: close,
        low: close,
        close,
        volume: 1_000.0,
    }
}

pub fn make_candle(symbol: &str, timestamp: i64, close: f64, low: f64, high: f64) -> Bar {
    Bar {
        low,
        high,
        ..make_bar(symbol, Timeframe::H1, timestamp, close)
    }
}

/// Consecutive bars of `timeframe` starting at 0, one per close.
pub fn make_series(symbol: &str, timeframe: Timeframe, closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| make_bar(symbol, timeframe, i as i64 * timeframe.duration_ms(), c))
        .collect()
}

pub fn hourly(symbol: &str, closes: &[f64]) -> Vec<Bar> {
    make_series(symbol, Timeframe::H1, closes)
}

/// Oscillating closes that produce plenty of crossovers.
pub fn wave(len: usize, offset: usize) -> Vec<f64> {
    (0..len)
        .map(|i| 100.0 + (((i + offset) * 7) % 13) as f64 - 6.0)
        .collect()
}

pub fn custom(name: &'static str, compute: ComputeFn) -> SignalFunction {
    SignalFunction {
        name,
        description: "test signal",
        schema: &[],
        compute,
        check: None,
    }
}

pub fn always_buy(_: &SignalInput<'_>, _: &ParamBag) -> Signal {
    Signal::Buy
}

pub fn single_rule_strategy(symbols: &[&str], rule: RuleDef) -> Strategy {
    StrategyBuilder::new("test")
        .symbols(symbols.iter().copied())
        .timeframe(Timeframe::H1)
        .rule(rule)
        .build()
        .unwrap()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn backtester(
    strategy: Strategy,
    provider: impl DataProvider + Send + Sync + 'static,
    config: BacktestConfig,
) -> Backtester {
    init_logging();
    Backtester::new(strategy, config, Arc::new(provider))
}
