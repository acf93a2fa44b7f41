//! Backtest engine and event loop.
//!
//! `Backtester` owns an immutable strategy, its run configuration and a data
//! provider. A run walks the ascending union of bar timestamps; at each one
//! the per-symbol feeds compute decisions (in parallel when configured) and
//! all trading state is then updated under a single lock in stages: stop
//! checks for every symbol, then signal exits and entries in the strategy's
//! declared order, then marking to market and the equity point.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;

use super::error::{BuildError, ConfluenceError, RejectReason, RunCondition};
use super::execution::{entry_fill_price, ExecutionConfig};
use super::market_data::{build_unified_timeline, SymbolFeed, SymbolTick};
use super::ohlcv::{format_timestamp, Bar};
use super::performance::{EquityPoint, PerformanceMetrics, PerformanceTracker, SymbolPerformance};
use super::position::{Direction, ExitReason, Position, Trade};
use super::position_manager::{PositionError, PositionManager};
use super::risk::{RiskDecision, RiskManager};
use super::signal::Signal;
use super::strategy::Strategy;
use super::timeframe::Timeframe;
use crate::ports::data_port::DataProvider;

/// Missing driving bars tolerated before a `DataGap` is recorded.
pub const DEFAULT_MAX_GAP_BARS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    #[default]
    Sequential,
    Parallel,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingMode::Sequential => write!(f, "sequential"),
            ProcessingMode::Parallel => write!(f, "parallel"),
        }
    }
}

impl FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ProcessingMode::Sequential),
            "parallel" => Ok(ProcessingMode::Parallel),
            other => Err(format!(
                "unknown processing mode '{other}' (expected sequential or parallel)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub initial_balance: f64,
    pub execution: ExecutionConfig,
    pub mode: ProcessingMode,
    /// Worker threads in parallel mode; 0 lets rayon decide.
    pub workers: usize,
    pub max_gap_bars: usize,
    /// Load data in windows of this many milliseconds instead of all at once.
    pub chunk_ms: Option<i64>,
    /// Overrides the annualization derived from the driving timeframe.
    pub periods_per_year: Option<f64>,
    pub time_budget: Option<Duration>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_balance: 10_000.0,
            execution: ExecutionConfig::default(),
            mode: ProcessingMode::Sequential,
            workers: 0,
            max_gap_bars: DEFAULT_MAX_GAP_BARS,
            chunk_ms: None,
            periods_per_year: None,
            time_budget: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: PerformanceMetrics,
    /// Recoverable and fatal conditions met after the clock started.
    pub errors: Vec<RunCondition>,
    /// Positions still open when an aborted run stopped.
    pub open_positions: Vec<Position>,
    /// False when the run stopped early on a fatal condition.
    pub completed: bool,
}

impl BacktestResult {
    pub fn per_symbol(&self) -> &BTreeMap<String, SymbolPerformance> {
        &self.metrics.per_symbol
    }

    pub fn risk_rejections(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| matches!(e, RunCondition::RiskRejection { .. }))
            .count()
    }

    pub fn data_gaps(&self) -> usize {
        self.errors
            .iter()
            .filter(|e| matches!(e, RunCondition::DataGap { .. }))
            .count()
    }

    pub fn fatal_error(&self) -> Option<&RunCondition> {
        self.errors.iter().find(|e| e.is_fatal())
    }
}

pub struct Backtester {
    strategy: Strategy,
    config: BacktestConfig,
    provider: Arc<dyn DataProvider + Send + Sync>,
    run_lock: Mutex<()>,
}

impl Backtester {
    pub fn new(
        strategy: Strategy,
        config: BacktestConfig,
        provider: Arc<dyn DataProvider + Send + Sync>,
    ) -> Self {
        Backtester {
            strategy,
            config,
            provider,
            run_lock: Mutex::new(()),
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run the strategy over `symbols` × `timeframes` for bars opening in
    /// `[start, end]`.
    ///
    /// An `Err` is only returned before the clock starts. Everything that
    /// goes wrong afterwards is recorded in [`BacktestResult::errors`].
    pub fn run_backtest<S: AsRef<str>>(
        &self,
        symbols: &[S],
        timeframes: &[Timeframe],
        start: i64,
        end: i64,
    ) -> Result<BacktestResult, ConfluenceError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ConfluenceError::RunInProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let (symbols, timeframes) = self.resolve_request(symbols, timeframes, start, end)?;
        let pool = match self.config.mode {
            ProcessingMode::Parallel => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(self.config.workers)
                    .build()
                    .map_err(|e| ConfluenceError::WorkerPool {
                        reason: e.to_string(),
                    })?,
            ),
            ProcessingMode::Sequential => None,
        };

        let driving = timeframes[0];
        let periods_per_year = self
            .config
            .periods_per_year
            .unwrap_or_else(|| driving.periods_per_year());

        info!(
            "backtest '{}': {} symbol(s) [{}], timeframes [{}], {} .. {} ({} mode)",
            self.strategy.name(),
            symbols.len(),
            symbols.join(", "),
            timeframes
                .iter()
                .map(|tf| tf.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            format_timestamp(start),
            format_timestamp(end),
            self.config.mode,
        );

        let rule_count = self.strategy.rules().len();
        let mut feeds: Vec<SymbolFeed> = symbols
            .iter()
            .map(|s| SymbolFeed::new(s, &timeframes, rule_count))
            .collect();

        let state = Mutex::new(TradingState {
            positions: PositionManager::new(self.config.initial_balance, self.config.execution),
            risk: RiskManager::new(self.strategy.risk_budget().clone(), self.config.execution),
            performance: PerformanceTracker::new(self.config.initial_balance, periods_per_year),
            errors: Vec::new(),
            last_close: BTreeMap::new(),
            allow_shorting: self.config.execution.allow_shorting,
        });

        let started = Instant::now();
        let mut windows = Windows::new(start, end, self.config.chunk_ms);
        let mut fatal: Option<String> = None;
        let mut budget_exceeded = false;
        let mut last_processed: Option<i64> = None;
        let mut processed = 0usize;

        let mut current = self.load_next(&mut windows, &mut feeds, &timeframes, pool.as_ref());

        'run: while let Some(window) = current.take() {
            // The next window decides whether this one holds the final timestamp.
            let next = match window.fault {
                Some(_) => None,
                None => self.load_next(&mut windows, &mut feeds, &timeframes, pool.as_ref()),
            };
            let last_window = window.fault.is_none() && next.is_none();

            for (i, &t) in window.timeline.iter().enumerate() {
                if let Some(budget) = self.config.time_budget {
                    if started.elapsed() >= budget {
                        warn!("time budget of {budget:?} exceeded at {}", format_timestamp(t));
                        lock(&state)
                            .errors
                            .push(RunCondition::TimeBudgetExceeded { timestamp: t });
                        budget_exceeded = true;
                        break 'run;
                    }
                }

                let is_final = last_window && i + 1 == window.timeline.len();
                if let Err(e) = self.step(t, is_final, &mut feeds, &state, pool.as_ref()) {
                    fatal = Some(e.to_string());
                    break 'run;
                }
                last_processed = Some(t);
                processed += 1;
            }

            if let Some(e) = window.fault {
                fatal = Some(e.to_string());
                break;
            }
            current = next;
        }

        let mut state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        if let Some(reason) = fatal.take() {
            warn!("backtest aborted after {processed} timestamp(s): {reason}");
            state.errors.push(RunCondition::FatalIo {
                last_processed,
                reason,
            });
        }
        let completed = !state.errors.iter().any(RunCondition::is_fatal) && !budget_exceeded;

        let metrics = state.performance.calculate_metrics();
        let open_positions: Vec<Position> = state.positions.positions().cloned().collect();
        let (trades, equity_curve) = state.performance.into_parts();

        info!(
            "backtest '{}' {}: {} timestamp(s), {} trade(s), final equity {:.2} ({:+.2}%)",
            self.strategy.name(),
            if completed { "finished" } else { "stopped early" },
            processed,
            trades.len(),
            metrics.final_equity,
            metrics.total_return,
        );

        Ok(BacktestResult {
            trades,
            equity_curve,
            metrics,
            errors: state.errors,
            open_positions,
            completed,
        })
    }

    /// Check the request against the strategy. Returns the symbols in
    /// declared order and the timeframes finest first.
    fn resolve_request<S: AsRef<str>>(
        &self,
        symbols: &[S],
        timeframes: &[Timeframe],
        start: i64,
        end: i64,
    ) -> Result<(Vec<String>, Vec<Timeframe>), BuildError> {
        if symbols.is_empty() {
            return Err(BuildError::NoSymbols);
        }
        if timeframes.is_empty() {
            return Err(BuildError::NoTimeframes);
        }
        if start > end {
            return Err(BuildError::InvalidRange { start, end });
        }

        for symbol in symbols {
            let symbol = symbol.as_ref();
            if !self.strategy.symbols().iter().any(|s| s == symbol) {
                return Err(BuildError::UnknownSymbol(symbol.to_string()));
            }
        }
        for tf in timeframes {
            if !self.strategy.timeframes().contains(tf) {
                return Err(BuildError::UnregisteredTimeframe(*tf));
            }
        }

        let mut requested = timeframes.to_vec();
        requested.sort();
        requested.dedup();

        for rule in self.strategy.rules() {
            if let Some(tf) = rule.timeframe {
                if !requested.contains(&tf) {
                    return Err(BuildError::UnknownTimeframe {
                        rule: rule.name.clone(),
                        timeframe: tf,
                    });
                }
            }
        }

        let ordered = self
            .strategy
            .symbols()
            .iter()
            .filter(|s| symbols.iter().any(|r| r.as_ref() == s.as_str()))
            .cloned()
            .collect();
        Ok((ordered, requested))
    }

    /// Load windows until one holds a timestamp or a fault.
    fn load_next(
        &self,
        windows: &mut Windows,
        feeds: &mut [SymbolFeed],
        timeframes: &[Timeframe],
        pool: Option<&ThreadPool>,
    ) -> Option<Window> {
        for (from, to) in windows.by_ref() {
            let window = self.load_window(from, to, feeds, timeframes, pool);
            if window.fault.is_some() || !window.timeline.is_empty() {
                return Some(window);
            }
        }
        None
    }

    /// Fetch every (symbol, timeframe) pair for `[from, to]` and append the
    /// bars to the feeds.
    ///
    /// A provider error leaves the window empty. An invalid bar keeps the
    /// valid bars before it and cuts the timeline at the bar's timestamp.
    fn load_window(
        &self,
        from: i64,
        to: i64,
        feeds: &mut [SymbolFeed],
        timeframes: &[Timeframe],
        pool: Option<&ThreadPool>,
    ) -> Window {
        let symbols: Vec<String> = feeds.iter().map(|f| f.symbol().to_string()).collect();
        let pairs: Vec<(usize, Timeframe)> = (0..symbols.len())
            .flat_map(|i| timeframes.iter().map(move |&tf| (i, tf)))
            .collect();

        let provider = &self.provider;
        let fetch = |&(i, tf): &(usize, Timeframe)| provider.fetch_bars(&symbols[i], tf, from, to);
        let fetched: Vec<Result<Vec<Bar>, ConfluenceError>> = match pool {
            Some(pool) => pool.install(|| pairs.par_iter().map(fetch).collect()),
            None => pairs.iter().map(fetch).collect(),
        };

        let mut batches = Vec::with_capacity(pairs.len());
        for (&(i, tf), result) in pairs.iter().zip(fetched) {
            match result {
                Ok(bars) => batches.push((i, tf, bars)),
                Err(e) => return Window::failed(e),
            }
        }

        let mut timeline =
            build_unified_timeline(batches.iter().map(|(_, _, bars)| bars.as_slice()));
        let mut fault: Option<(i64, ConfluenceError)> = None;
        for (i, tf, bars) in batches {
            let Some(series) = feeds[i].series_mut(tf) else {
                continue;
            };
            if let Err(e) = series.append(bars, from, to) {
                let at = match &e {
                    ConfluenceError::InvalidBar { timestamp, .. } => *timestamp,
                    _ => from,
                };
                if fault.as_ref().map_or(true, |(cut, _)| at < *cut) {
                    fault = Some((at, e));
                }
            }
        }
        if let Some((cut, e)) = &fault {
            warn!("{e}; stopping before {}", format_timestamp(*cut));
            timeline.retain(|&t| t < *cut);
        }

        debug!(
            "loaded window {} .. {}: {} timestamp(s)",
            format_timestamp(from),
            format_timestamp(to),
            timeline.len()
        );
        Window {
            timeline,
            fault: fault.map(|(_, e)| e),
        }
    }

    fn step(
        &self,
        t: i64,
        is_final: bool,
        feeds: &mut [SymbolFeed],
        state: &Mutex<TradingState>,
        pool: Option<&ThreadPool>,
    ) -> Result<(), ConfluenceError> {
        let rules = self.strategy.rules();
        let policy = self.strategy.policy();
        let max_gap_bars = self.config.max_gap_bars;

        let mut ticks: Vec<SymbolTick> = match pool {
            Some(pool) => pool.install(|| {
                feeds
                    .par_iter_mut()
                    .map(|feed| feed.tick(t, rules, policy, max_gap_bars))
                    .collect()
            }),
            None => feeds
                .iter_mut()
                .map(|feed| feed.tick(t, rules, policy, max_gap_bars))
                .collect(),
        };

        let mut state = lock(state);
        let mut stopped = Vec::with_capacity(feeds.len());
        for (feed, tick) in feeds.iter().zip(ticks.iter_mut()) {
            stopped.push(state.settle(feed.symbol(), t, tick));
        }
        for ((feed, tick), exited) in feeds.iter().zip(&ticks).zip(stopped) {
            if let Some(bar) = &tick.bar {
                state.act(feed.symbol(), t, tick.decision, bar, exited || is_final);
            }
        }
        if is_final {
            for feed in feeds.iter() {
                state.liquidate(feed.symbol(), t);
            }
        }
        for (feed, tick) in feeds.iter().zip(&ticks) {
            if let Some(bar) = &tick.bar {
                state.mark(feed.symbol(), bar.close);
            }
        }
        let balance = state.positions.balance();
        let positions_value = state.positions.positions_value();
        state.performance.update_equity(t, balance, positions_value)?;
        Ok(())
    }
}

fn lock(state: &Mutex<TradingState>) -> std::sync::MutexGuard<'_, TradingState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a run mutates.
struct TradingState {
    positions: PositionManager,
    risk: RiskManager,
    performance: PerformanceTracker,
    errors: Vec<RunCondition>,
    last_close: BTreeMap<String, f64>,
    allow_shorting: bool,
}

impl TradingState {
    /// Record the tick's conditions and run the stop checks for `symbol`.
    /// Returns true when a stop or take-profit closed the position.
    fn settle(&mut self, symbol: &str, t: i64, tick: &mut SymbolTick) -> bool {
        for condition in tick.conditions.drain(..) {
            if let RunCondition::DataGap { .. } = &condition {
                warn!("{condition}");
            }
            self.errors.push(condition);
        }

        let Some(bar) = &tick.bar else {
            return false;
        };
        self.last_close.insert(symbol.to_string(), bar.close);

        let trigger = self
            .positions
            .get_position(symbol)
            .and_then(|position| self.risk.check_stop_conditions(position, bar));
        match trigger {
            Some(trigger) => {
                self.close(symbol, trigger.price(), t, trigger.exit_reason());
                true
            }
            None => false,
        }
    }

    /// Act on the combined decision: close on an opposite signal, otherwise
    /// try to enter unless `no_entry`.
    fn act(&mut self, symbol: &str, t: i64, decision: Signal, bar: &Bar, no_entry: bool) {
        let Some(direction) = decision.direction() else {
            return;
        };
        match self.positions.get_position(symbol).map(|p| p.direction) {
            Some(open) if open != direction => {
                self.close(symbol, bar.close, t, ExitReason::Signal);
            }
            Some(_) => {}
            None if no_entry => {}
            None if direction == Direction::Short && !self.allow_shorting => {}
            None => self.enter(symbol, direction, bar, t),
        }
    }

    fn mark(&mut self, symbol: &str, close: f64) {
        if self.positions.has_position(symbol) {
            if let Err(e) = self.positions.mark_to_market(symbol, close) {
                debug!("{symbol}: mark to market failed: {e}");
            }
        }
    }

    fn enter(&mut self, symbol: &str, direction: Direction, bar: &Bar, t: i64) {
        let price = bar.close;
        let size = self
            .risk
            .calculate_position_size(direction, price, self.positions.balance());
        let account = self.risk.account_state(&self.positions);

        if let RiskDecision::Reject(reason) =
            self.risk
                .validate_trade(symbol, direction, size, price, &account)
        {
            self.reject(symbol, t, direction, reason);
            return;
        }

        let fill = entry_fill_price(direction, price, self.positions.execution());
        let stops = self.risk.stop_levels(direction, fill);
        let opened = self
            .positions
            .open_with_stops(symbol, direction, size, price, t, stops)
            .map(|position| position.entry_price);
        match opened {
            Ok(entry_price) => debug!(
                "{} opened {direction} {symbol} size {size:.6} @ {entry_price:.4} (stop {:.4}, take {:.4})",
                format_timestamp(t),
                stops.stop_loss,
                stops.take_profit
            ),
            Err(PositionError::InsufficientBalance { cost, balance, .. }) => {
                self.reject(
                    symbol,
                    t,
                    direction,
                    RejectReason::InsufficientBalance { cost, balance },
                );
            }
            Err(PositionError::InvalidSize { .. }) => {
                self.reject(symbol, t, direction, RejectReason::ZeroSize);
            }
            Err(e) => debug!("{symbol}: open refused: {e}"),
        }
    }

    fn reject(&mut self, symbol: &str, t: i64, direction: Direction, reason: RejectReason) {
        debug!("{} rejected {direction} {symbol}: {reason}", format_timestamp(t));
        self.errors.push(RunCondition::RiskRejection {
            symbol: symbol.to_string(),
            timestamp: t,
            direction,
            reason,
        });
    }

    fn close(&mut self, symbol: &str, price: f64, t: i64, reason: ExitReason) {
        match self.positions.close_with_reason(symbol, price, t, reason) {
            Ok(trade) => {
                debug!(
                    "{} closed {} {} @ {:.4} ({}), net {:.4}",
                    format_timestamp(t),
                    trade.direction,
                    symbol,
                    trade.exit_price,
                    reason,
                    trade.net_pnl()
                );
                self.performance.record_trade(trade);
            }
            Err(e) => {
                debug!("{symbol}: close failed: {e}");
                self.errors.push(RunCondition::PositionNotFound {
                    symbol: symbol.to_string(),
                    timestamp: t,
                });
            }
        }
    }

    /// Close any open position on `symbol` at its last seen close.
    fn liquidate(&mut self, symbol: &str, t: i64) {
        let Some(position) = self.positions.get_position(symbol) else {
            return;
        };
        let price = self
            .last_close
            .get(symbol)
            .copied()
            .unwrap_or(position.entry_price);
        self.close(symbol, price, t, ExitReason::EndOfRun);
    }
}

/// A loaded window's timestamps, and the error that ends the run once they
/// have been processed.
struct Window {
    timeline: Vec<i64>,
    fault: Option<ConfluenceError>,
}

impl Window {
    fn failed(e: ConfluenceError) -> Self {
        Window {
            timeline: Vec::new(),
            fault: Some(e),
        }
    }
}

/// Inclusive load windows covering `[start, end]`.
#[derive(Debug, Clone)]
struct Windows {
    next: Option<i64>,
    end: i64,
    chunk_ms: Option<i64>,
}

impl Windows {
    fn new(start: i64, end: i64, chunk_ms: Option<i64>) -> Self {
        Windows {
            next: (start <= end).then_some(start),
            end,
            chunk_ms: chunk_ms.filter(|c| *c > 0),
        }
    }
}

impl Iterator for Windows {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.next?;
        let to = match self.chunk_ms {
            Some(chunk) => from.saturating_add(chunk - 1).min(self.end),
            None => self.end,
        };
        self.next = (to < self.end).then(|| to + 1);
        Some((from, to))
    }
}
