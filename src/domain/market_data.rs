//! Loaded bar series, visibility cursors and the unified timeline.
//!
//! Each `(symbol, timeframe)` pair is a `SeriesData` that only ever exposes
//! bars that have closed by the current instant. A `SymbolFeed` groups a
//! symbol's series with the last signal of every rule, so a rule is only
//! re-run when the history it reads has grown.

use std::collections::BTreeSet;

use super::combination::{CombinationPolicy, Vote};
use super::error::{ConfluenceError, RunCondition};
use super::ohlcv::Bar;
use super::signal::Signal;
use super::signals::SignalInput;
use super::strategy::SignalRule;
use super::timeframe::Timeframe;

#[derive(Debug, Clone)]
pub struct SeriesData {
    symbol: String,
    timeframe: Timeframe,
    bars: Vec<Bar>,
    visible: usize,
}

impl SeriesData {
    pub fn new(symbol: &str, timeframe: Timeframe) -> Self {
        SeriesData {
            symbol: symbol.to_string(),
            timeframe,
            bars: Vec::new(),
            visible: 0,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Append a freshly fetched batch for the range `[start, end]`.
    /// Bars before the first invalid one are kept.
    pub fn append(&mut self, bars: Vec<Bar>, start: i64, end: i64) -> Result<(), ConfluenceError> {
        for bar in bars {
            let invalid = |reason: String| ConfluenceError::InvalidBar {
                symbol: self.symbol.clone(),
                timeframe: self.timeframe,
                timestamp: bar.timestamp,
                reason,
            };
            if bar.symbol != self.symbol || bar.timeframe != self.timeframe {
                return Err(invalid(format!(
                    "belongs to {} {}",
                    bar.symbol, bar.timeframe
                )));
            }
            if bar.timestamp < start || bar.timestamp > end {
                return Err(invalid(format!("outside requested range {start}..={end}")));
            }
            if let Some(last) = self.bars.last() {
                if bar.timestamp <= last.timestamp {
                    return Err(invalid(format!(
                        "timestamp not after previous bar {}",
                        last.timestamp
                    )));
                }
            }
            bar.validate().map_err(invalid)?;
            self.bars.push(bar);
        }
        Ok(())
    }

    /// Reveal every bar whose close time is at or before `until`.
    /// Returns true when the visible history grew. Gaps longer than
    /// `max_gap_bars` missing bars are pushed to `conditions`.
    pub fn advance(
        &mut self,
        until: i64,
        max_gap_bars: usize,
        conditions: &mut Vec<RunCondition>,
    ) -> bool {
        let before = self.visible;
        let duration = self.timeframe.duration_ms();
        while let Some(bar) = self.bars.get(self.visible) {
            if bar.close_time() > until {
                break;
            }
            if self.visible > 0 {
                let prev = &self.bars[self.visible - 1];
                let missing = (bar.timestamp - prev.timestamp) / duration - 1;
                if missing > max_gap_bars as i64 {
                    conditions.push(RunCondition::DataGap {
                        symbol: self.symbol.clone(),
                        timeframe: self.timeframe,
                        from: prev.timestamp,
                        to: bar.timestamp,
                    });
                }
            }
            self.visible += 1;
        }
        self.visible > before
    }

    /// Closed bars as of the last `advance`.
    pub fn visible(&self) -> &[Bar] {
        &self.bars[..self.visible]
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.visible().last()
    }
}

/// Ascending, de-duplicated timestamps of every bar in `series`.
pub fn build_unified_timeline<'a>(series: impl IntoIterator<Item = &'a [Bar]>) -> Vec<i64> {
    let unique: BTreeSet<i64> = series
        .into_iter()
        .flat_map(|bars| bars.iter().map(|bar| bar.timestamp))
        .collect();
    unique.into_iter().collect()
}

#[derive(Debug, Clone, Copy)]
struct RuleState {
    seen: usize,
    signal: Signal,
}

/// What one symbol contributes at one timestamp.
#[derive(Debug, Clone)]
pub struct SymbolTick {
    /// The driving bar opening at this timestamp, if the symbol has one.
    pub bar: Option<Bar>,
    pub decision: Signal,
    pub conditions: Vec<RunCondition>,
}

#[derive(Debug, Clone)]
pub struct SymbolFeed {
    symbol: String,
    /// Finest first; index 0 drives the symbol's ticks.
    series: Vec<SeriesData>,
    rule_states: Vec<RuleState>,
}

impl SymbolFeed {
    /// `timeframes` must be non-empty; they are sorted finest first.
    pub fn new(symbol: &str, timeframes: &[Timeframe], rule_count: usize) -> Self {
        let mut timeframes = timeframes.to_vec();
        timeframes.sort();
        timeframes.dedup();
        SymbolFeed {
            symbol: symbol.to_string(),
            series: timeframes
                .into_iter()
                .map(|tf| SeriesData::new(symbol, tf))
                .collect(),
            rule_states: vec![
                RuleState {
                    seen: 0,
                    signal: Signal::Hold,
                };
                rule_count
            ],
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn driving(&self) -> Option<Timeframe> {
        self.series.first().map(SeriesData::timeframe)
    }

    pub fn series(&self, timeframe: Timeframe) -> Option<&SeriesData> {
        self.series.iter().find(|s| s.timeframe == timeframe)
    }

    pub fn series_mut(&mut self, timeframe: Timeframe) -> Option<&mut SeriesData> {
        self.series.iter_mut().find(|s| s.timeframe == timeframe)
    }

    /// Advance every series to instant `t` and, if the driving timeframe has
    /// a bar opening at `t`, re-run the rules whose history grew and combine.
    pub fn tick(
        &mut self,
        t: i64,
        rules: &[SignalRule],
        policy: CombinationPolicy,
        max_gap_bars: usize,
    ) -> SymbolTick {
        let mut conditions = Vec::new();
        let Some(driving) = self.driving() else {
            return SymbolTick {
                bar: None,
                decision: Signal::Hold,
                conditions,
            };
        };

        let until = t + driving.duration_ms();
        for series in &mut self.series {
            series.advance(until, max_gap_bars, &mut conditions);
        }

        let bar = self.series[0]
            .latest()
            .filter(|b| b.timestamp == t)
            .cloned();
        if bar.is_none() {
            return SymbolTick {
                bar,
                decision: Signal::Hold,
                conditions,
            };
        }

        let Self {
            symbol,
            series,
            rule_states,
        } = self;
        for (rule, state) in rules.iter().zip(rule_states.iter_mut()) {
            let timeframe = rule.timeframe.unwrap_or(driving);
            let Some(data) = series.iter().find(|s| s.timeframe == timeframe) else {
                continue;
            };
            let visible = data.visible();
            if visible.len() != state.seen {
                state.seen = visible.len();
                let input = SignalInput {
                    symbol: symbol.as_str(),
                    timeframe,
                    bars: visible,
                };
                state.signal = rule.function.compute(&input, &rule.params);
            }
        }

        let votes: Vec<Vote<'_>> = rules
            .iter()
            .zip(rule_states.iter())
            .map(|(rule, state)| Vote {
                rule: &rule.name,
                signal: state.signal,
                weight: rule.weight.unwrap_or(0.0),
            })
            .collect();

        SymbolTick {
            bar,
            decision: policy.combine(&votes),
            conditions,
        }
    }
}
