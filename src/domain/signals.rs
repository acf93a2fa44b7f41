//! Built-in signal functions and the registry that resolves them by name.
//!
//! A signal function is a pure `fn(&SignalInput, &ParamBag) -> Signal` over
//! the closed-bar history visible at one instant. The last bar in
//! `SignalInput::bars` is the most recent closed bar; nothing after it is
//! ever passed in.

use std::collections::BTreeMap;
use std::fmt;

use super::indicator::channel::calculate_channel;
use super::indicator::ema::calculate_ema;
use super::indicator::roc::calculate_roc;
use super::indicator::rsi::calculate_rsi;
use super::indicator::sma::calculate_sma;
use super::indicator::{IndicatorSeries, IndicatorValue};
use super::ohlcv::Bar;
use super::params::{ParamBag, ParamKind, ParamSpec};
use super::signal::Signal;
use super::timeframe::Timeframe;

/// Visible history handed to a signal function.
#[derive(Debug, Clone, Copy)]
pub struct SignalInput<'a> {
    pub symbol: &'a str,
    pub timeframe: Timeframe,
    pub bars: &'a [Bar],
}

pub type ComputeFn = fn(&SignalInput<'_>, &ParamBag) -> Signal;
/// Cross-parameter check run after schema validation; `Err((param, reason))`.
pub type CheckFn = fn(&ParamBag) -> Result<(), (&'static str, String)>;

#[derive(Clone, Copy)]
pub struct SignalFunction {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: &'static [ParamSpec],
    pub compute: ComputeFn,
    pub check: Option<CheckFn>,
}

impl SignalFunction {
    pub fn compute(&self, input: &SignalInput<'_>, params: &ParamBag) -> Signal {
        (self.compute)(input, params)
    }
}

impl fmt::Debug for SignalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Name → function lookup used when building strategies from configuration.
#[derive(Debug, Clone, Default)]
pub struct SignalRegistry {
    functions: BTreeMap<&'static str, SignalFunction>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for function in [MA_CROSSOVER, RSI_THRESHOLD, ROC_MOMENTUM, CHANNEL_BREAKOUT] {
            registry.register(function);
        }
        registry
    }

    /// Add or replace a function.
    pub fn register(&mut self, function: SignalFunction) {
        self.functions.insert(function.name, function);
    }

    pub fn get(&self, name: &str) -> Option<SignalFunction> {
        self.functions.get(name).copied()
    }

    pub fn functions(&self) -> impl Iterator<Item = &SignalFunction> {
        self.functions.values()
    }
}

fn last_two(series: &IndicatorSeries) -> Option<(f64, f64)> {
    let n = series.values.len();
    if n < 2 {
        return None;
    }
    Some((series.simple_at(n - 2)?, series.simple_at(n - 1)?))
}

/// Periods of history fed to recursive indicators (EMA, RSI); older bars
/// weigh less than (1 - 1/period)^(10 * period) and are dropped.
const WARMUP_PERIODS: usize = 10;

/// Tail of `bars` long enough for a window of `period` plus one prior point.
fn tail(bars: &[Bar], len: usize) -> &[Bar] {
    &bars[bars.len().saturating_sub(len)..]
}

pub const MA_CROSSOVER: SignalFunction = SignalFunction {
    name: "ma_crossover",
    description: "BUY when the fast moving average crosses above the slow one, SELL on the cross below",
    schema: &[
        ParamSpec::optional("fast", ParamKind::Int, "10").at_least(1.0),
        ParamSpec::optional("slow", ParamKind::Int, "30").at_least(2.0),
        ParamSpec::optional("kind", ParamKind::Str, "sma").one_of(&["sma", "ema"]),
    ],
    compute: ma_crossover,
    check: Some(check_ma_crossover),
};

fn check_ma_crossover(params: &ParamBag) -> Result<(), (&'static str, String)> {
    let fast = params.get_usize("fast").unwrap_or(0);
    let slow = params.get_usize("slow").unwrap_or(0);
    if fast >= slow {
        return Err(("fast", format!("fast period {fast} must be below slow period {slow}")));
    }
    Ok(())
}

fn ma_crossover(input: &SignalInput<'_>, params: &ParamBag) -> Signal {
    let fast = params.get_usize("fast").unwrap_or(10);
    let slow = params.get_usize("slow").unwrap_or(30);
    let (fast_series, slow_series) = match params.get_str("kind") {
        Some("ema") => {
            let bars = tail(input.bars, slow * WARMUP_PERIODS + 1);
            (calculate_ema(bars, fast), calculate_ema(bars, slow))
        }
        _ => {
            let bars = tail(input.bars, slow + 1);
            (calculate_sma(bars, fast), calculate_sma(bars, slow))
        }
    };

    let (Some((fast_prev, fast_now)), Some((slow_prev, slow_now))) =
        (last_two(&fast_series), last_two(&slow_series))
    else {
        return Signal::Hold;
    };

    if fast_prev <= slow_prev && fast_now > slow_now {
        Signal::Buy
    } else if fast_prev >= slow_prev && fast_now < slow_now {
        Signal::Sell
    } else {
        Signal::Hold
    }
}

pub const RSI_THRESHOLD: SignalFunction = SignalFunction {
    name: "rsi_threshold",
    description: "BUY while RSI is below the oversold level, SELL while above the overbought level",
    schema: &[
        ParamSpec::optional("period", ParamKind::Int, "14").at_least(1.0),
        ParamSpec::optional("oversold", ParamKind::Float, "30").range(0.0, 100.0),
        ParamSpec::optional("overbought", ParamKind::Float, "70").range(0.0, 100.0),
    ],
    compute: rsi_threshold,
    check: Some(check_rsi_threshold),
};

fn check_rsi_threshold(params: &ParamBag) -> Result<(), (&'static str, String)> {
    let oversold = params.get_float("oversold").unwrap_or(0.0);
    let overbought = params.get_float("overbought").unwrap_or(0.0);
    if oversold >= overbought {
        return Err((
            "oversold",
            format!("oversold {oversold} must be below overbought {overbought}"),
        ));
    }
    Ok(())
}

fn rsi_threshold(input: &SignalInput<'_>, params: &ParamBag) -> Signal {
    let period = params.get_usize("period").unwrap_or(14);
    let oversold = params.get_float("oversold").unwrap_or(30.0);
    let overbought = params.get_float("overbought").unwrap_or(70.0);

    let series = calculate_rsi(tail(input.bars, period * WARMUP_PERIODS + 1), period);
    match series.last().and_then(|p| p.as_simple()) {
        Some(rsi) if rsi < oversold => Signal::Buy,
        Some(rsi) if rsi > overbought => Signal::Sell,
        _ => Signal::Hold,
    }
}

pub const ROC_MOMENTUM: SignalFunction = SignalFunction {
    name: "roc_momentum",
    description: "Strength proportional to the rate of change, saturating at +/- scale percent",
    schema: &[
        ParamSpec::optional("period", ParamKind::Int, "10").at_least(1.0),
        ParamSpec::optional("scale", ParamKind::Float, "5").at_least(f64::MIN_POSITIVE),
    ],
    compute: roc_momentum,
    check: None,
};

fn roc_momentum(input: &SignalInput<'_>, params: &ParamBag) -> Signal {
    let period = params.get_usize("period").unwrap_or(10);
    let scale = params.get_float("scale").unwrap_or(5.0);

    let series = calculate_roc(tail(input.bars, period + 1), period);
    match series.last().and_then(|p| p.as_simple()) {
        Some(roc) => Signal::strength(roc / scale),
        None => Signal::Hold,
    }
}

pub const CHANNEL_BREAKOUT: SignalFunction = SignalFunction {
    name: "channel_breakout",
    description: "BUY when the close breaks above the prior lookback high, SELL below the prior low",
    schema: &[ParamSpec::optional("lookback", ParamKind::Int, "20").at_least(1.0)],
    compute: channel_breakout,
    check: None,
};

fn channel_breakout(input: &SignalInput<'_>, params: &ParamBag) -> Signal {
    let lookback = params.get_usize("lookback").unwrap_or(20);
    let bars = tail(input.bars, lookback + 1);
    let series = calculate_channel(bars, lookback);

    let (Some(point), Some(bar)) = (series.last(), bars.last()) else {
        return Signal::Hold;
    };
    match point.value {
        IndicatorValue::Channel { upper, .. } if point.valid && bar.close > upper => Signal::Buy,
        IndicatorValue::Channel { lower, .. } if point.valid && bar.close < lower => Signal::Sell,
        _ => Signal::Hold,
    }
}
