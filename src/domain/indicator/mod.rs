//! Technical indicator implementations.
//!
//! This module provides types for representing indicator values and series:
//! - `IndicatorPoint`: A single point in an indicator time series
//! - `IndicatorValue`: Enum for different indicator output shapes
//! - `IndicatorType`: Enum for indicator identity + parameters
//! - `IndicatorSeries`: A time series of indicator values, one point per bar
//!
//! Every function here is pure: the output for bar `i` depends only on bars
//! `0..=i`.

pub mod channel;
pub mod ema;
pub mod roc;
pub mod rsi;
pub mod sma;

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorPoint {
    pub timestamp: i64,
    pub valid: bool,
    pub value: IndicatorValue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndicatorValue {
    Simple(f64),
    Channel { upper: f64, lower: f64 },
}

impl IndicatorPoint {
    pub(crate) fn invalid(timestamp: i64) -> Self {
        IndicatorPoint {
            timestamp,
            valid: false,
            value: IndicatorValue::Simple(0.0),
        }
    }

    pub(crate) fn simple(timestamp: i64, value: f64) -> Self {
        IndicatorPoint {
            timestamp,
            valid: true,
            value: IndicatorValue::Simple(value),
        }
    }

    /// The scalar value, if this point is valid and single-valued.
    pub fn as_simple(&self) -> Option<f64> {
        match (self.valid, self.value) {
            (true, IndicatorValue::Simple(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndicatorType {
    Sma(usize),
    Ema(usize),
    Rsi(usize),
    Roc(usize),
    /// Highest high / lowest low over the previous n bars.
    Channel(usize),
}

#[derive(Debug, Clone)]
pub struct IndicatorSeries {
    pub indicator_type: IndicatorType,
    pub values: Vec<IndicatorPoint>,
}

impl IndicatorSeries {
    pub fn last(&self) -> Option<&IndicatorPoint> {
        self.values.last()
    }

    /// Valid scalar value at `index`.
    pub fn simple_at(&self, index: usize) -> Option<f64> {
        self.values.get(index).and_then(IndicatorPoint::as_simple)
    }
}

impl fmt::Display for IndicatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndicatorType::Sma(period) => write!(f, "SMA({})", period),
            IndicatorType::Ema(period) => write!(f, "EMA({})", period),
            IndicatorType::Rsi(period) => write!(f, "RSI({})", period),
            IndicatorType::Roc(period) => write!(f, "ROC({})", period),
            IndicatorType::Channel(period) => write!(f, "CHANNEL({})", period),
        }
    }
}

#[cfg(test)]
pub(crate) fn bars_from_closes(closes: &[f64]) -> Vec<crate::domain::ohlcv::Bar> {
    use crate::domain::ohlcv::Bar;
    use crate::domain::timeframe::Timeframe;

    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| Bar {
            symbol: "TEST".into(),
            timeframe: Timeframe::H1,
            timestamp: i as i64 * Timeframe::H1.duration_ms(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1000.0,
        })
        .collect()
}
