//! Donchian-style price channel.
//!
//! upper[i] = max(H[i-n..i]), lower[i] = min(L[i-n..i]); the current bar is
//! excluded so a close can break out of the channel it is compared against.
//! Warmup: first n bars invalid.

use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType, IndicatorValue};
use crate::domain::ohlcv::Bar;

pub fn calculate_channel(bars: &[Bar], period: usize) -> IndicatorSeries {
    let mut values = Vec::with_capacity(bars.len());

    for (i, bar) in bars.iter().enumerate() {
        if period == 0 || i < period {
            values.push(IndicatorPoint::invalid(bar.timestamp));
            continue;
        }
        let window = &bars[i - period..i];
        let upper = window.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        let lower = window.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        values.push(IndicatorPoint {
            timestamp: bar.timestamp,
            valid: true,
            value: IndicatorValue::Channel { upper, lower },
        });
    }

    IndicatorSeries {
        indicator_type: IndicatorType::Channel(period),
        values,
    }
}
