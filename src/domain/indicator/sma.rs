//! Simple Moving Average indicator.
//!
//! SMA(n)[i] = mean(C[i-n+1..=i]), maintained as a rolling sum.
//! Warmup: first (n-1) bars are invalid.

use crate::domain::indicator::{IndicatorPoint, IndicatorSeries, IndicatorType};
use crate::domain::ohlcv::Bar;

pub fn calculate_sma(bars: &[Bar], period: usize) -> IndicatorSeries {
    if period == 0 {
        return IndicatorSeries {
            indicator_type: IndicatorType::Sma(period),
            values: Vec::new(),
        };
    }

    let mut values = Vec::with_capacity(bars.len());
    let mut sum = 0.0;

    for (i, bar) in bars.iter().enumerate() {
        sum += bar.close;
        if i >= period {
            sum -= bars[i - period].close;
        }
        if i + 1 < period {
            values.push(IndicatorPoint::invalid(bar.timestamp));
        } else {
            values.push(IndicatorPoint::simple(bar.timestamp, sum / period as f64));
        }
    }

    IndicatorSeries {
        indicator_type: IndicatorType::Sma(period),
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::indicator::bars_from_closes;

    #[test]
    fn sma_warmup() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0]);
        let series = calculate_sma(&bars, 3);
        assert!(!series.values[0].valid);
        assert!(!series.values[1].valid);
        assert!(series.values[2].valid);
        assert!(series.values[3].valid);
    }

    #[test]
    fn sma_rolling_mean() {
        let bars = bars_from_closes(&[10.0, 20.0, 30.0, 40.0]);
        let series = calculate_sma(&bars, 2);
        assert_eq!(series.simple_at(1), Some(15.0));
        assert_eq!(series.simple_at(2), Some(25.0));
        assert_eq!(series.simple_at(3), Some(35.0));
    }

    #[test]
    fn sma_keeps_bar_timestamps() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        let series = calculate_sma(&bars, 1);
        assert_eq!(series.values[1].timestamp, bars[1].timestamp);
    }

    #[test]
    fn sma_period_0() {
        let bars = bars_from_closes(&[1.0, 2.0]);
        assert!(calculate_sma(&bars, 0).values.is_empty());
    }

    #[test]
    fn sma_indicator_type() {
        let series = calculate_sma(&[], 7);
        assert_eq!(series.indicator_type, IndicatorType::Sma(7));
        assert!(series.values.is_empty());
    }
}
