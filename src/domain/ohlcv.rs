//! OHLCV bar representation.

use chrono::DateTime;

use crate::domain::timeframe::Timeframe;

#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Open time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// The instant this bar is complete.
    pub fn close_time(&self) -> i64 {
        self.timestamp + self.timeframe.duration_ms()
    }

    /// Human-readable UTC open time, `YYYY-MM-DD HH:MM:SS`.
    pub fn datetime(&self) -> String {
        format_timestamp(self.timestamp)
    }

    /// (high + low + close) / 3
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// Check price and volume invariants. Returns the first violation.
    pub fn validate(&self) -> Result<(), String> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err("prices must be finite and positive".into());
        }
        if self.high < self.open.max(self.close) {
            return Err(format!(
                "high {} below max(open, close) {}",
                self.high,
                self.open.max(self.close)
            ));
        }
        if self.low > self.open.min(self.close) {
            return Err(format!(
                "low {} above min(open, close) {}",
                self.low,
                self.open.min(self.close)
            ));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err("volume must be non-negative".into());
        }
        Ok(())
    }
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}
