//! Market data access port trait.

use crate::domain::error::ConfluenceError;
use crate::domain::ohlcv::Bar;
use crate::domain::timeframe::Timeframe;

pub trait DataProvider {
    /// Bars for `symbol` at `timeframe` whose open time lies in
    /// `[start_ms, end_ms]`, in ascending timestamp order. An absent series is
    /// an empty vector, not an error.
    fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Bar>, ConfluenceError>;

    /// Symbols this provider has any data for.
    fn list_symbols(&self) -> Result<Vec<String>, ConfluenceError>;
}
