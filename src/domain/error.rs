//! Domain error types.
//!
//! Three layers:
//! - [`BuildError`]: a strategy or risk budget that cannot be run (pre-run, fatal).
//! - [`ConfluenceError`]: top-level error for everything that stops a run before
//!   the simulation clock starts (config, build, provider, concurrency).
//! - [`RunCondition`]: recoverable conditions recorded in the backtest result
//!   once the clock is running.

use crate::domain::position::Direction;
use crate::domain::timeframe::Timeframe;

/// A strategy definition that failed validation at build time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("strategy has no signal rules")]
    NoSignalRules,

    #[error("strategy has no symbols")]
    NoSymbols,

    #[error("strategy has no timeframes")]
    NoTimeframes,

    #[error("duplicate symbol: {0}")]
    DuplicateSymbol(String),

    #[error("duplicate rule name: {0}")]
    DuplicateRule(String),

    #[error("unknown signal function '{function}' for rule {rule}")]
    UnknownFunction { rule: String, function: String },

    #[error("rule {rule}: unknown parameter '{param}'")]
    UnknownParameter { rule: String, param: String },

    #[error("rule {rule}: missing required parameter '{param}'")]
    MissingParameter { rule: String, param: String },

    #[error("rule {rule}: parameter '{param}' expected {expected}")]
    ParameterType {
        rule: String,
        param: String,
        expected: &'static str,
    },

    #[error("rule {rule}: parameter '{param}' out of range: {reason}")]
    ParameterRange {
        rule: String,
        param: String,
        reason: String,
    },

    #[error("rule {rule}: timeframe {timeframe} is not one of the strategy timeframes")]
    UnknownTimeframe { rule: String, timeframe: Timeframe },

    #[error("rule {rule}: weighted policy requires a weight")]
    MissingWeight { rule: String },

    #[error("rule {rule}: weight {weight} must be in (0, 1]")]
    InvalidWeight { rule: String, weight: f64 },

    #[error("rule weights sum to {sum}, must not exceed 1")]
    WeightSumExceeded { sum: f64 },

    #[error("weighted threshold {0} must be in (0, 1]")]
    InvalidThreshold(f64),

    #[error("invalid risk budget {field}: {reason}")]
    InvalidRiskBudget { field: &'static str, reason: String },

    #[error("symbol {0} is not part of the strategy")]
    UnknownSymbol(String),

    #[error("timeframe {0} is not part of the strategy")]
    UnregisteredTimeframe(Timeframe),

    #[error("invalid time range: start {start} is after end {end}")]
    InvalidRange { start: i64, end: i64 },
}

/// Top-level error type for confluence.
#[derive(Debug, thiserror::Error)]
pub enum ConfluenceError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("data provider error: {reason}")]
    DataProvider { reason: String },

    #[error("invalid bar for {symbol} {timeframe} at {timestamp}: {reason}")]
    InvalidBar {
        symbol: String,
        timeframe: Timeframe,
        timestamp: i64,
        reason: String,
    },

    #[error("a backtest is already running on this engine")]
    RunInProgress,

    #[error("could not start worker pool: {reason}")]
    WorkerPool { reason: String },

    #[error("equity point at {timestamp} is not after {previous}")]
    EquityOutOfOrder { timestamp: i64, previous: i64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&ConfluenceError> for std::process::ExitCode {
    fn from(err: &ConfluenceError) -> Self {
        let code: u8 = match err {
            ConfluenceError::Io(_) => 1,
            ConfluenceError::ConfigParse { .. }
            | ConfluenceError::ConfigMissing { .. }
            | ConfluenceError::ConfigInvalid { .. } => 2,
            ConfluenceError::DataProvider { .. } | ConfluenceError::InvalidBar { .. } => 3,
            ConfluenceError::Build(_) => 4,
            ConfluenceError::RunInProgress
            | ConfluenceError::WorkerPool { .. }
            | ConfluenceError::EquityOutOfOrder { .. } => 5,
        };
        std::process::ExitCode::from(code)
    }
}

/// Why the risk manager refused an entry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectReason {
    #[error("max open positions reached ({open}/{max})")]
    MaxOpenPositions { open: usize, max: usize },

    #[error("trade risk {risk:.4} exceeds per-trade limit {limit:.4}")]
    TradeRiskExceeded { risk: f64, limit: f64 },

    #[error("portfolio risk {risk:.4} exceeds limit {limit:.4}")]
    PortfolioRiskExceeded { risk: f64, limit: f64 },

    #[error("stop-loss/take-profit distance must be positive")]
    InvalidStopDistance,

    #[error("position size rounds to zero")]
    ZeroSize,

    #[error("insufficient balance for {cost:.4} (balance {balance:.4})")]
    InsufficientBalance { cost: f64, balance: f64 },
}

/// A recoverable condition recorded while the simulation clock is running.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunCondition {
    #[error("data gap for {symbol} {timeframe}: no bar between {from} and {to}")]
    DataGap {
        symbol: String,
        timeframe: Timeframe,
        from: i64,
        to: i64,
    },

    #[error("{direction} entry on {symbol} at {timestamp} rejected: {reason}")]
    RiskRejection {
        symbol: String,
        timestamp: i64,
        direction: Direction,
        reason: RejectReason,
    },

    #[error("no open position for {symbol} at {timestamp}")]
    PositionNotFound { symbol: String, timestamp: i64 },

    #[error("fatal data error after {last_processed:?}: {reason}")]
    FatalIo {
        last_processed: Option<i64>,
        reason: String,
    },

    #[error("time budget exceeded at {timestamp}")]
    TimeBudgetExceeded { timestamp: i64 },
}

impl RunCondition {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RunCondition::FatalIo { .. } | RunCondition::TimeBudgetExceeded { .. }
        )
    }
}
