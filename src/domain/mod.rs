//! Core domain types and simulation logic.

pub mod ohlcv;
pub mod timeframe;
pub mod signal;
pub mod params;
pub mod indicator;
pub mod signals;
pub mod combination;
pub mod strategy;
pub mod risk;
pub mod execution;
pub mod position;
pub mod position_manager;
pub mod performance;
pub mod market_data;
pub mod backtest;
pub mod config_validation;
pub mod error;
