//! Configuration validation.
//!
//! Validates all config fields before a backtest runs, so that building the
//! run settings afterwards can rely on every present value being well formed.

use chrono::{NaiveDate, NaiveDateTime};

use crate::domain::backtest::ProcessingMode;
use crate::domain::combination::CombinationPolicy;
use crate::domain::error::ConfluenceError;
use crate::domain::timeframe::parse_timeframes;
use crate::ports::config_port::ConfigPort;

const DAY_MS: i64 = 86_400_000;

/// Keys of a `[rule.<name>]` section that are not signal parameters.
pub const RULE_RESERVED_KEYS: [&str; 3] = ["function", "weight", "timeframe"];

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    validate_initial_balance(config)?;
    validate_costs(config)?;
    validate_range(config)?;
    validate_optional_lists(config, "backtest")?;
    validate_processing(config)?;
    Ok(())
}

pub fn validate_strategy_config(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    validate_universe(config)?;
    validate_policy(config)?;
    validate_risk(config)?;
    validate_rules(config)?;
    Ok(())
}

/// Section holding the settings of rule `name`.
pub fn rule_section(name: &str) -> String {
    format!("rule.{}", name.trim())
}

/// Split a comma separated list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` (UTC) into epoch milliseconds.
/// A bare date used as the end of a range covers that whole day.
pub fn parse_time(value: &str, end_of_range: bool) -> Option<i64> {
    let value = value.trim();
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp_millis());
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let start = date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis();
    Some(if end_of_range { start + DAY_MS - 1 } else { start })
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> ConfluenceError {
    ConfluenceError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn missing(section: &str, key: &str) -> ConfluenceError {
    ConfluenceError::ConfigMissing {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn non_empty(config: &dyn ConfigPort, section: &str, key: &str) -> Option<String> {
    config
        .get_string(section, key)
        .filter(|s| !s.trim().is_empty())
}

/// A present numeric key must parse; `get_double` would silently fall back.
fn optional_number(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<f64>, ConfluenceError> {
    match non_empty(config, section, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(section, key, format!("'{raw}' is not a number"))),
    }
}

fn validate_initial_balance(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    match optional_number(config, "backtest", "initial_balance")? {
        None => Err(missing("backtest", "initial_balance")),
        Some(v) if v <= 0.0 => Err(invalid(
            "backtest",
            "initial_balance",
            "initial_balance must be positive",
        )),
        Some(_) => Ok(()),
    }
}

fn validate_costs(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    for key in ["commission_per_trade", "commission_pct"] {
        if let Some(v) = optional_number(config, "backtest", key)? {
            if v < 0.0 {
                return Err(invalid("backtest", key, format!("{key} must be non-negative")));
            }
        }
    }
    if let Some(v) = optional_number(config, "backtest", "slippage_pct")? {
        if !(0.0..100.0).contains(&v) {
            return Err(invalid(
                "backtest",
                "slippage_pct",
                "slippage_pct must be in [0, 100)",
            ));
        }
    }
    Ok(())
}

fn validate_range(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    let start = required_time(config, "start", false)?;
    let end = required_time(config, "end", true)?;
    if start >= end {
        return Err(invalid("backtest", "start", "start must be before end"));
    }
    Ok(())
}

fn required_time(
    config: &dyn ConfigPort,
    key: &str,
    end_of_range: bool,
) -> Result<i64, ConfluenceError> {
    let raw = non_empty(config, "backtest", key).ok_or_else(|| missing("backtest", key))?;
    parse_time(&raw, end_of_range).ok_or_else(|| {
        invalid(
            "backtest",
            key,
            format!("invalid {key} '{raw}', expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS"),
        )
    })
}

fn validate_optional_lists(config: &dyn ConfigPort, section: &str) -> Result<(), ConfluenceError> {
    if let Some(raw) = config.get_string(section, "symbols") {
        if split_list(&raw).is_empty() {
            return Err(invalid(section, "symbols", "symbols list is empty"));
        }
    }
    if let Some(raw) = config.get_string(section, "timeframes") {
        let timeframes =
            parse_timeframes(&raw).map_err(|e| invalid(section, "timeframes", e.to_string()))?;
        if timeframes.is_empty() {
            return Err(invalid(section, "timeframes", "timeframes list is empty"));
        }
    }
    Ok(())
}

fn validate_processing(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    if let Some(raw) = non_empty(config, "backtest", "mode") {
        raw.parse::<ProcessingMode>()
            .map_err(|e| invalid("backtest", "mode", e))?;
    }
    for key in ["workers", "max_gap_bars"] {
        if let Some(v) = optional_number(config, "backtest", key)? {
            if v < 0.0 || v.fract() != 0.0 {
                return Err(invalid(
                    "backtest",
                    key,
                    format!("{key} must be a non-negative integer"),
                ));
            }
        }
    }
    for key in ["chunk_ms", "periods_per_year", "time_budget_secs"] {
        if let Some(v) = optional_number(config, "backtest", key)? {
            if v <= 0.0 {
                return Err(invalid("backtest", key, format!("{key} must be positive")));
            }
        }
    }
    Ok(())
}

fn validate_universe(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    if non_empty(config, "strategy", "symbols").is_none() {
        return Err(missing("strategy", "symbols"));
    }
    if non_empty(config, "strategy", "timeframes").is_none() {
        return Err(missing("strategy", "timeframes"));
    }
    validate_optional_lists(config, "strategy")
}

fn validate_policy(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    if let Some(raw) = non_empty(config, "strategy", "policy") {
        raw.parse::<CombinationPolicy>()
            .map_err(|e| invalid("strategy", "policy", e.to_string()))?;
    }
    if let Some(threshold) = optional_number(config, "strategy", "threshold")? {
        if threshold <= 0.0 || threshold > 1.0 {
            return Err(invalid(
                "strategy",
                "threshold",
                "threshold must be in (0, 1]",
            ));
        }
    }
    Ok(())
}

fn validate_risk(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    if let Some(v) = optional_number(config, "risk", "max_open_positions")? {
        if v < 1.0 || v.fract() != 0.0 {
            return Err(invalid(
                "risk",
                "max_open_positions",
                "max_open_positions must be an integer of at least 1",
            ));
        }
    }
    for key in [
        "max_risk_per_trade",
        "max_portfolio_risk",
        "max_position_fraction",
    ] {
        if let Some(v) = optional_number(config, "risk", key)? {
            if v <= 0.0 || v > 1.0 {
                return Err(invalid("risk", key, format!("{key} must be in (0, 1]")));
            }
        }
    }
    if let Some(v) = optional_number(config, "risk", "stop_loss")? {
        if v <= 0.0 || v >= 1.0 {
            return Err(invalid("risk", "stop_loss", "stop_loss must be in (0, 1)"));
        }
    }
    if let Some(v) = optional_number(config, "risk", "take_profit")? {
        if v <= 0.0 {
            return Err(invalid("risk", "take_profit", "take_profit must be positive"));
        }
    }
    if let Some(v) = optional_number(config, "risk", "size_increment")? {
        if v < 0.0 {
            return Err(invalid(
                "risk",
                "size_increment",
                "size_increment must be non-negative",
            ));
        }
    }
    Ok(())
}

fn validate_rules(config: &dyn ConfigPort) -> Result<(), ConfluenceError> {
    let raw = non_empty(config, "strategy", "rules").ok_or_else(|| missing("strategy", "rules"))?;
    let names = split_list(&raw);
    if names.is_empty() {
        return Err(missing("strategy", "rules"));
    }
    for name in &names {
        let section = rule_section(name);
        if non_empty(config, &section, "function").is_none() {
            return Err(missing(&section, "function"));
        }
        if let Some(weight) = optional_number(config, &section, "weight")? {
            if weight <= 0.0 || weight > 1.0 {
                return Err(invalid(&section, "weight", "weight must be in (0, 1]"));
            }
        }
        if let Some(tf) = non_empty(config, &section, "timeframe") {
            tf.parse::<crate::domain::timeframe::Timeframe>()
                .map_err(|e| invalid(&section, "timeframe", e.to_string()))?;
        }
    }
    Ok(())
}
