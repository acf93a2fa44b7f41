//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::csv_adapter::{write_equity_curve, write_trades, CsvBarProvider};
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::domain::backtest::{
    BacktestConfig, BacktestResult, Backtester, ProcessingMode, DEFAULT_MAX_GAP_BARS,
};
use crate::domain::combination::CombinationPolicy;
use crate::domain::config_validation::{
    parse_time, rule_section, split_list, validate_backtest_config, validate_strategy_config,
    RULE_RESERVED_KEYS,
};
use crate::domain::error::{ConfluenceError, RunCondition};
use crate::domain::execution::ExecutionConfig;
use crate::domain::ohlcv::format_timestamp;
use crate::domain::risk::RiskBudget;
use crate::domain::signals::SignalRegistry;
use crate::domain::strategy::{RuleDef, Strategy, StrategyBuilder};
use crate::domain::timeframe::{parse_timeframes, Timeframe};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::DataProvider;

#[derive(Parser, Debug)]
#[command(
    name = "confluence",
    about = "Multi-symbol, multi-timeframe strategy backtester"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a backtest
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Strategy file; defaults to the [strategy] sections of --config
        #[arg(short, long)]
        strategy: Option<PathBuf>,
        /// Write closed trades to this CSV file
        #[arg(long)]
        trades: Option<PathBuf>,
        /// Write the equity curve to this CSV file
        #[arg(long)]
        equity: Option<PathBuf>,
        /// Force parallel processing
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a strategy configuration
    Validate {
        #[arg(short, long)]
        strategy: PathBuf,
    },
    /// List the built-in signal functions and their parameters
    Functions,
    /// List symbols with bar files in a data directory
    ListSymbols {
        #[arg(long)]
        data_dir: PathBuf,
    },
}

/// Everything `[backtest]` configures for one run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub backtest: BacktestConfig,
    pub start: i64,
    pub end: i64,
    /// Subset of the strategy's symbols; `None` runs them all.
    pub symbols: Option<Vec<String>>,
    pub timeframes: Option<Vec<Timeframe>>,
    pub data_dir: PathBuf,
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Backtest {
            config,
            strategy,
            trades,
            equity,
            parallel,
            dry_run,
        } => {
            if dry_run {
                run_dry_run(&config, strategy.as_ref())
            } else {
                run_backtest(
                    &config,
                    strategy.as_ref(),
                    trades.as_ref(),
                    equity.as_ref(),
                    parallel,
                )
            }
        }
        Command::Validate { strategy } => run_validate(&strategy),
        Command::Functions => run_functions(),
        Command::ListSymbols { data_dir } => run_list_symbols(&data_dir),
    }
}

pub fn load_config(path: &PathBuf) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        let err = ConfluenceError::ConfigParse {
            file: path.display().to_string(),
            reason: e.to_string(),
        };
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

/// Load and validate the backtest config and the strategy, which lives
/// either in its own file or in the backtest config.
fn load_inputs(
    config_path: &PathBuf,
    strategy_path: Option<&PathBuf>,
) -> Result<(RunSettings, Strategy), ExitCode> {
    eprintln!("Loading config from {}", config_path.display());
    let adapter = load_config(config_path)?;
    validate_backtest_config(&adapter).map_err(report)?;

    let strategy_adapter = match strategy_path {
        Some(path) => {
            eprintln!("Loading strategy from {}", path.display());
            Some(load_config(path)?)
        }
        None => None,
    };
    let strategy_config: &dyn ConfigPort = match &strategy_adapter {
        Some(a) => a,
        None => &adapter,
    };
    validate_strategy_config(strategy_config).map_err(report)?;

    let strategy =
        build_strategy(strategy_config, &SignalRegistry::builtin()).map_err(report)?;
    eprintln!("Loaded strategy: {}", strategy.name());

    let settings = build_run_settings(&adapter).map_err(report)?;
    Ok((settings, strategy))
}

fn report(err: ConfluenceError) -> ExitCode {
    eprintln!("error: {err}");
    ExitCode::from(&err)
}

fn run_backtest(
    config_path: &PathBuf,
    strategy_path: Option<&PathBuf>,
    trades_path: Option<&PathBuf>,
    equity_path: Option<&PathBuf>,
    force_parallel: bool,
) -> ExitCode {
    let (mut settings, strategy) = match load_inputs(config_path, strategy_path) {
        Ok(inputs) => inputs,
        Err(code) => return code,
    };
    if force_parallel {
        settings.backtest.mode = ProcessingMode::Parallel;
    }

    let symbols = settings
        .symbols
        .clone()
        .unwrap_or_else(|| strategy.symbols().to_vec());
    let timeframes = settings
        .timeframes
        .clone()
        .unwrap_or_else(|| strategy.timeframes().to_vec());

    let provider: Arc<dyn DataProvider + Send + Sync> =
        Arc::new(CsvBarProvider::new(settings.data_dir.clone()));

    eprintln!(
        "Running backtest: {} symbols, {} to {}",
        symbols.len(),
        format_timestamp(settings.start),
        format_timestamp(settings.end),
    );

    let engine = Backtester::new(strategy, settings.backtest.clone(), provider);
    let result = match engine.run_backtest(&symbols, &timeframes, settings.start, settings.end) {
        Ok(r) => r,
        Err(e) => return report(e),
    };
    eprintln!("  Processed: {} timestamps", result.equity_curve.len());

    print_summary(&result);

    if let Some(path) = trades_path {
        if let Err(e) = write_trades(path, &result.trades) {
            return report(e);
        }
        eprintln!("\nTrades written to: {}", path.display());
    }
    if let Some(path) = equity_path {
        if let Err(e) = write_equity_curve(path, &result.equity_curve) {
            return report(e);
        }
        eprintln!("Equity curve written to: {}", path.display());
    }

    match result.fatal_error() {
        Some(RunCondition::FatalIo { .. }) => ExitCode::from(3),
        _ => ExitCode::SUCCESS,
    }
}

pub fn print_summary(result: &BacktestResult) {
    let m = &result.metrics;
    eprintln!("\n=== Aggregate Results ===");
    eprintln!("Total Return:     {:.2}%", m.total_return);
    eprintln!("Final Equity:     {:.2}", m.final_equity);
    eprintln!("Sharpe Ratio:     {:.2}", m.sharpe_ratio);
    eprintln!("Sortino Ratio:    {:.2}", m.sortino_ratio);
    eprintln!("Max Drawdown:     -{:.1}%", m.max_drawdown);
    eprintln!("Total Trades:     {}", m.total_trades);
    eprintln!("Win Rate:         {:.1}%", m.win_rate);
    eprintln!("Profit Factor:    {:.2}", m.profit_factor);
    eprintln!(
        "Avg Duration:     {:.1}h",
        m.avg_trade_duration / 3_600_000.0
    );
    eprintln!("Risk Rejections:  {}", result.risk_rejections());
    eprintln!("Data Gaps:        {}", result.data_gaps());

    let per_symbol = result.per_symbol();
    if !per_symbol.is_empty() {
        eprintln!("\n=== Per-Symbol Summary ===");
        for (symbol, sp) in per_symbol {
            let pnl_sign = if sp.total_pnl >= 0.0 { "+" } else { "" };
            eprintln!(
                "  {}:  {} trades, {:.1}% win rate, {}{:.2}",
                symbol, sp.total_trades, sp.win_rate, pnl_sign, sp.total_pnl,
            );
        }
    }

    if !result.completed {
        eprintln!("\nwarning: run stopped early");
        if let Some(fatal) = result.fatal_error() {
            eprintln!("  {fatal}");
        }
        for p in &result.open_positions {
            eprintln!(
                "  still open: {} {} {:.6} @ {:.4}",
                p.direction, p.symbol, p.size, p.entry_price
            );
        }
    }
}

fn config_invalid(section: &str, key: &str, reason: impl Into<String>) -> ConfluenceError {
    ConfluenceError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn parse_optional<T: std::str::FromStr>(
    adapter: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<Option<T>, ConfluenceError> {
    match adapter
        .get_string(section, key)
        .filter(|s| !s.trim().is_empty())
    {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| config_invalid(section, key, format!("cannot parse '{raw}'"))),
    }
}

pub fn build_run_settings(adapter: &dyn ConfigPort) -> Result<RunSettings, ConfluenceError> {
    let time = |key: &str, end_of_range: bool| -> Result<i64, ConfluenceError> {
        let raw = adapter
            .get_string("backtest", key)
            .ok_or_else(|| ConfluenceError::ConfigMissing {
                section: "backtest".into(),
                key: key.into(),
            })?;
        parse_time(&raw, end_of_range)
            .ok_or_else(|| config_invalid("backtest", key, "invalid date format"))
    };
    let start = time("start", false)?;
    let end = time("end", true)?;

    let execution = ExecutionConfig {
        commission_per_trade: adapter.get_double("backtest", "commission_per_trade", 0.0),
        commission_pct: adapter.get_double("backtest", "commission_pct", 0.0),
        slippage_pct: adapter.get_double("backtest", "slippage_pct", 0.0),
        allow_shorting: adapter.get_bool("backtest", "allow_shorting", false),
    };

    let mode = match parse_optional::<String>(adapter, "backtest", "mode")? {
        Some(raw) => raw
            .parse()
            .map_err(|e: String| config_invalid("backtest", "mode", e))?,
        None => ProcessingMode::Sequential,
    };

    let backtest = BacktestConfig {
        initial_balance: adapter.get_double("backtest", "initial_balance", 10_000.0),
        execution,
        mode,
        workers: adapter.get_int("backtest", "workers", 0).max(0) as usize,
        max_gap_bars: adapter
            .get_int("backtest", "max_gap_bars", DEFAULT_MAX_GAP_BARS as i64)
            .max(0) as usize,
        chunk_ms: parse_optional(adapter, "backtest", "chunk_ms")?,
        periods_per_year: parse_optional(adapter, "backtest", "periods_per_year")?,
        time_budget: parse_optional::<f64>(adapter, "backtest", "time_budget_secs")?
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|e| ConfluenceError::ConfigInvalid {
                section: "backtest".into(),
                key: "time_budget_secs".into(),
                reason: e.to_string(),
            })?,
    };

    let symbols = adapter
        .get_string("backtest", "symbols")
        .map(|s| split_list(&s).into_iter().map(|s| s.to_uppercase()).collect());
    let timeframes = match adapter.get_string("backtest", "timeframes") {
        Some(raw) => Some(
            parse_timeframes(&raw)
                .map_err(|e| config_invalid("backtest", "timeframes", e.to_string()))?,
        ),
        None => None,
    };

    Ok(RunSettings {
        backtest,
        start,
        end,
        symbols,
        timeframes,
        data_dir: adapter
            .get_string("backtest", "data_dir")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data")),
    })
}

pub fn build_strategy(
    adapter: &dyn ConfigPort,
    registry: &SignalRegistry,
) -> Result<Strategy, ConfluenceError> {
    let name = adapter
        .get_string("strategy", "name")
        .unwrap_or_else(|| "Unnamed".to_string());
    let symbols: Vec<String> = split_list(&adapter.get_string("strategy", "symbols").unwrap_or_default())
        .into_iter()
        .map(|s| s.to_uppercase())
        .collect();
    let timeframes = parse_timeframes(&adapter.get_string("strategy", "timeframes").unwrap_or_default())
        .map_err(|e| config_invalid("strategy", "timeframes", e.to_string()))?;

    let mut policy = match parse_optional::<String>(adapter, "strategy", "policy")? {
        Some(raw) => raw
            .parse::<CombinationPolicy>()
            .map_err(|e| config_invalid("strategy", "policy", e.to_string()))?,
        None => CombinationPolicy::MajorityVote,
    };
    if let CombinationPolicy::Weighted { threshold } = &mut policy {
        if let Some(t) = parse_optional(adapter, "strategy", "threshold")? {
            *threshold = t;
        }
    }

    let defaults = RiskBudget::default();
    let risk_budget = RiskBudget {
        max_open_positions: adapter
            .get_int("risk", "max_open_positions", defaults.max_open_positions as i64)
            .max(0) as usize,
        max_risk_per_trade: adapter.get_double("risk", "max_risk_per_trade", defaults.max_risk_per_trade),
        max_portfolio_risk: adapter.get_double("risk", "max_portfolio_risk", defaults.max_portfolio_risk),
        stop_loss: adapter.get_double("risk", "stop_loss", defaults.stop_loss),
        take_profit: adapter.get_double("risk", "take_profit", defaults.take_profit),
        max_position_fraction: adapter.get_double(
            "risk",
            "max_position_fraction",
            defaults.max_position_fraction,
        ),
        size_increment: adapter.get_double("risk", "size_increment", defaults.size_increment),
    };

    let mut builder = StrategyBuilder::new(&name)
        .symbols(symbols)
        .timeframes(timeframes)
        .policy(policy)
        .risk_budget(risk_budget);

    let rule_names = split_list(&adapter.get_string("strategy", "rules").unwrap_or_default());
    for rule_name in &rule_names {
        let section = rule_section(rule_name);
        let function = adapter.get_string(&section, "function").unwrap_or_default();
        let mut rule = RuleDef::from_registry(registry, rule_name, &function)?;

        for key in adapter.keys(&section) {
            if RULE_RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if let Some(value) = adapter.get_string(&section, &key) {
                rule = rule.param(&key, value);
            }
        }
        if let Some(weight) = parse_optional(adapter, &section, "weight")? {
            rule = rule.weight(weight);
        }
        if let Some(tf) = parse_optional::<Timeframe>(adapter, &section, "timeframe")? {
            rule = rule.timeframe(tf);
        }
        builder = builder.rule(rule);
    }

    Ok(builder.build()?)
}

fn print_strategy(strategy: &Strategy) {
    eprintln!("\nStrategy: {}", strategy.name());
    eprintln!("  symbols:    {}", strategy.symbols().join(", "));
    eprintln!(
        "  timeframes: {}",
        strategy
            .timeframes()
            .iter()
            .map(|tf| tf.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    eprintln!("  policy:     {}", strategy.policy());
    eprintln!("\nSignal rules:");
    for rule in strategy.rules() {
        let params: Vec<String> = rule
            .params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let mut line = format!("  {}: {}({})", rule.name, rule.function.name, params.join(", "));
        if let Some(tf) = rule.timeframe {
            line.push_str(&format!(" on {tf}"));
        }
        if let Some(w) = rule.weight {
            line.push_str(&format!(" weight {w}"));
        }
        eprintln!("{line}");
    }
    let risk = strategy.risk_budget();
    eprintln!("\nRisk budget:");
    eprintln!("  max open positions: {}", risk.max_open_positions);
    eprintln!("  risk per trade:     {:.2}%", risk.max_risk_per_trade * 100.0);
    eprintln!("  portfolio risk:     {:.2}%", risk.max_portfolio_risk * 100.0);
    eprintln!(
        "  stop / take:        {:.2}% / {:.2}%",
        risk.stop_loss * 100.0,
        risk.take_profit * 100.0
    );
}

pub fn run_dry_run(config_path: &PathBuf, strategy_path: Option<&PathBuf>) -> ExitCode {
    let (settings, strategy) = match load_inputs(config_path, strategy_path) {
        Ok(inputs) => inputs,
        Err(code) => return code,
    };
    eprintln!("Config validated successfully");
    print_strategy(&strategy);

    eprintln!("\nRun:");
    eprintln!(
        "  range:   {} to {}",
        format_timestamp(settings.start),
        format_timestamp(settings.end)
    );
    eprintln!("  mode:    {}", settings.backtest.mode);
    eprintln!("  data:    {}", settings.data_dir.display());
    if let Some(symbols) = &settings.symbols {
        eprintln!("  symbols: {}", symbols.join(", "));
    }

    eprintln!("\nDry run complete: configuration is valid");
    ExitCode::SUCCESS
}

fn run_validate(strategy_path: &PathBuf) -> ExitCode {
    eprintln!("Validating strategy: {}", strategy_path.display());
    let adapter = match load_config(strategy_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    if let Err(e) = validate_strategy_config(&adapter) {
        return report(e);
    }
    let strategy = match build_strategy(&adapter, &SignalRegistry::builtin()) {
        Ok(s) => s,
        Err(e) => return report(e),
    };
    print_strategy(&strategy);

    eprintln!("\nStrategy configuration is valid.");
    ExitCode::SUCCESS
}

fn run_functions() -> ExitCode {
    let registry = SignalRegistry::builtin();
    for function in registry.functions() {
        println!("{:<18} {}", function.name, function.description);
        for spec in function.schema {
            let mut line = format!("    {:<12} {}", spec.name, spec.kind.name());
            match spec.default {
                Some(default) => line.push_str(&format!(", default {default}")),
                None => line.push_str(", required"),
            }
            if !spec.choices.is_empty() {
                line.push_str(&format!(", one of {}", spec.choices.join("|")));
            }
            println!("{line}");
        }
    }
    ExitCode::SUCCESS
}

fn run_list_symbols(data_dir: &Path) -> ExitCode {
    let provider = CsvBarProvider::new(data_dir);
    match provider.list_symbols() {
        Ok(symbols) if symbols.is_empty() => {
            eprintln!("No symbols found in {}", data_dir.display());
            ExitCode::SUCCESS
        }
        Ok(symbols) => {
            for symbol in &symbols {
                println!("{symbol}");
            }
            eprintln!("{} symbols found", symbols.len());
            ExitCode::SUCCESS
        }
        Err(e) => report(e),
    }
}
