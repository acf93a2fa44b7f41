//! CLI integration tests for the command orchestration.
//!
//! Tests cover:
//! - Run settings and strategy built from INI files on disk
//! - Dry-run and validate modes
//! - Full backtest over CSV bar files with trade and equity export
//! - Exit codes for broken inputs

mod common;

use clap::Parser;
use common::*;
use confluence::adapters::csv_adapter::write_bars;
use confluence::adapters::file_config_adapter::FileConfigAdapter;
use confluence::cli::{self, Cli};
use confluence::domain::signals::SignalRegistry;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

/// 2024-01-01 00:00:00 UTC.
const JAN_1: i64 = 1_704_067_200_000;

fn write_temp_ini(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn same_code(actual: ExitCode, expected: ExitCode) -> bool {
    format!("{actual:?}") == format!("{expected:?}")
}

fn run_cli(args: &[&str]) -> ExitCode {
    let mut argv = vec!["confluence"];
    argv.extend_from_slice(args);
    cli::run(Cli::parse_from(argv))
}

fn config_ini(data_dir: &Path) -> String {
    format!(
        r#"
[backtest]
initial_balance = 10000
start = 2024-01-01
end = 2024-01-02
commission_pct = 0.1
allow_shorting = true
data_dir = {}

[strategy]
name = Hourly Cross
symbols = BTCUSDT, ETHUSDT
timeframes = 1h
policy = majority_vote
rules = cross

[risk]
max_open_positions = 2
stop_loss = 0.05
take_profit = 0.1

[rule.cross]
function = ma_crossover
fast = 2
slow = 4
"#,
        data_dir.display()
    )
}

fn write_hourly(dir: &Path, symbol: &str, closes: &[f64]) {
    let bars: Vec<Bar> = closes
        .iter()
        .enumerate()
        .map(|(i, &c)| make_bar(symbol, Timeframe::H1, JAN_1 + i as i64 * HOUR, c))
        .collect();
    write_bars(&dir.join(format!("{symbol}_1h.csv")), &bars).unwrap();
}

mod config_loading {
    use super::*;

    #[test]
    fn run_settings_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let ini = write_temp_ini(&config_ini(dir.path()));
        let adapter = FileConfigAdapter::from_file(ini.path()).unwrap();

        let settings = cli::build_run_settings(&adapter).unwrap();
        assert_eq!(settings.start, JAN_1);
        assert_eq!(settings.end, JAN_1 + 2 * 86_400_000 - 1);
        assert!(settings.backtest.execution.allow_shorting);
        assert_eq!(settings.data_dir.as_path(), dir.path());
        assert!(settings.symbols.is_none());
    }

    #[test]
    fn strategy_read_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let ini = write_temp_ini(&config_ini(dir.path()));
        let adapter = FileConfigAdapter::from_file(ini.path()).unwrap();

        let strategy = cli::build_strategy(&adapter, &SignalRegistry::builtin()).unwrap();
        assert_eq!(strategy.name(), "Hourly Cross");
        assert_eq!(strategy.symbols(), ["BTCUSDT", "ETHUSDT"]);
        assert_eq!(strategy.rules().len(), 1);
        assert_eq!(strategy.rules()[0].params.get_int("slow"), Some(4));
        assert_eq!(strategy.risk_budget().max_open_positions, 2);
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let code = run_cli(&["backtest", "--config", "/nonexistent/confluence.ini"]);
        assert!(same_code(code, ExitCode::from(2)));
    }

    #[test]
    fn invalid_range_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = config_ini(dir.path()).replace("end = 2024-01-02", "end = 2023-12-01");
        let ini = write_temp_ini(&content);
        let code = run_cli(&["backtest", "--config", ini.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::from(2)));
    }
}

mod commands {
    use super::*;

    #[test]
    fn dry_run_succeeds_without_data() {
        let dir = tempfile::tempdir().unwrap();
        let ini = write_temp_ini(&config_ini(dir.path()));
        let code = run_cli(&[
            "backtest",
            "--config",
            ini.path().to_str().unwrap(),
            "--dry-run",
        ]);
        assert!(same_code(code, ExitCode::SUCCESS));
    }

    #[test]
    fn validate_accepts_good_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let ini = write_temp_ini(&config_ini(dir.path()));
        let code = run_cli(&["validate", "--strategy", ini.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::SUCCESS));
    }

    #[test]
    fn validate_rejects_unknown_function() {
        let dir = tempfile::tempdir().unwrap();
        let content = config_ini(dir.path()).replace("function = ma_crossover", "function = tea_leaves");
        let ini = write_temp_ini(&content);
        let code = run_cli(&["validate", "--strategy", ini.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::from(4)));
    }

    #[test]
    fn validate_rejects_out_of_range_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let content = config_ini(dir.path()).replace("fast = 2", "fast = 9");
        let ini = write_temp_ini(&content);
        let code = run_cli(&["validate", "--strategy", ini.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::from(4)));
    }

    #[test]
    fn functions_lists_registry() {
        assert!(same_code(run_cli(&["functions"]), ExitCode::SUCCESS));
    }

    #[test]
    fn list_symbols_scans_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_hourly(dir.path(), "BTCUSDT", &[100.0; 3]);
        let code = run_cli(&["list-symbols", "--data-dir", dir.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::SUCCESS));
    }
}

mod pipeline {
    use super::*;

    #[test]
    fn backtest_exports_trades_and_equity() {
        let dir = tempfile::tempdir().unwrap();
        write_hourly(dir.path(), "BTCUSDT", &wave(48, 0));
        write_hourly(dir.path(), "ETHUSDT", &wave(48, 5));
        let ini = write_temp_ini(&config_ini(dir.path()));
        let trades = dir.path().join("trades.csv");
        let equity = dir.path().join("equity.csv");

        let code = run_cli(&[
            "backtest",
            "--config",
            ini.path().to_str().unwrap(),
            "--trades",
            trades.to_str().unwrap(),
            "--equity",
            equity.to_str().unwrap(),
        ]);
        assert!(same_code(code, ExitCode::SUCCESS));

        let equity_csv = std::fs::read_to_string(&equity).unwrap();
        let mut lines = equity_csv.lines();
        assert_eq!(lines.next(), Some("timestamp,datetime,equity,balance"));
        assert_eq!(lines.count(), 48);

        let trades_csv = std::fs::read_to_string(&trades).unwrap();
        let header = trades_csv.lines().next().unwrap();
        assert!(header.starts_with("symbol,direction,size"));
        assert!(trades_csv.lines().count() > 1);
        assert!(trades_csv.contains("end_of_run") || trades_csv.contains("signal"));
    }

    #[test]
    fn parallel_flag_gives_same_exports() {
        let dir = tempfile::tempdir().unwrap();
        write_hourly(dir.path(), "BTCUSDT", &wave(48, 0));
        write_hourly(dir.path(), "ETHUSDT", &wave(48, 5));
        let ini = write_temp_ini(&config_ini(dir.path()));
        let sequential = dir.path().join("seq.csv");
        let parallel = dir.path().join("par.csv");

        for (path, extra) in [(&sequential, None), (&parallel, Some("--parallel"))] {
            let mut args = vec![
                "backtest",
                "--config",
                ini.path().to_str().unwrap(),
                "--equity",
                path.to_str().unwrap(),
            ];
            args.extend(extra);
            assert!(same_code(run_cli(&args), ExitCode::SUCCESS));
        }

        assert_eq!(
            std::fs::read_to_string(&sequential).unwrap(),
            std::fs::read_to_string(&parallel).unwrap()
        );
    }

    #[test]
    fn separate_strategy_file_overrides_config_sections() {
        let dir = tempfile::tempdir().unwrap();
        write_hourly(dir.path(), "BTCUSDT", &[100.0; 24]);
        let ini = write_temp_ini(&config_ini(dir.path()));
        let strategy = write_temp_ini(
            r#"
[strategy]
name = Flat
symbols = BTCUSDT
timeframes = 1h
rules = cross

[rule.cross]
function = ma_crossover
fast = 3
slow = 6
"#,
        );
        let trades = dir.path().join("trades.csv");

        let code = run_cli(&[
            "backtest",
            "--config",
            ini.path().to_str().unwrap(),
            "--strategy",
            strategy.path().to_str().unwrap(),
            "--trades",
            trades.to_str().unwrap(),
        ]);
        assert!(same_code(code, ExitCode::SUCCESS));
        let trades_csv = std::fs::read_to_string(&trades).unwrap();
        assert_eq!(trades_csv.lines().count(), 1);
    }

    #[test]
    fn corrupt_bar_file_exits_with_data_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("BTCUSDT_1h.csv"),
            "timestamp,open,high,low,close,volume\nnot-a-number,1,1,1,1,1\n",
        )
        .unwrap();
        let ini = write_temp_ini(&config_ini(dir.path()));
        let code = run_cli(&["backtest", "--config", ini.path().to_str().unwrap()]);
        assert!(same_code(code, ExitCode::from(3)));
    }
}
