//! CLI tests

use std::process::ExitCode;

use clap::Parser;
use rowsync_core::config::Config;
use rowsync_core::domain::locking::LockStrategy;

use crate::{Cli, Commands, ConfigAction, OutputFormat, RunReport};

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).expect("arguments should parse")
}

fn report(ran_program: bool, exit_code: Option<i32>) -> RunReport {
    RunReport {
        process_id: "nightly".to_string(),
        role: None,
        mode: None,
        strategy: None,
        exit_code,
        ran_program,
    }
}

#[test]
fn test_barrier_takes_program_after_separator() {
    let cli = parse(&[
        "rowsync", "barrier", "nightly", "--batch-size", "3", "--", "echo", "--flag",
    ]);
    match cli.command {
        Commands::Barrier {
            process_id,
            batch_size,
            program,
        } => {
            assert_eq!(process_id, "nightly");
            assert_eq!(batch_size, 3);
            assert_eq!(program, vec!["echo", "--flag"]);
        }
        _ => panic!("expected barrier command"),
    }
}

#[test]
fn test_barrier_requires_batch_size() {
    assert!(Cli::try_parse_from(["rowsync", "barrier", "nightly"]).is_err());
}

#[test]
fn test_lock_defaults() {
    let cli = parse(&["rowsync", "lock", "ledger"]);
    match cli.command {
        Commands::Lock {
            process_id,
            shared,
            strategy,
            hold_ms,
            program,
        } => {
            assert_eq!(process_id, "ledger");
            assert!(!shared);
            assert_eq!(strategy, None);
            assert_eq!(hold_ms, None);
            assert!(program.is_empty());
        }
        _ => panic!("expected lock command"),
    }
}

#[test]
fn test_lock_strategy_and_mode() {
    let cli = parse(&[
        "rowsync", "lock", "ledger", "--shared", "--strategy", "advisory", "--hold-ms", "250",
    ]);
    match cli.command {
        Commands::Lock {
            shared,
            strategy,
            hold_ms,
            ..
        } => {
            assert!(shared);
            assert_eq!(strategy, Some(LockStrategy::Advisory));
            assert_eq!(hold_ms, Some(250));
        }
        _ => panic!("expected lock command"),
    }
}

#[test]
fn test_unknown_strategy_is_rejected() {
    assert!(Cli::try_parse_from(["rowsync", "lock", "ledger", "--strategy", "flock"]).is_err());
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = parse(&[
        "rowsync",
        "status",
        "--format",
        "json",
        "--quiet",
        "--database-url",
        "postgres://db/rowsync",
    ]);
    assert!(matches!(cli.command, Commands::Status));
    assert_eq!(cli.format, OutputFormat::Json);
    assert!(cli.quiet);
    assert_eq!(cli.database_url.as_deref(), Some("postgres://db/rowsync"));
}

#[test]
fn test_config_set_parses_key_and_value() {
    let cli = parse(&["rowsync", "config", "set", "barrier.max_attempts", "5"]);
    match cli.command {
        Commands::Config {
            action: ConfigAction::Set { key, value },
        } => {
            assert_eq!(key, "barrier.max_attempts");
            assert_eq!(value, "5");
        }
        _ => panic!("expected config set"),
    }
}

#[test]
fn test_report_exit_code_follows_program() {
    assert_eq!(report(false, None).exit_code(), ExitCode::SUCCESS);
    assert_eq!(report(true, Some(0)).exit_code(), ExitCode::SUCCESS);
    assert_eq!(report(true, Some(3)).exit_code(), ExitCode::from(3));
    assert_eq!(report(true, None).exit_code(), ExitCode::FAILURE);
}

#[test]
fn test_report_json_omits_unset_fields() {
    let json = serde_json::to_value(report(true, Some(0))).unwrap();
    assert_eq!(json["process_id"], "nightly");
    assert_eq!(json["exit_code"], 0);
    assert!(json.get("role").is_none());
    assert!(json.get("mode").is_none());
}

#[test]
fn test_config_set_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = Config::load_from(&path).unwrap();
    config.set("lock.strategy", "advisory").unwrap();
    config.set("barrier.max_rounds", "4").unwrap();
    config.save_to(&path).unwrap();

    let reloaded = Config::load_from(&path).unwrap();
    assert_eq!(reloaded.lock.strategy, LockStrategy::Advisory);
    assert_eq!(reloaded.get("barrier.max_rounds").unwrap(), "4");
}
