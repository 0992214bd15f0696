//! rowsync CLI - barrier and named locks from the shell

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rowsync_core::config::Config;
use rowsync_core::domain::barrier::{BarrierCoordinator, Role};
use rowsync_core::domain::locking::LockStrategy;
use rowsync_core::storage::{LockMode, PgStore, Store};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
mod main_tests;

#[derive(Parser)]
#[command(name = "rowsync")]
#[command(author, version, about = "Barrier and named locks over PostgreSQL", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database URL (overrides config file and environment)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Check connectivity and schema version
    Status,

    /// Wait until a full batch of callers arrives, then run a program
    Barrier {
        /// Process id shared by every caller of the barrier
        process_id: String,
        /// Callers that must arrive before anyone proceeds
        #[arg(short, long)]
        batch_size: usize,
        /// Program and arguments to run once the barrier passes
        #[arg(last = true)]
        program: Vec<String>,
    },

    /// Run a program while holding a named lock
    Lock {
        /// Lock name
        process_id: String,
        /// Take the lock in shared mode
        #[arg(long)]
        shared: bool,
        /// Lock strategy (row or advisory); defaults to lock.strategy
        #[arg(long)]
        strategy: Option<LockStrategy>,
        /// Hold the lock for this many milliseconds when no program is given
        #[arg(long, value_name = "MS")]
        hold_ms: Option<u64>,
        /// Program and arguments to run under the lock
        #[arg(last = true)]
        program: Vec<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// Config value
        value: String,
    },
    /// List all config values
    List,
    /// Show config file path
    Path,
}

/// Outcome of a barrier or lock run, as printed
#[derive(Debug, Serialize)]
struct RunReport {
    process_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<LockMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strategy: Option<LockStrategy>,
    /// Exit code of the program; absent when nothing ran or it was killed
    exit_code: Option<i32>,
    ran_program: bool,
}

impl RunReport {
    fn exit_code(&self) -> ExitCode {
        match (self.ran_program, self.exit_code) {
            (false, _) | (true, Some(0)) => ExitCode::SUCCESS,
            (true, Some(code)) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            (true, None) => ExitCode::FAILURE,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so JSON output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("rowsync=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => Ok(code),
        Err(err) => match err.downcast_ref::<rowsync_core::Error>() {
            Some(core) => {
                eprintln!("error[{}]: {}", core.code(), core);
                if let Some(hint) = core.suggestion() {
                    eprintln!("  hint: {}", hint);
                }
                Ok(ExitCode::FAILURE)
            }
            None => Err(err),
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let format = cli.format;
    let quiet = cli.quiet;
    let database_url = cli.database_url;

    match cli.command {
        Commands::Migrate => {
            let config = load_config(database_url.as_deref())?;
            cmd_migrate(&config, format, quiet).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            let config = load_config(database_url.as_deref())?;
            cmd_status(&config, format, quiet).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Barrier {
            process_id,
            batch_size,
            program,
        } => {
            let config = load_config(database_url.as_deref())?;
            let report = cmd_barrier(&config, &process_id, batch_size, &program).await?;
            print_report(&report, format, quiet)?;
            Ok(report.exit_code())
        }

        Commands::Lock {
            process_id,
            shared,
            strategy,
            hold_ms,
            program,
        } => {
            let config = load_config(database_url.as_deref())?;
            let strategy = strategy.unwrap_or(config.lock.strategy);
            let mode = if shared {
                LockMode::Shared
            } else {
                LockMode::Exclusive
            };
            let hold = hold_ms.map(Duration::from_millis);
            let report = cmd_lock(&config, &process_id, mode, strategy, hold, &program).await?;
            print_report(&report, format, quiet)?;
            Ok(report.exit_code())
        }

        Commands::Config { action } => {
            cmd_config(action, format, quiet)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Load the config file, letting `--database-url` win over everything
fn load_config(database_url: Option<&str>) -> anyhow::Result<Config> {
    let mut config = Config::load()?;
    if let Some(url) = database_url {
        config.database.url = url.to_string();
    }
    Ok(config)
}

async fn connect(config: &Config, allow_migrate: bool) -> anyhow::Result<PgStore> {
    let mut database = config.database.clone();
    if !allow_migrate {
        database = database.no_migrate();
    }
    let store = PgStore::connect(database)
        .await
        .with_context(|| format!("Failed to connect to {}", redacted_url(config)))?;
    Ok(store)
}

fn redacted_url(config: &Config) -> String {
    rowsync_core::config::redact_url(&config.database.url)
}

async fn cmd_migrate(config: &Config, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let store = connect(config, false).await?;
    store.migrate().await?;
    let status = store.migration_status().await?;
    store.close().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Text => {
            if !quiet {
                println!("Schema at version {}", status.current_version);
            }
        }
    }
    Ok(())
}

async fn cmd_status(config: &Config, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let store = connect(config, false).await?;
    store.health_check().await?;
    let status = store.migration_status().await?;
    store.close().await;

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "database": redacted_url(config),
                "healthy": true,
                "migrations": status,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            if quiet {
                return Ok(());
            }
            println!("[OK] Database: {}", redacted_url(config));
            if status.needs_migration {
                println!(
                    "[!!] Schema: version {} of {}",
                    status.current_version, status.target_version
                );
                println!("     Run 'rowsync migrate'");
            } else {
                println!("[OK] Schema: version {}", status.current_version);
            }
        }
    }
    Ok(())
}

async fn cmd_barrier(
    config: &Config,
    process_id: &str,
    batch_size: usize,
    program: &[String],
) -> anyhow::Result<RunReport> {
    let store: Arc<dyn Store> = Arc::new(connect(config, true).await?);
    let coordinator = BarrierCoordinator::new(store, config.barrier.clone());

    info!(process_id = %process_id, batch_size = batch_size, "Waiting at barrier");
    let (role, exit_code) = coordinator
        .run_barrier_with_role(process_id, batch_size, |role| async move {
            let exit_code = run_program(program).await?;
            Ok::<_, rowsync_core::Error>((role, exit_code))
        })
        .await?;

    Ok(RunReport {
        process_id: process_id.to_string(),
        role: Some(role),
        mode: None,
        strategy: None,
        exit_code,
        ran_program: !program.is_empty(),
    })
}

async fn cmd_lock(
    config: &Config,
    process_id: &str,
    mode: LockMode,
    strategy: LockStrategy,
    hold: Option<Duration>,
    program: &[String],
) -> anyhow::Result<RunReport> {
    let store: Arc<dyn Store> = Arc::new(connect(config, true).await?);
    let lock = strategy.build(store.clone());

    let mut tx = store.begin().await?;
    lock.acquire(tx.as_mut(), process_id, mode).await?;
    info!(process_id = %process_id, mode = %mode, strategy = %strategy, "Holding lock");

    let exit_code = if program.is_empty() {
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }
        None
    } else {
        run_program(program).await?
    };

    tx.commit().await?;
    debug!(process_id = %process_id, "Released lock");

    Ok(RunReport {
        process_id: process_id.to_string(),
        role: None,
        mode: Some(mode),
        strategy: Some(strategy),
        exit_code,
        ran_program: !program.is_empty(),
    })
}

/// Run `program` to completion; `None` when empty or killed by a signal
async fn run_program(program: &[String]) -> rowsync_core::Result<Option<i32>> {
    let Some((name, args)) = program.split_first() else {
        return Ok(None);
    };

    debug!(program = %name, "Running program");
    let status = Command::new(name).args(args).status().await?;
    Ok(status.code())
}

fn print_report(report: &RunReport, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            if quiet {
                return Ok(());
            }
            let mut line = format!("Process '{}'", report.process_id);
            if let Some(role) = report.role {
                line.push_str(&format!(": passed barrier as {}", role));
            }
            if let (Some(mode), Some(strategy)) = (report.mode, report.strategy) {
                line.push_str(&format!(": held {} {} lock", mode, strategy));
            }
            println!("{}", line);
            if report.ran_program {
                match report.exit_code {
                    Some(code) => println!("Program exited with status {}", code),
                    None => println!("Program terminated by signal"),
                }
            }
        }
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            // Read the file alone so environment overrides are not persisted
            let path = Config::config_path()?;
            let mut config = Config::load_from(&path)?;
            config.set(&key, &value)?;
            config.save_to(&path)?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            let items = config.list()?;
            match format {
                OutputFormat::Json => {
                    let map: serde_json::Map<String, serde_json::Value> = items
                        .into_iter()
                        .map(|(key, value)| (key, serde_json::Value::String(value)))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
                OutputFormat::Text => {
                    for (key, value) in items {
                        println!("{} = {}", key, value);
                    }
                }
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
