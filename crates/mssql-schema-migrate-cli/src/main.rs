//! mssql-schema-migrate CLI - staged SQL Server schema ownership migration.

use clap::{Args, Parser, Subcommand};
use mssql_schema_migrate::{
    Config, CounterpartyUpdate, MigrateError, MigrationSession, NewSession, Orchestrator, Stage,
    StageOverrides, StageReport, StageStatus,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for a stage that completed with a failed validation.
const EXIT_STAGE_FAILED: u8 = 5;
/// Exit code for a stage that raised an error.
const EXIT_STAGE_ERRORED: u8 = 6;

#[derive(Parser)]
#[command(name = "mssql-schema-migrate")]
#[command(about = "Staged SQL Server schema ownership migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and inspect migration sessions
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// List or run pipeline stages
    Stage {
        #[command(subcommand)]
        action: StageCommand,
    },

    /// Save, recover or delete operator progress snapshots
    Progress {
        #[command(subcommand)]
        action: ProgressCommand,
    },

    /// List online user databases on a server
    Databases {
        /// Server name (host, host,port or host:port)
        #[arg(long)]
        server: String,
    },

    /// Test the session store and a database connection
    HealthCheck {
        #[arg(long)]
        server: String,

        /// Database to connect to [default: master]
        #[arg(long)]
        database: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create the session and artifact tree for a database (idempotent)
    Create {
        #[arg(long)]
        database: String,

        /// Server hosting the database
        #[arg(long)]
        server: String,

        /// Root folder for the artifact tree
        #[arg(long)]
        folder_root: PathBuf,

        /// Legacy owner schema being retired
        #[arg(long)]
        schema_from: String,

        /// Schema receiving the objects
        #[arg(long)]
        schema_to: String,

        #[command(flatten)]
        counterparty: CounterpartyArgs,
    },

    /// Show a session
    Show {
        #[arg(long)]
        database: String,
    },

    /// Update the counterparty used by stages 10 and 11
    SetCounterparty {
        #[arg(long)]
        database: String,

        #[command(flatten)]
        counterparty: CounterpartyArgs,
    },

    /// Clear an in-progress flag left behind by a killed process
    Unlock {
        #[arg(long)]
        database: String,
    },
}

#[derive(Args, Clone, Default)]
struct CounterpartyArgs {
    /// Server holding the legacy copy of the tables
    #[arg(long)]
    counterparty_server: Option<String>,

    /// Database holding the legacy copy of the tables
    #[arg(long)]
    counterparty_database: Option<String>,

    /// Table manifest, one table name per line
    #[arg(long)]
    manifest: Option<PathBuf>,
}

impl CounterpartyArgs {
    fn into_overrides(self) -> StageOverrides {
        StageOverrides {
            counterparty_server: self.counterparty_server,
            counterparty_database: self.counterparty_database,
            table_manifest_path: self.manifest,
        }
    }

    fn into_update(self) -> CounterpartyUpdate {
        CounterpartyUpdate {
            server: self.counterparty_server,
            database: self.counterparty_database,
            table_manifest_path: self.manifest,
        }
    }
}

#[derive(Subcommand)]
enum StageCommand {
    /// List the pipeline stages
    List,

    /// Run one stage for one database
    Run {
        /// Stage number, 1-16
        #[arg(long)]
        stage: u8,

        #[arg(long)]
        database: String,

        #[command(flatten)]
        counterparty: CounterpartyArgs,
    },
}

#[derive(Subcommand)]
enum ProgressCommand {
    /// Save a JSON progress snapshot
    Save {
        #[arg(long)]
        database: String,

        /// JSON file holding the snapshot
        #[arg(long)]
        file: PathBuf,
    },

    /// Print the saved progress snapshot
    Recover {
        #[arg(long)]
        database: String,
    },

    /// Delete the saved progress snapshot
    Delete {
        #[arg(long)]
        database: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    // Stage listing needs no configuration
    if let Commands::Stage {
        action: StageCommand::List,
    } = cli.command
    {
        print_stages(cli.output_json)?;
        return Ok(ExitCode::SUCCESS);
    }

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    if !cli.config.exists() {
        return Err(MigrateError::Config(format!(
            "Config file not found: {}",
            cli.config.display()
        )));
    }
    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let orchestrator = Orchestrator::from_config(config).await?;

    match cli.command {
        Commands::Stage {
            action: StageCommand::List,
        } => unreachable!(), // Handled above

        Commands::Session { action } => session_command(&orchestrator, action, cli.output_json).await,

        Commands::Stage {
            action:
                StageCommand::Run {
                    stage,
                    database,
                    counterparty,
                },
        } => {
            let stage = Stage::from_number(stage)?;
            let cancel_token = setup_signal_handler().await?;
            let report = orchestrator
                .run_stage(stage, &database, &counterparty.into_overrides(), &cancel_token)
                .await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            Ok(match report.status {
                StageStatus::Passed => ExitCode::SUCCESS,
                StageStatus::Failed => ExitCode::from(EXIT_STAGE_FAILED),
                StageStatus::Errored => ExitCode::from(EXIT_STAGE_ERRORED),
            })
        }

        Commands::Progress { action } => {
            progress_command(&orchestrator, action, cli.output_json).await
        }

        Commands::Databases { server } => {
            let catalog = orchestrator.connector().catalog(&server, "master").await?;
            let databases = catalog.list_databases().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&databases)?);
            } else {
                for db in &databases {
                    println!("{}", db);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::HealthCheck { server, database } => {
            let database = database.unwrap_or_else(|| "master".to_string());
            let started = Instant::now();
            let result = match orchestrator.connector().catalog(&server, &database).await {
                Ok(catalog) => catalog.ping().await,
                Err(e) => Err(e),
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let healthy = result.is_ok();
            let error = result.err().map(|e| e.to_string());

            if cli.output_json {
                let output = serde_json::json!({
                    "session_store": orchestrator.sessions().backend_type(),
                    "server": server,
                    "database": database,
                    "connected": healthy,
                    "latency_ms": latency_ms,
                    "error": error,
                    "healthy": healthy,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("Health Check Results:");
                println!("  Session store: {} (OK)", orchestrator.sessions().backend_type());
                println!(
                    "  {}/{}: {} ({}ms)",
                    server,
                    database,
                    if healthy { "OK" } else { "FAILED" },
                    latency_ms
                );
                if let Some(ref err) = error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !healthy {
                return Err(MigrateError::Config("Health check failed".to_string()));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn session_command(
    orchestrator: &Orchestrator,
    action: SessionCommand,
    output_json: bool,
) -> Result<ExitCode, MigrateError> {
    let session = match action {
        SessionCommand::Create {
            database,
            server,
            folder_root,
            schema_from,
            schema_to,
            counterparty,
        } => {
            orchestrator
                .ensure_session(NewSession {
                    database_name: database,
                    source_server: server,
                    folder_root,
                    counterparty_server: counterparty.counterparty_server,
                    counterparty_database: counterparty.counterparty_database,
                    table_manifest_path: counterparty.manifest,
                    schema_from,
                    schema_to,
                })
                .await?
        }
        SessionCommand::Show { database } => orchestrator.session(&database).await?,
        SessionCommand::SetCounterparty {
            database,
            counterparty,
        } => {
            let update = counterparty.into_update();
            if update.is_empty() {
                return Err(MigrateError::Config(
                    "nothing to update: pass --counterparty-server, --counterparty-database or --manifest"
                        .to_string(),
                ));
            }
            orchestrator
                .sessions()
                .update_counterparty(&database, &update)
                .await?
        }
        SessionCommand::Unlock { database } => {
            // Cleared before loading so an unreadable lock can still be removed.
            orchestrator.sessions().end_stage(&database).await?;
            info!("Cleared in-progress flag on {}", database);
            orchestrator.session(&database).await?
        }
    };

    if output_json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        print_session(&session);
    }
    Ok(ExitCode::SUCCESS)
}

async fn progress_command(
    orchestrator: &Orchestrator,
    action: ProgressCommand,
    output_json: bool,
) -> Result<ExitCode, MigrateError> {
    let store = orchestrator.sessions();
    match action {
        ProgressCommand::Save { database, file } => {
            let content = std::fs::read_to_string(&file)?;
            let data: serde_json::Value = serde_json::from_str(&content)?;
            store.save_progress(&database, &data).await?;
            if !output_json {
                println!("Progress saved for {}", database);
            }
        }
        ProgressCommand::Recover { database } => {
            let snapshot = store.recover_progress(&database).await?;
            match (output_json, snapshot) {
                (true, snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                (false, Some(snapshot)) => {
                    println!("Progress for {} (saved {}):", database, snapshot.saved_at);
                    println!("{}", serde_json::to_string_pretty(&snapshot.data)?);
                }
                (false, None) => println!("No saved progress for {}", database),
            }
        }
        ProgressCommand::Delete { database } => {
            let existed = store.delete_progress(&database).await?;
            if output_json {
                println!("{}", serde_json::json!({ "deleted": existed }));
            } else if existed {
                println!("Progress deleted for {}", database);
            } else {
                println!("No saved progress for {}", database);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_stages(output_json: bool) -> Result<(), MigrateError> {
    if output_json {
        let stages: Vec<serde_json::Value> = Stage::ALL
            .iter()
            .map(|s| {
                serde_json::json!({
                    "stage": s.number(),
                    "name": s.name(),
                    "description": s.description(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&stages)?);
    } else {
        for stage in Stage::ALL {
            println!("{:>2}  {:<20} {}", stage.number(), stage.name(), stage.description());
        }
    }
    Ok(())
}

fn print_session(session: &MigrationSession) {
    println!("Session {}", session.id);
    println!("  Database: {}", session.database_name);
    println!("  Server: {}", session.source_server);
    println!("  Schemas: {} -> {}", session.schema_from, session.schema_to);
    println!("  Folder: {}", session.paths.base.display());
    if let Some(ref server) = session.counterparty_server {
        println!("  Counterparty server: {}", server);
    }
    if let Some(ref database) = session.counterparty_database {
        println!("  Counterparty database: {}", database);
    }
    if let Some(ref manifest) = session.table_manifest_path {
        println!("  Table manifest: {}", manifest.display());
    }
    if let Some(stage) = session.active_stage {
        println!("  Running: stage {}", stage);
    }
}

fn print_report(report: &StageReport) {
    println!(
        "\nStage {} ({}) {} for {}",
        report.stage, report.stage_name, report.status, report.database
    );
    println!("  {}", report.message);
    println!("  Time taken: {}", report.elapsed);
    for run in &report.tool_runs {
        println!(
            "  {} attempt {}: exit {:?}{} ({}ms)",
            run.script,
            run.attempt,
            run.exit_code,
            if run.stderr_written { ", stderr" } else { "" },
            run.elapsed_ms
        );
    }
    for line in &report.details {
        println!("    {}", line);
    }
    println!("  Log: {}", report.log_file.display());
    println!("  Validation: {}", report.validation_file.display());
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for stage cancellation.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping the running tool...");
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping the running tool...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping the running tool...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
