//! Stage orchestrator - runs one pipeline stage for one database.
//!
//! Every stage follows the same contract: require the session, claim its
//! in-progress flag, drive the external tool, validate the tool's effect
//! against the live catalog, and write the outcome to the stage's timestamped
//! log and validation files.

mod stages;

use crate::artifacts::{append_text, STAGE_COUNT};
use crate::catalog::{Connector, MssqlConnector};
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::state::{
    ensure_session, open_session_store, require_session, CounterpartyUpdate, MigrationSession,
    NewSession, SessionStore, StageClaim,
};
use crate::tool::{ProcessToolRunner, ToolRunSummary, ToolRunner};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stages::StageContext;

/// The sixteen pipeline stages, in intended execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Stage {
    SchemaBoundViews,
    CleanupSchema,
    TransferSchema,
    ChildObjects,
    ExportScripts,
    RewriteScripts,
    ApplyScripts,
    StageForeignKeys,
    DropForeignKeyStaging,
    CompareTables,
    MoveRows,
    ForeignKeys,
    ObjectLists,
    ExportObjects,
    RewriteObjects,
    ApplyObjects,
}

impl Stage {
    pub const ALL: [Stage; STAGE_COUNT as usize] = [
        Stage::SchemaBoundViews,
        Stage::CleanupSchema,
        Stage::TransferSchema,
        Stage::ChildObjects,
        Stage::ExportScripts,
        Stage::RewriteScripts,
        Stage::ApplyScripts,
        Stage::StageForeignKeys,
        Stage::DropForeignKeyStaging,
        Stage::CompareTables,
        Stage::MoveRows,
        Stage::ForeignKeys,
        Stage::ObjectLists,
        Stage::ExportObjects,
        Stage::RewriteObjects,
        Stage::ApplyObjects,
    ];

    /// Stage id, 1-16.
    pub fn number(self) -> u8 {
        self as u8 + 1
    }

    pub fn from_number(number: u8) -> Result<Self> {
        match number {
            1..=STAGE_COUNT => Ok(Self::ALL[number as usize - 1]),
            _ => Err(MigrateError::UnknownStage(number)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::SchemaBoundViews => "schema-bound-views",
            Stage::CleanupSchema => "cleanup-schema",
            Stage::TransferSchema => "transfer-schema",
            Stage::ChildObjects => "child-objects",
            Stage::ExportScripts => "export-scripts",
            Stage::RewriteScripts => "rewrite-scripts",
            Stage::ApplyScripts => "apply-scripts",
            Stage::StageForeignKeys => "stage-foreign-keys",
            Stage::DropForeignKeyStaging => "drop-fk-staging",
            Stage::CompareTables => "compare-tables",
            Stage::MoveRows => "move-rows",
            Stage::ForeignKeys => "foreign-keys",
            Stage::ObjectLists => "object-lists",
            Stage::ExportObjects => "export-objects",
            Stage::RewriteObjects => "rewrite-objects",
            Stage::ApplyObjects => "apply-objects",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Stage::SchemaBoundViews => "Remove schema binding from views in the legacy schema",
            Stage::CleanupSchema => "Empty the cleanup schema, re-running until no objects remain",
            Stage::TransferSchema => "Transfer objects and user-defined types to the new schema",
            Stage::ChildObjects => "Move dependent child objects out of the legacy schema",
            Stage::ExportScripts => "Export programmable object definitions to script files",
            Stage::RewriteScripts => "Rewrite exported definitions for the new schema",
            Stage::ApplyScripts => "Apply rewritten definitions to the database",
            Stage::StageForeignKeys => "Save foreign keys into the staging table and drop them",
            Stage::DropForeignKeyStaging => "Drop the foreign-key staging table",
            Stage::CompareTables => "Copy table definitions from the counterparty and compare names",
            Stage::MoveRows => "Move table rows from the counterparty database",
            Stage::ForeignKeys => "Recreate foreign keys",
            Stage::ObjectLists => "Produce function, view and procedure lists",
            Stage::ExportObjects => "Export listed objects",
            Stage::RewriteObjects => "Rewrite exported objects for the new schema",
            Stage::ApplyObjects => "Apply exported objects to the database",
        }
    }

    /// Whether the stage reads the counterparty server, database and manifest.
    pub fn uses_counterparty(self) -> bool {
        matches!(self, Stage::CompareTables | Stage::MoveRows)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {} ({})", self.number(), self.name())
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        stage.number()
    }
}

impl TryFrom<u8> for Stage {
    type Error = MigrateError;

    fn try_from(number: u8) -> Result<Self> {
        Stage::from_number(number)
    }
}

/// Terminal state of one stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Passed,
    /// The tool reported errors or validation did not hold.
    Failed,
    /// The stage raised an error before reaching a verdict.
    Errored,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageStatus::Passed => "passed",
            StageStatus::Failed => "failed",
            StageStatus::Errored => "errored",
        };
        write!(f, "{}", s)
    }
}

/// Wall-clock duration broken down the way stage logs print it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Elapsed {
    pub minutes: u64,
    pub seconds: u64,
    pub milliseconds: u64,
    pub total_seconds: f64,
}

impl From<Duration> for Elapsed {
    fn from(d: Duration) -> Self {
        let secs = d.as_secs();
        Self {
            minutes: secs / 60,
            seconds: secs % 60,
            milliseconds: u64::from(d.subsec_millis()),
            total_seconds: d.as_secs_f64(),
        }
    }
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} minutes {} seconds {} ms",
            self.minutes, self.seconds, self.milliseconds
        )
    }
}

/// Result of a stage invocation returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: u8,
    pub stage_name: String,
    pub database: String,
    pub status: StageStatus,
    pub message: String,
    pub log_file: PathBuf,
    pub validation_file: PathBuf,
    pub elapsed: Elapsed,
    pub tool_runs: Vec<ToolRunSummary>,
    pub details: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl StageReport {
    pub fn passed(&self) -> bool {
        self.status == StageStatus::Passed
    }
}

/// Verdict produced by a stage body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StageOutcome {
    pub status: StageStatus,
    pub message: String,
}

impl StageOutcome {
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Passed,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            message: message.into(),
        }
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Errored,
            message: message.into(),
        }
    }

    /// Pass or fail on a boolean check.
    pub fn check(ok: bool, passed: impl Into<String>, failed: impl Into<String>) -> Self {
        if ok {
            Self::passed(passed)
        } else {
            Self::failed(failed)
        }
    }
}

/// Per-invocation counterparty overrides for stages 10 and 11.
#[derive(Debug, Clone, Default)]
pub struct StageOverrides {
    pub counterparty_server: Option<String>,
    pub counterparty_database: Option<String>,
    pub table_manifest_path: Option<PathBuf>,
}

impl StageOverrides {
    fn to_update(&self) -> CounterpartyUpdate {
        CounterpartyUpdate {
            server: self.counterparty_server.clone(),
            database: self.counterparty_database.clone(),
            table_manifest_path: self.table_manifest_path.clone(),
        }
    }
}

/// Pipeline orchestrator.
pub struct Orchestrator {
    config: Config,
    sessions: Arc<dyn SessionStore>,
    connector: Arc<dyn Connector>,
    tools: Arc<dyn ToolRunner>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        sessions: Arc<dyn SessionStore>,
        connector: Arc<dyn Connector>,
        tools: Arc<dyn ToolRunner>,
    ) -> Self {
        Self {
            config,
            sessions,
            connector,
            tools,
        }
    }

    /// Wire up the configured session store, SQL Server connector and
    /// external tool runner.
    pub async fn from_config(config: Config) -> Result<Self> {
        let sessions = open_session_store(&config).await?;
        let connector: Arc<dyn Connector> =
            Arc::new(MssqlConnector::new(config.connection.clone()));
        let tools: Arc<dyn ToolRunner> = Arc::new(ProcessToolRunner::new(&config.tool));
        Ok(Self::new(config, sessions, connector, tools))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub async fn ensure_session(&self, request: NewSession) -> Result<MigrationSession> {
        ensure_session(self.sessions.as_ref(), request).await
    }

    pub async fn session(&self, database: &str) -> Result<MigrationSession> {
        require_session(self.sessions.as_ref(), database).await
    }

    /// Run one stage for one database.
    ///
    /// Returns `SessionNotFound`, `StageInProgress` and `Cancelled` as errors.
    /// Every other failure inside the stage is folded into an `errored` report.
    pub async fn run_stage(
        &self,
        stage: Stage,
        database: &str,
        overrides: &StageOverrides,
        cancel: &CancellationToken,
    ) -> Result<StageReport> {
        let mut session = self.session(database).await?;
        let number = stage.number();

        match self.sessions.try_begin_stage(database, number).await? {
            StageClaim::Acquired => {}
            StageClaim::Busy(active) => {
                return Err(MigrateError::StageInProgress {
                    database: database.to_string(),
                    stage: active,
                });
            }
        }

        info!("Starting {} for {}", stage, database);
        let result = self
            .claimed_run(stage, &mut session, overrides, cancel)
            .await;

        if let Err(e) = self.sessions.end_stage(database).await {
            warn!("Failed to clear in-progress flag for {}: {}", database, e);
        }

        if let Ok(report) = &result {
            info!(
                "{} for {} {} in {}: {}",
                stage, database, report.status, report.elapsed, report.message
            );
        }
        result
    }

    async fn claimed_run(
        &self,
        stage: Stage,
        session: &mut MigrationSession,
        overrides: &StageOverrides,
        cancel: &CancellationToken,
    ) -> Result<StageReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let local = Local::now();
        let number = stage.number();
        let database = session.database_name.clone();

        session.paths.ensure()?;
        let log_file = session.paths.stage_log_file(&database, number, local)?;
        let validation_file = session.paths.stage_report_file(&database, number, local)?;

        let update = overrides.to_update();
        if !update.is_empty() {
            if stage.uses_counterparty() {
                *session = self
                    .sessions
                    .update_counterparty(&database, &update)
                    .await?;
            } else {
                warn!("Counterparty overrides ignored by {}", stage);
            }
        }

        let mut ctx = StageContext {
            stage,
            session: session.clone(),
            config: &self.config,
            connector: self.connector.as_ref(),
            tools: self.tools.as_ref(),
            cancel,
            log_file,
            validation_file,
            tool_runs: Vec::new(),
            details: Vec::new(),
        };

        let outcome = match stages::run(&mut ctx).await {
            Ok(outcome) => outcome,
            Err(MigrateError::Cancelled) => return Err(MigrateError::Cancelled),
            Err(e) => {
                error!("{} for {} errored: {}", stage, database, e);
                let text = format!("\nError:\n{}\n", e.format_detailed());
                if let Err(log_err) = append_text(&ctx.log_file, &text) {
                    warn!("Could not write {}: {}", ctx.log_file.display(), log_err);
                }
                StageOutcome::errored(e.to_string())
            }
        };

        Ok(StageReport {
            stage: number,
            stage_name: stage.name().to_string(),
            database,
            status: outcome.status,
            message: outcome.message,
            log_file: ctx.log_file,
            validation_file: ctx.validation_file,
            elapsed: clock.elapsed().into(),
            tool_runs: ctx.tool_runs,
            details: ctx.details,
            started_at,
        })
    }
}
