//! Stage bodies.
//!
//! Each stage builds its tool invocations, runs them through the shared
//! [`StageContext`], and returns a verdict. Errors returned from here become
//! `errored` reports in the orchestrator.

use super::{Stage, StageOutcome};
use crate::artifacts::{append_text, count_files, count_sql_files};
use crate::catalog::{transfer_user_types, CatalogProbe, Connector};
use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::manifest::{compare_table_sets, discover_object_manifests, read_table_manifest, ManifestTable};
use crate::rewrite::{rewrite_schema, RewriteOptions};
use crate::router::route_cross_db_files;
use crate::state::MigrationSession;
use crate::tool::{parse_total_files_created, ToolInvocation, ToolOutput, ToolRunSummary, ToolRunner};
use crate::transfer::{move_table, MoveOptions, RowMoveCheckpoint, CHECKPOINT_FILE};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a stage body needs, plus what it accumulates for the report.
pub(super) struct StageContext<'a> {
    pub stage: Stage,
    pub session: MigrationSession,
    pub config: &'a Config,
    pub connector: &'a dyn Connector,
    pub tools: &'a dyn ToolRunner,
    pub cancel: &'a CancellationToken,
    pub log_file: PathBuf,
    pub validation_file: PathBuf,
    pub tool_runs: Vec<ToolRunSummary>,
    pub details: Vec<String>,
}

/// Result of one tool run after the failure policy is applied.
pub(super) enum ToolCall {
    Completed(ToolOutput),
    Failed(StageOutcome),
}

/// Unwrap a completed tool call or return its failure from the stage.
macro_rules! completed {
    ($call:expr) => {
        match $call {
            ToolCall::Completed(output) => output,
            ToolCall::Failed(outcome) => return Ok(outcome),
        }
    };
}

/// Same as `completed!` for helpers that themselves return a `ToolCall`.
macro_rules! completed_or_return {
    ($call:expr) => {
        match $call {
            ToolCall::Completed(output) => output,
            failed @ ToolCall::Failed(_) => return Ok(failed),
        }
    };
}

impl<'a> StageContext<'a> {
    fn server(&self) -> &str {
        &self.session.source_server
    }

    fn database(&self) -> &str {
        &self.session.database_name
    }

    fn error_folder(&self) -> Result<PathBuf> {
        Ok(self
            .session
            .paths
            .stage_error_folder(self.stage.number())?
            .to_path_buf())
    }

    async fn catalog(&self) -> Result<Arc<dyn CatalogProbe>> {
        self.connector
            .catalog(&self.session.source_server, &self.session.database_name)
            .await
    }

    /// `script -serverName S -databaseName D`.
    fn invocation(&self, script: &str) -> ToolInvocation {
        ToolInvocation::new(script)
            .arg("-serverName", self.server())
            .arg("-databaseName", self.database())
    }

    fn log(&self, text: &str) -> Result<()> {
        append_text(&self.log_file, text)
    }

    fn validate(&mut self, text: &str) -> Result<()> {
        self.details.extend(text.lines().filter(|l| !l.trim().is_empty()).map(String::from));
        append_text(&self.validation_file, text)
    }

    fn rewrite_options(&self) -> RewriteOptions {
        RewriteOptions::new(
            &self.session.schema_from,
            &format!("[{}]", self.session.schema_to),
            &self.config.pipeline.skip_file_prefix,
        )
    }

    /// Run the tool once without judging its output.
    ///
    /// A launch failure or timeout comes back as a failed outcome.
    async fn run_tool(&mut self, invocation: &ToolInvocation, attempt: u32) -> Result<ToolCall> {
        if self.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        match self.tools.run(invocation, self.cancel).await {
            Ok(output) => {
                self.tool_runs
                    .push(ToolRunSummary::new(invocation, attempt, &output));
                Ok(ToolCall::Completed(output))
            }
            Err(e @ (MigrateError::ToolLaunch { .. } | MigrateError::ToolTimeout { .. })) => {
                warn!("{}", e);
                self.log(&format!("\nTool Error ({}):\n{}\n", invocation.script, e))?;
                Ok(ToolCall::Failed(StageOutcome::failed(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    /// Run the tool once and apply the failure policy: stderr always fails,
    /// a non-zero exit fails when configured.
    async fn invoke(&mut self, invocation: ToolInvocation) -> Result<ToolCall> {
        let output = completed_or_return!(self.run_tool(&invocation, 1).await?);
        if output.has_stderr() {
            self.log(&format!("\nPowerShell Errors:\n{}", output.stderr))?;
            let failure = MigrateError::ToolInvocationFailed {
                script: invocation.script.clone(),
                stderr: first_line(&output.stderr),
            };
            return Ok(ToolCall::Failed(StageOutcome::failed(failure.to_string())));
        }
        if self.config.tool.fail_on_nonzero_exit && output.exited_nonzero() {
            self.log(&format!(
                "\n{} exited with code {:?}\n",
                invocation.script, output.exit_code
            ))?;
            let failure = MigrateError::ToolInvocationFailed {
                script: invocation.script.clone(),
                stderr: format!("exit code {:?}", output.exit_code),
            };
            return Ok(ToolCall::Failed(StageOutcome::failed(failure.to_string())));
        }
        debug!("{} stdout:\n{}", invocation.script, output.stdout);
        Ok(ToolCall::Completed(output))
    }

    /// Run the tool `attempts` times regardless of outcome, logging every
    /// attempt. Only a launch failure stops the loop.
    async fn invoke_repeatedly(
        &mut self,
        invocation: ToolInvocation,
        first_attempt: u32,
        attempts: u32,
    ) -> Result<ToolCall> {
        let mut last = ToolOutput::default();
        for attempt in first_attempt..first_attempt + attempts {
            info!("Attempt {} of {} for {}", attempt, first_attempt + attempts - 1, invocation.script);
            last = completed_or_return!(self.run_tool(&invocation, attempt).await?);
            self.log(&format!(
                "\nAttempt {} Output:\nstdout:\n{}\nstderr:\n{}\n",
                attempt, last.stdout, last.stderr
            ))?;
        }
        Ok(ToolCall::Completed(last))
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Dispatch to the stage body.
pub(super) async fn run(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    match ctx.stage {
        Stage::SchemaBoundViews => schema_bound_views(ctx).await,
        Stage::CleanupSchema => cleanup_schema(ctx).await,
        Stage::TransferSchema => transfer_schema(ctx).await,
        Stage::ChildObjects => child_objects(ctx).await,
        Stage::ExportScripts => export_scripts(ctx).await,
        Stage::RewriteScripts => {
            let folder = ctx.session.paths.scripts.clone();
            rewrite_folder(ctx, &folder).await
        }
        Stage::ApplyScripts => {
            let folder = ctx.session.paths.scripts.clone();
            apply_scripts(ctx, &folder).await
        }
        Stage::StageForeignKeys => stage_foreign_keys(ctx).await,
        Stage::DropForeignKeyStaging => drop_fk_staging(ctx).await,
        Stage::CompareTables => compare_tables(ctx).await,
        Stage::MoveRows => move_rows(ctx).await,
        Stage::ForeignKeys => foreign_keys(ctx).await,
        Stage::ObjectLists => object_lists(ctx).await,
        Stage::ExportObjects => export_objects(ctx).await,
        Stage::RewriteObjects => {
            let folder = ctx.session.paths.corp_objects.clone();
            rewrite_folder(ctx, &folder).await
        }
        Stage::ApplyObjects => apply_objects(ctx).await,
    }
}

async fn schema_bound_views(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.error_folder()?;
    let log = ctx.log_file.clone();
    let invocation = ctx
        .invocation("step1.ps1")
        .path_arg("-outputRootFolder", &folder)
        .arg("-viewsFolder", "Views")
        .path_arg("-outputFile", &log)
        .path_arg("-viewNamesFile", &log);
    completed!(ctx.invoke(invocation).await?);

    let schema = ctx.session.schema_from.clone();
    let count = ctx.catalog().await?.count_schema_bound_views(&schema).await?;
    ctx.validate(&format!("SQL Query Result: {}\n", count))?;
    Ok(StageOutcome::check(
        count == 0,
        format!("No schema-bound views remain under {}", schema),
        format!("{} schema-bound views remain under {}", count, schema),
    ))
}

async fn cleanup_schema(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.error_folder()?;
    let schema = ctx
        .config
        .pipeline
        .cleanup_schema
        .clone()
        .unwrap_or_else(|| ctx.session.schema_from.clone());
    let max = ctx.config.pipeline.max_cleanup_iterations.max(1);
    let catalog = ctx.catalog().await?;

    for iteration in 1..=max {
        let invocation = ctx
            .invocation("step2.ps1")
            .path_arg("-logFolderPath", &folder);
        completed!(ctx.invoke(invocation).await?);

        let count = catalog.count_objects_in_schema(&schema).await?;
        ctx.validate(&format!("Iteration {}: SQL Query Result: {}\n", iteration, count))?;
        if count == 0 {
            return Ok(StageOutcome::passed(format!(
                "Schema {} is empty after {} iterations",
                schema, iteration
            )));
        }
        info!("{} objects remain in {}, running step2 again", count, schema);
    }

    Err(MigrateError::RetryExhausted {
        stage: ctx.stage.number(),
        attempts: max,
    })
}

async fn transfer_schema(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.error_folder()?;
    let from = ctx.session.schema_from.clone();
    let to = ctx.session.schema_to.clone();
    let invocation = ctx
        .invocation("step3.ps1")
        .arg("-Fromsch", &from)
        .arg("-Tosch", &to)
        .path_arg("-logFolderPath", &folder);
    completed!(ctx.invoke(invocation).await?);

    let catalog = ctx.catalog().await?;
    let transfer = transfer_user_types(catalog.as_ref(), &from, &to).await?;
    let mut text = String::new();
    for line in transfer.lines() {
        let _ = writeln!(text, "{}", line);
    }
    let count = catalog.count_user_types(&to).await?;
    let _ = writeln!(text, "User-defined types under {}: {}", to, count);
    ctx.validate(&text)?;

    Ok(StageOutcome::check(
        count > 0,
        format!("{} user-defined types now under {}", count, to),
        format!("No user-defined types found under {}", to),
    ))
}

async fn child_objects(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.error_folder()?;
    let from = ctx.session.schema_from.clone();
    let to = ctx.session.schema_to.clone();
    let invocation = ctx
        .invocation("step4.ps1")
        .arg("-Tosch", &to)
        .arg("-Fromsch", &from)
        .path_arg("-logFolderPath", &folder);
    completed!(ctx.invoke(invocation).await?);

    let count = ctx.catalog().await?.count_child_objects(&from).await?;
    ctx.validate(&format!("SQL Query Result: {}\n", count))?;
    Ok(StageOutcome::check(
        count == 0,
        format!("No child objects remain under {}", from),
        format!("{} child objects remain under {}", count, from),
    ))
}

async fn export_scripts(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let scripts = ctx.session.paths.scripts.clone();
    let invocation = ctx
        .invocation("step5.ps1")
        .path_arg("-outputRootFolder", &scripts);
    let output = completed!(ctx.invoke(invocation).await?);
    let created = parse_total_files_created(&output.stdout).unwrap_or(0);
    info!("Total files created: {}", created);

    let invocation = ctx.invocation("step5b.ps1").path_arg("-outputFolder", &scripts);
    completed!(ctx.invoke(invocation).await?);

    let objects = ctx.catalog().await?.count_exportable_objects().await?;
    let matched = objects >= 0 && objects as u64 == created;
    let verdict = if matched {
        "Validation Successful: Counts match."
    } else {
        "Validation Failed: Mismatch in counts."
    };
    ctx.validate(&format!(
        "Total files created: {}\nSQL Query Result: {}\n{}\n",
        created, objects, verdict
    ))?;
    Ok(StageOutcome::check(
        matched,
        verdict,
        MigrateError::ValidationMismatch(format!(
            "{} objects in catalog, {} files created",
            objects, created
        ))
        .to_string(),
    ))
}

/// Stages 6 and 15: tool-side rename, then the in-process rewrite.
async fn rewrite_folder(ctx: &mut StageContext<'_>, folder: &Path) -> Result<StageOutcome> {
    let invocation = ToolInvocation::new("step6.ps1")
        .path_arg("-rootFolderPath", folder)
        .arg("-Fromsch", &ctx.session.schema_from)
        .arg("-Tosch", &ctx.session.schema_to);
    completed!(ctx.invoke(invocation).await?);

    let summary = rewrite_schema(folder, &ctx.rewrite_options())?;
    ctx.validate(&summary.report())?;
    Ok(StageOutcome::check(
        summary.is_clean(),
        format!("{} files rewritten", summary.files.len()),
        format!(
            "{} of {} files failed validation",
            summary.failed_files(),
            summary.files.len()
        ),
    ))
}

fn route(ctx: &mut StageContext<'_>, folder: &Path) -> Result<()> {
    let report = route_cross_db_files(folder, &ctx.session.paths.base, &ctx.session.database_name)?;
    ctx.log(&report.summary())?;
    if report.routed_files() > 0 {
        ctx.details.push(format!(
            "{} files reference other databases",
            report.routed_files()
        ));
    }
    Ok(())
}

fn apply_invocation(ctx: &StageContext<'_>, folder: &Path, log_folder: &Path) -> ToolInvocation {
    ctx.invocation("step7.ps1")
        .path_arg("-scriptParentFolder", folder)
        .path_arg("-logFolder", log_folder)
}

/// Compare the exportable-object count against the files under `folder`.
async fn validate_file_count(ctx: &mut StageContext<'_>, folder: &Path) -> Result<StageOutcome> {
    let objects = ctx.catalog().await?.count_exportable_objects().await?;
    let files = count_files(folder)?;
    let matched = objects >= 0 && objects as usize == files;
    ctx.validate(&format!(
        "SQL Query Result: {}\nFiles under {}: {}\n{}\n",
        objects,
        folder.display(),
        files,
        if matched {
            "Validation Successful: Counts match."
        } else {
            "Validation Failed: Mismatch in counts."
        }
    ))?;
    Ok(StageOutcome::check(
        matched,
        format!("{} objects match {} files", objects, files),
        MigrateError::ValidationMismatch(format!(
            "{} objects in catalog, {} files on disk",
            objects, files
        ))
        .to_string(),
    ))
}

async fn apply_scripts(ctx: &mut StageContext<'_>, folder: &Path) -> Result<StageOutcome> {
    route(ctx, folder)?;
    let log_folder = ctx.error_folder()?;
    let attempts = ctx.config.pipeline.export_attempts;
    let invocation = apply_invocation(ctx, folder, &log_folder);
    completed!(ctx.invoke_repeatedly(invocation, 1, attempts).await?);
    validate_file_count(ctx, folder).await
}

async fn stage_foreign_keys(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.error_folder()?;
    let catalog = ctx.catalog().await?;
    let expected = catalog.count_foreign_keys().await?;

    let invocation = ctx
        .invocation("step8.ps1")
        .path_arg("-logFolderPath", &folder);
    completed!(ctx.invoke(invocation).await?);

    let table = ctx.config.pipeline.fk_staging_table.clone();
    let staged = catalog.count_table_rows(&table).await?;
    ctx.validate(&format!(
        "Foreign keys before: {}\nRows in {}: {}\n",
        expected, table, staged
    ))?;
    Ok(StageOutcome::check(
        staged == expected,
        format!("{} foreign keys staged in {}", staged, table),
        MigrateError::ValidationMismatch(format!(
            "{} foreign keys, {} rows in {}",
            expected, staged, table
        ))
        .to_string(),
    ))
}

async fn drop_fk_staging(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.error_folder()?;
    let table = ctx.config.pipeline.fk_staging_table.clone();
    let iterations = ctx.config.pipeline.staging_iterations.max(1);
    let catalog = ctx.catalog().await?;

    let mut present = true;
    for iteration in 1..=iterations {
        info!("Running iteration {} of {}", iteration, iterations);
        let invocation = ctx
            .invocation("step9.ps1")
            .path_arg("-logFolderPath", &folder);
        completed!(ctx.invoke(invocation).await?);

        present = catalog.table_exists(&table).await?;
        let line = if present {
            format!("Iteration {}: {} table is not dropped.\n", iteration, table)
        } else {
            format!("Iteration {}: {} table is dropped.\n", iteration, table)
        };
        ctx.validate(&line)?;
    }

    Ok(StageOutcome::check(
        !present,
        format!("{} table is dropped", table),
        format!("{} table still exists", table),
    ))
}

/// Counterparty server, database and manifest, all required.
fn counterparty(session: &MigrationSession) -> Result<(String, String, PathBuf)> {
    let missing = |field: &str| {
        MigrateError::Config(format!(
            "{} is not set for {}; pass it as an override or run session set-counterparty",
            field, session.database_name
        ))
    };
    let server = session
        .counterparty_server
        .clone()
        .ok_or_else(|| missing("counterparty server"))?;
    let database = session
        .counterparty_database
        .clone()
        .ok_or_else(|| missing("counterparty database"))?;
    let manifest = session
        .table_manifest_path
        .clone()
        .ok_or_else(|| missing("table manifest"))?;
    Ok((server, database, manifest))
}

/// Compare the manifest against the session database's tables.
async fn validate_table_sets(
    ctx: &mut StageContext<'_>,
    manifest: &[ManifestTable],
) -> Result<StageOutcome> {
    let tables = ctx.catalog().await?.list_table_names().await?;
    let diff = compare_table_sets(manifest, &tables);
    ctx.validate(&diff.report())?;
    Ok(StageOutcome::check(
        diff.is_match(),
        "All table names match",
        format!(
            "{} missing and {} extra tables",
            diff.missing.len(),
            diff.extra.len()
        ),
    ))
}

async fn compare_tables(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let (cp_server, cp_database, manifest_path) = counterparty(&ctx.session)?;
    let manifest = read_table_manifest(&manifest_path)?;
    let log = ctx.log_file.clone();

    let invocation = ToolInvocation::new("step10.ps1")
        .arg("-sourceServer", &cp_server)
        .arg("-destinationServer", ctx.server())
        .arg("-sourceDatabase", &cp_database)
        .arg("-destinationDatabase", ctx.database())
        .path_arg("-tableNamesFile", &manifest_path)
        .path_arg("-errorLogFile", &log);
    completed!(ctx.invoke(invocation).await?);

    validate_table_sets(ctx, &manifest).await
}

async fn move_rows(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let (cp_server, cp_database, manifest_path) = counterparty(&ctx.session)?;
    let manifest = read_table_manifest(&manifest_path)?;
    let default_schema = ctx.config.pipeline.default_table_schema.clone();
    let batch_rows = ctx.config.pipeline.row_move_batch_size;

    let checkpoint_path = ctx.error_folder()?.join(CHECKPOINT_FILE);
    let source_key = format!("{}/{}", cp_server, cp_database);
    let mut checkpoint = RowMoveCheckpoint::load_or_new(&checkpoint_path, &source_key)?;

    let mut source = ctx.connector.table_source(&cp_server, &cp_database).await?;
    let mut sink = ctx
        .connector
        .table_sink(&ctx.session.source_server, &ctx.session.database_name)
        .await?;

    let mut failed = 0usize;
    for entry in &manifest {
        if ctx.cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        let table = entry.qualified(&default_schema);
        let key = table.to_string();
        if checkpoint.is_table_completed(&key) {
            ctx.details.push(format!("{}: already copied", key));
            continue;
        }

        let resume_offset = checkpoint.resume_offset(&key);
        checkpoint.get_or_create_table(&key).mark_in_progress();
        checkpoint.save(&checkpoint_path)?;

        let cancel = ctx.cancel;
        let options = MoveOptions {
            batch_rows,
            resume_offset,
        };
        let moved = {
            let checkpoint = &mut checkpoint;
            let path = checkpoint_path.as_path();
            let key = key.as_str();
            move_table(source.as_mut(), sink.as_mut(), &table, options, move |committed| {
                if cancel.is_cancelled() {
                    return Err(MigrateError::Cancelled);
                }
                checkpoint.get_or_create_table(key).rows_committed = committed;
                checkpoint.save(path)
            })
            .await
        };

        match moved {
            Ok(stats) => {
                let progress = checkpoint.get_or_create_table(&key);
                progress.rows_committed = stats.rows_committed;
                progress.mark_completed();
                checkpoint.save(&checkpoint_path)?;
                let line = format!("{}: {} rows copied", key, stats.rows_copied);
                ctx.log(&line)?;
                ctx.details.push(line);
            }
            Err(MigrateError::Cancelled) => {
                checkpoint.save(&checkpoint_path)?;
                return Err(MigrateError::Cancelled);
            }
            Err(e) => {
                warn!("{}", e);
                failed += 1;
                checkpoint.get_or_create_table(&key).mark_failed(&e.to_string());
                checkpoint.save(&checkpoint_path)?;
                ctx.log(&format!("Error copying {}: {}", key, e))?;
                ctx.details.push(e.to_string());
            }
        }
    }

    let outcome = validate_table_sets(ctx, &manifest).await?;
    if failed > 0 {
        return Ok(StageOutcome::failed(format!(
            "{} of {} tables failed to copy",
            failed,
            manifest.len()
        )));
    }
    Ok(outcome)
}

async fn foreign_keys(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let invocation = ToolInvocation::new("step12.ps1")
        .arg("-ServerName", ctx.server())
        .arg("-databaseName", ctx.database());
    completed!(ctx.invoke(invocation).await?);

    let keys = ctx.catalog().await?.list_foreign_keys().await?;
    let mut text = format!("Foreign keys: {}\n", keys.len());
    for key in &keys {
        let _ = writeln!(text, "{} on {} references {}", key.name, key.table, key.referenced_table);
    }
    ctx.validate(&text)?;
    Ok(StageOutcome::check(
        !keys.is_empty(),
        format!("{} foreign keys present", keys.len()),
        "No foreign keys found",
    ))
}

async fn object_lists(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.session.paths.corp_names.clone();
    let invocation = ctx
        .invocation("step13.ps1")
        .path_arg("-outputDirectory", &folder);
    completed!(ctx.invoke(invocation).await?);

    match discover_object_manifests(&folder) {
        Ok(found) => {
            ctx.validate(&format!(
                "Functions: {}\nViews: {}\nStored procedures: {}\n",
                found.functions.display(),
                found.views.display(),
                found.procedures.display()
            ))?;
            Ok(StageOutcome::passed("Found one manifest per object type"))
        }
        Err(e @ (MigrateError::ManifestMissing { .. } | MigrateError::ManifestAmbiguous { .. })) => {
            ctx.validate(&format!("{}\n", e))?;
            Ok(StageOutcome::failed(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

async fn export_objects(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let found = discover_object_manifests(&ctx.session.paths.corp_names)?;
    let out = ctx.session.paths.corp_objects.clone();

    let functions = ctx
        .invocation("step14a.ps1")
        .path_arg("-outputRootFolder", &out)
        .path_arg("-functionsListFile", &found.functions);
    completed!(ctx.invoke(functions).await?);

    let views = ctx
        .invocation("step14b.ps1")
        .path_arg("-outputRootFolder", &out)
        .arg("-viewsFolder", "Views")
        .path_arg("-viewsListFilePath", &found.views);
    completed!(ctx.invoke(views).await?);

    let procedures = ctx
        .invocation("step14c.ps1")
        .path_arg("-outputRootFolder", &out)
        .arg("-storedProceduresFolder", "StoredProcedures")
        .path_arg("-spListFilePath", &found.procedures);
    completed!(ctx.invoke(procedures).await?);

    let mut text = String::new();
    let mut total = 0usize;
    let mut folders: Vec<PathBuf> = Vec::new();
    if out.is_dir() {
        for entry in fs::read_dir(&out)? {
            let path = entry?.path();
            if path.is_dir() {
                folders.push(path);
            }
        }
    }
    folders.sort();
    for folder in &folders {
        let count = count_sql_files(folder)?;
        total += count;
        let name = folder.file_name().unwrap_or_default().to_string_lossy();
        let _ = writeln!(text, "{}: {} SQL files", name, count);
    }
    let _ = writeln!(text, "Total: {} SQL files", total);
    ctx.validate(&text)?;

    Ok(StageOutcome::check(
        total > 0,
        format!("{} object files exported", total),
        "No object files were exported",
    ))
}

async fn apply_objects(ctx: &mut StageContext<'_>) -> Result<StageOutcome> {
    let folder = ctx.session.paths.corp_objects.clone();
    let log_folder = ctx.error_folder()?;
    let attempts = ctx.config.pipeline.export_attempts;

    route(ctx, &folder)?;
    let invocation = apply_invocation(ctx, &folder, &log_folder);
    completed!(ctx.invoke_repeatedly(invocation.clone(), 1, attempts).await?);

    let summary = rewrite_schema(&folder, &ctx.rewrite_options())?;
    ctx.log(&summary.report())?;
    if !summary.is_clean() {
        ctx.details.push(format!(
            "{} files failed rewrite validation",
            summary.failed_files()
        ));
    }

    completed!(ctx.invoke_repeatedly(invocation, attempts + 1, 1).await?);
    validate_file_count(ctx, &folder).await
}
