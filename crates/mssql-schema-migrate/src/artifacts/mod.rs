//! Per-database artifact tree.
//!
//! Every database under migration owns a folder tree below the operator's
//! chosen root:
//!
//! ```text
//! <root>/<database>/
//!     ErrorLogs/step1 .. step16
//!     validation/step1 .. step16
//!     scripts/
//!     corp_names/
//!     corpuser_objects/
//!     corpuser_list/
//!     crossdb/<foreign database>/...
//! ```
//!
//! Paths are derived deterministically, so deriving them again for an
//! existing session always yields the stored values.

use crate::error::{MigrateError, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Number of stages, and of per-stage error and validation folders.
pub const STAGE_COUNT: u8 = 16;

/// Timestamp format used in log and report file names.
const FILE_TIMESTAMP: &str = "%Y%m%d_%H%M%S";

/// All folders belonging to one database's artifact tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    /// `<root>/<database>`.
    pub base: PathBuf,

    /// Parent of the per-stage error folders.
    pub error_logs: PathBuf,

    /// Parent of the per-stage validation folders.
    pub validation: PathBuf,

    /// `ErrorLogs/step{N}`, index 0 is stage 1.
    pub stage_error_folders: Vec<PathBuf>,

    /// `validation/step{N}`, index 0 is stage 1.
    pub stage_validation_folders: Vec<PathBuf>,

    /// Exported definition scripts (stages 5-7).
    pub scripts: PathBuf,

    /// Object-name manifests (stages 13-14).
    pub corp_names: PathBuf,

    /// Exported legacy-owner objects (stages 14-16).
    pub corp_objects: PathBuf,

    /// Legacy-owner object lists.
    pub corp_list: PathBuf,

    /// Quarantine root for files referencing other databases.
    pub crossdb: PathBuf,
}

impl ArtifactPaths {
    /// Derive the tree for `database` under `root` without touching the disk.
    pub fn derive(root: &Path, database: &str) -> Result<Self> {
        validate_folder_name(database)?;

        let base = root.join(database);
        let error_logs = base.join("ErrorLogs");
        let validation = base.join("validation");
        let stage_error_folders = (1..=STAGE_COUNT)
            .map(|n| error_logs.join(stage_folder_name(n)))
            .collect();
        let stage_validation_folders = (1..=STAGE_COUNT)
            .map(|n| validation.join(stage_folder_name(n)))
            .collect();

        Ok(Self {
            scripts: base.join("scripts"),
            corp_names: base.join("corp_names"),
            corp_objects: base.join("corpuser_objects"),
            corp_list: base.join("corpuser_list"),
            crossdb: base.join("crossdb"),
            error_logs,
            validation,
            stage_error_folders,
            stage_validation_folders,
            base,
        })
    }

    /// Error folder for a stage (1-based).
    pub fn stage_error_folder(&self, stage: u8) -> Result<&Path> {
        stage_index(stage)
            .and_then(|i| self.stage_error_folders.get(i))
            .map(PathBuf::as_path)
            .ok_or(MigrateError::UnknownStage(stage))
    }

    /// Validation folder for a stage (1-based).
    pub fn stage_validation_folder(&self, stage: u8) -> Result<&Path> {
        stage_index(stage)
            .and_then(|i| self.stage_validation_folders.get(i))
            .map(PathBuf::as_path)
            .ok_or(MigrateError::UnknownStage(stage))
    }

    /// Every directory in the tree, parents first.
    pub fn directories(&self) -> Vec<&Path> {
        let mut dirs: Vec<&Path> = vec![&self.base, &self.error_logs, &self.validation];
        dirs.extend(self.stage_error_folders.iter().map(PathBuf::as_path));
        dirs.extend(self.stage_validation_folders.iter().map(PathBuf::as_path));
        dirs.extend([
            self.scripts.as_path(),
            self.corp_names.as_path(),
            self.corp_objects.as_path(),
            self.corp_list.as_path(),
            self.crossdb.as_path(),
        ]);
        dirs
    }

    /// Create any missing directory. Existing directories are left untouched.
    pub fn ensure(&self) -> Result<()> {
        for dir in self.directories() {
            fs::create_dir_all(dir)?;
        }
        debug!("Artifact tree ready at {}", self.base.display());
        Ok(())
    }

    /// Whether every directory of the tree exists.
    pub fn is_complete(&self) -> bool {
        self.directories().iter().all(|d| d.is_dir())
    }

    /// Timestamped error-log path for a stage run.
    pub fn stage_log_file(
        &self,
        database: &str,
        stage: u8,
        at: DateTime<Local>,
    ) -> Result<PathBuf> {
        let name = format!(
            "{}_step{}_errors_{}.txt",
            database,
            stage,
            at.format(FILE_TIMESTAMP)
        );
        Ok(self.stage_error_folder(stage)?.join(name))
    }

    /// Timestamped validation-report path for a stage run.
    pub fn stage_report_file(
        &self,
        database: &str,
        stage: u8,
        at: DateTime<Local>,
    ) -> Result<PathBuf> {
        let name = format!(
            "{}_Validation_step{}_report_{}.txt",
            database,
            stage,
            at.format(FILE_TIMESTAMP)
        );
        Ok(self.stage_validation_folder(stage)?.join(name))
    }
}

/// Kind of object a generated definition file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Table,
    View,
    Procedure,
    Function,
    Trigger,
    Unknown,
}

impl ObjectType {
    /// Map a definition keyword (`PROC`, `view`, ...) to an object type.
    pub fn from_keyword(keyword: &str) -> Self {
        match keyword.to_ascii_uppercase().as_str() {
            "TABLE" => ObjectType::Table,
            "VIEW" => ObjectType::View,
            "PROCEDURE" | "PROC" => ObjectType::Procedure,
            "FUNCTION" => ObjectType::Function,
            "TRIGGER" => ObjectType::Trigger,
            _ => ObjectType::Unknown,
        }
    }
}

/// Rewrite state of a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RewriteStatus {
    Unrewritten,
    RewrittenOk,
    RewrittenError,
}

/// A generated SQL definition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub object_type: ObjectType,
    pub status: RewriteStatus,
}

impl ArtifactFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            object_type: ObjectType::Unknown,
            status: RewriteStatus::Unrewritten,
        }
    }
}

/// Derive and create the artifact tree for `database` under `root`.
pub fn ensure_tree(root: &Path, database: &str) -> Result<ArtifactPaths> {
    let paths = ArtifactPaths::derive(root, database)?;
    paths.ensure()?;
    Ok(paths)
}

/// Folder name for a stage: `step{N}`.
pub fn stage_folder_name(stage: u8) -> String {
    format!("step{}", stage)
}

fn stage_index(stage: u8) -> Option<usize> {
    (1..=STAGE_COUNT)
        .contains(&stage)
        .then(|| usize::from(stage - 1))
}

fn validate_folder_name(database: &str) -> Result<()> {
    let trimmed = database.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
        || trimmed != database
    {
        return Err(MigrateError::Config(format!(
            "database name '{}' cannot be used as a folder name",
            database
        )));
    }
    Ok(())
}

/// Append text to a file, creating it (and its parent) when missing.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}

/// Count regular files below `dir`, recursively. A missing folder counts as empty.
pub fn count_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir) {
        if entry?.file_type().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

/// Count `.sql` files below `dir`, recursively.
pub fn count_sql_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if entry.file_type().is_file() && has_sql_extension(entry.path()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Whether a path ends in `.sql` (any case).
pub fn has_sql_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("sql"))
        .unwrap_or(false)
}
