//! Resumable per-table copy progress.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File name of the checkpoint inside the row-copy stage's error folder.
pub const CHECKPOINT_FILE: &str = "row_move_checkpoint.json";

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Copy progress for every table of one manifest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowMoveCheckpoint {
    /// `server/database` the rows are read from.
    pub source: String,

    /// Per-table progress keyed by `schema.table`.
    pub tables: BTreeMap<String, TableProgress>,

    pub updated_at: DateTime<Utc>,
}

/// Progress of a single table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProgress {
    pub status: TaskStatus,

    /// Rows committed to the destination so far; the resume offset.
    pub rows_committed: u64,

    pub error: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl RowMoveCheckpoint {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            tables: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Load a checkpoint for `source`.
    ///
    /// A missing file, or one written for a different source, starts fresh.
    pub fn load_or_new<P: AsRef<Path>>(path: P, source: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(source));
        }
        let content = std::fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&content)?;
        if checkpoint.source != source {
            tracing::warn!(
                "Checkpoint {} belongs to {}, starting fresh for {}",
                path.display(),
                checkpoint.source,
                source
            );
            return Ok(Self::new(source));
        }
        Ok(checkpoint)
    }

    /// Save to a file (atomic write).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.updated_at = Utc::now();

        let content = serde_json::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Get or create table progress.
    pub fn get_or_create_table(&mut self, table: &str) -> &mut TableProgress {
        self.tables
            .entry(table.to_string())
            .or_insert_with(TableProgress::new)
    }

    /// Check if a table is completed.
    pub fn is_table_completed(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .map(|t| t.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    /// Offset to resume a table from.
    pub fn resume_offset(&self, table: &str) -> u64 {
        self.tables
            .get(table)
            .map(|t| t.rows_committed)
            .unwrap_or(0)
    }
}

impl TableProgress {
    pub fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            rows_committed: 0,
            error: None,
            completed_at: None,
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = TaskStatus::InProgress;
        self.error = None;
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
    }
}

impl Default for TableProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_checkpoint_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        let mut checkpoint = RowMoveCheckpoint::new("legacy-host/Sales");
        let orders = checkpoint.get_or_create_table("dbo.Orders");
        orders.mark_in_progress();
        orders.rows_committed = 2000;
        checkpoint.get_or_create_table("dbo.Customers").mark_completed();
        checkpoint.save(&path).unwrap();

        let loaded = RowMoveCheckpoint::load_or_new(&path, "legacy-host/Sales").unwrap();
        assert_eq!(loaded.resume_offset("dbo.Orders"), 2000);
        assert!(loaded.is_table_completed("dbo.Customers"));
        assert!(!loaded.is_table_completed("dbo.Orders"));
        assert_eq!(loaded.resume_offset("dbo.Unknown"), 0);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_checkpoint_for_other_source_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CHECKPOINT_FILE);

        let mut checkpoint = RowMoveCheckpoint::new("a/Sales");
        checkpoint.get_or_create_table("dbo.Orders").rows_committed = 10;
        checkpoint.save(&path).unwrap();

        let loaded = RowMoveCheckpoint::load_or_new(&path, "b/Sales").unwrap();
        assert!(loaded.tables.is_empty());
        assert_eq!(loaded.source, "b/Sales");
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
