//! Error types for the schema migration pipeline.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog connection or query error
    #[error("Database error: {0}")]
    Database(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// No session row exists for the database
    #[error("No session for database '{0}' - create the folder first")]
    SessionNotFound(String),

    /// Another caller created the session between our lookup and insert
    #[error("Session for database '{0}' was created concurrently - retry to reuse it")]
    AlreadyExistsRace(String),

    /// A stage is already running for this database
    #[error("Stage {stage} is already running for database '{database}'")]
    StageInProgress { database: String, stage: u8 },

    /// Stage number outside 1..=16
    #[error("Unknown stage: {0} (expected 1-16)")]
    UnknownStage(u8),

    /// Session or progress store error
    #[error("Session store error: {0}")]
    State(String),

    /// External tool could not be started
    #[error("Failed to launch {script}: {message}")]
    ToolLaunch { script: String, message: String },

    /// External tool wrote to stderr
    #[error("{script} reported errors: {stderr}")]
    ToolInvocationFailed { script: String, stderr: String },

    /// External tool exceeded the configured timeout
    #[error("{script} did not finish within {seconds}s")]
    ToolTimeout { script: String, seconds: u64 },

    /// Catalog state does not match the expected post-condition
    #[error("Validation failed: {0}")]
    ValidationMismatch(String),

    /// File could not be decoded under any supported encoding
    #[error("Unable to decode {}", .0.display())]
    FileEncodingUnreadable(PathBuf),

    /// A single catalog object could not be transferred
    #[error("Transfer of {object} failed: {message}")]
    PerObjectTransferFailure { object: String, message: String },

    /// Bounded polling loop gave up
    #[error("Stage {stage} gave up after {attempts} attempts")]
    RetryExhausted { stage: u8, attempts: u32 },

    /// No manifest file matched an object type
    #[error("No {kind} manifest found in {}", .folder.display())]
    ManifestMissing { kind: String, folder: PathBuf },

    /// More than one manifest file matched an object type
    #[error("Multiple {kind} manifests found: {files:?}")]
    ManifestAmbiguous { kind: String, files: Vec<PathBuf> },

    /// Definition rewrite could not run
    #[error("Rewrite error: {0}")]
    Rewrite(String),

    /// Row copy failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Directory walk error
    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// Invalid regular expression
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stage was cancelled (SIGINT, etc.)
    #[error("Stage cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create a ToolLaunch error
    pub fn tool_launch(script: impl Into<String>, message: impl std::fmt::Display) -> Self {
        MigrateError::ToolLaunch {
            script: script.into(),
            message: message.to_string(),
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::SessionNotFound(_) => 3,
            MigrateError::StageInProgress { .. } | MigrateError::AlreadyExistsRace(_) => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::SessionNotFound("db".into()).exit_code(), 3);
        assert_eq!(
            MigrateError::StageInProgress {
                database: "db".into(),
                stage: 4
            }
            .exit_code(),
            4
        );
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
        assert_eq!(MigrateError::Rewrite("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = MigrateError::from(io);
        let text = err.format_detailed();
        assert!(text.starts_with("Error: IO error: missing"));
    }

    #[test]
    fn test_session_not_found_message() {
        let err = MigrateError::SessionNotFound("Sales".into());
        assert!(err.to_string().contains("create the folder first"));
    }
}
