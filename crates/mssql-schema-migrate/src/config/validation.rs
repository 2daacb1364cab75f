//! Configuration validation.

use super::{Config, StoreBackend};
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Connection validation
    if config.connection.pool_size == 0 {
        return Err(MigrateError::Config(
            "connection.pool_size must be at least 1".into(),
        ));
    }
    if config.connection.port == 0 {
        return Err(MigrateError::Config("connection.port must not be 0".into()));
    }

    // Session store validation
    match config.session_store.backend {
        StoreBackend::Json => {
            if config.session_store.path.as_os_str().is_empty() {
                return Err(MigrateError::Config(
                    "session_store.path is required for the json backend".into(),
                ));
            }
        }
        StoreBackend::Mssql => {
            if config.session_store.server.as_deref().unwrap_or("").is_empty() {
                return Err(MigrateError::Config(
                    "session_store.server is required for the mssql backend".into(),
                ));
            }
            if config.session_store.database.as_deref().unwrap_or("").is_empty() {
                return Err(MigrateError::Config(
                    "session_store.database is required for the mssql backend".into(),
                ));
            }
            if config.connection.user.is_empty() {
                return Err(MigrateError::Config(
                    "connection.user is required for the mssql backend".into(),
                ));
            }
        }
    }
    if config.session_store.schema.is_empty() {
        return Err(MigrateError::Config("session_store.schema is required".into()));
    }

    // Tool validation
    if config.tool.program.trim().is_empty() {
        return Err(MigrateError::Config("tool.program is required".into()));
    }
    if config.tool.scripts_dir.as_os_str().is_empty() {
        return Err(MigrateError::Config("tool.scripts_dir is required".into()));
    }
    if let Some(0) = config.tool.timeout_secs {
        return Err(MigrateError::Config(
            "tool.timeout_secs must be at least 1 when set".into(),
        ));
    }

    // Pipeline validation
    let pipeline = &config.pipeline;
    if pipeline.max_cleanup_iterations == 0 {
        return Err(MigrateError::Config(
            "pipeline.max_cleanup_iterations must be at least 1".into(),
        ));
    }
    if pipeline.export_attempts == 0 {
        return Err(MigrateError::Config(
            "pipeline.export_attempts must be at least 1".into(),
        ));
    }
    if pipeline.staging_iterations == 0 {
        return Err(MigrateError::Config(
            "pipeline.staging_iterations must be at least 1".into(),
        ));
    }
    if pipeline.row_move_batch_size == 0 {
        return Err(MigrateError::Config(
            "pipeline.row_move_batch_size must be at least 1".into(),
        ));
    }
    if pipeline.fk_staging_table.is_empty() {
        return Err(MigrateError::Config(
            "pipeline.fk_staging_table is required".into(),
        ));
    }
    if pipeline.default_table_schema.is_empty() {
        return Err(MigrateError::Config(
            "pipeline.default_table_schema is required".into(),
        ));
    }
    if let Some(schema) = &pipeline.cleanup_schema {
        if schema.trim().is_empty() {
            return Err(MigrateError::Config(
                "pipeline.cleanup_schema must not be blank when set".into(),
            ));
        }
    }

    Ok(())
}
