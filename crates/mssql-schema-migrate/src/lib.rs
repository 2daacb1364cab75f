//! # mssql-schema-migrate
//!
//! Staged schema ownership migration for SQL Server databases.
//!
//! Objects owned by a legacy schema are moved into a new schema through a
//! sixteen-stage pipeline. Each stage:
//!
//! - **Drives an external tool** (a PowerShell script) with named arguments
//! - **Validates against the live catalog** once the tool has finished
//! - **Writes timestamped logs** into a per-database artifact tree
//! - **Persists session state** so stages can be re-run and resumed
//!
//! Along the way the library rewrites exported definitions for the new
//! schema, quarantines definitions that reference other databases, and moves
//! table rows between servers with page-level checkpoints.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_schema_migrate::{Config, Orchestrator, Stage, StageOverrides};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_schema_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::from_config(config).await?;
//!     let report = orchestrator
//!         .run_stage(
//!             Stage::SchemaBoundViews,
//!             "Sales",
//!             &StageOverrides::default(),
//!             &CancellationToken::new(),
//!         )
//!         .await?;
//!     println!("{}: {}", report.status, report.message);
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod error;
pub mod manifest;
pub mod orchestrator;
pub mod rewrite;
pub mod router;
pub mod state;
pub mod text;
pub mod tool;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenient access
pub use artifacts::{ensure_tree, ArtifactPaths, STAGE_COUNT};
pub use catalog::{CatalogProbe, Connector, MssqlConnector};
pub use config::{Config, StoreBackend};
pub use error::{MigrateError, Result};
pub use orchestrator::{Orchestrator, Stage, StageOverrides, StageReport, StageStatus};
pub use rewrite::{rewrite_schema, RewriteOptions, RewriteSummary};
pub use router::{route_cross_db_files, RouteReport};
pub use state::{
    ensure_session, open_session_store, CounterpartyUpdate, MigrationSession, NewSession,
    ProgressSnapshot, SessionStore,
};
pub use tool::{ProcessToolRunner, ToolInvocation, ToolRunner};
pub use transfer::{move_table, MoveOptions, MoveStats, QualifiedTable, SqlValue};
