//! Session store trait.
//!
//! The [`SessionStore`] trait defines how migration sessions are persisted.
//! Implementations:
//!
//! - **JSON files**: `JsonSessionStore` in `json.rs`
//! - **MSSQL**: `MssqlSessionStore` in `mssql_db.rs`
//!
//! The orchestrator works with `Arc<dyn SessionStore>` without knowing the
//! concrete type.

use async_trait::async_trait;

use super::{CounterpartyUpdate, MigrationSession, ProgressSnapshot};
use crate::error::Result;

/// Result of an insert-if-absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row was created by this call.
    Inserted,
    /// A row for the database already existed; nothing was written.
    Existing,
}

/// Result of trying to claim a session for a stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageClaim {
    Acquired,
    /// Another invocation is running the given stage.
    Busy(u8),
}

/// Trait for session persistence backends.
///
/// Sessions are keyed by database name. Besides the counterparty overrides
/// and the in-progress flag, a stored session is never modified.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let store: Arc<dyn SessionStore> = Arc::new(JsonSessionStore::new("./sessions"));
/// store.init_schema().await?;
/// if store.insert_if_absent(&session).await? == InsertOutcome::Existing {
///     // another caller got there first
/// }
/// ```
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Initialize the storage structure. Idempotent.
    async fn init_schema(&self) -> Result<()>;

    /// Load the session for a database.
    async fn get(&self, database: &str) -> Result<Option<MigrationSession>>;

    /// Atomically insert `session` unless a row for its database exists.
    async fn insert_if_absent(&self, session: &MigrationSession) -> Result<InsertOutcome>;

    /// Persist counterparty overrides and return the updated session.
    ///
    /// Fails with `SessionNotFound` when no session exists.
    async fn update_counterparty(
        &self,
        database: &str,
        update: &CounterpartyUpdate,
    ) -> Result<MigrationSession>;

    /// Compare-and-swap the in-progress flag from empty to `stage`.
    async fn try_begin_stage(&self, database: &str, stage: u8) -> Result<StageClaim>;

    /// Clear the in-progress flag. Clearing an empty flag is not an error.
    async fn end_stage(&self, database: &str) -> Result<()>;

    /// Upsert the operator's progress snapshot.
    async fn save_progress(&self, database: &str, data: &serde_json::Value) -> Result<()>;

    async fn recover_progress(&self, database: &str) -> Result<Option<ProgressSnapshot>>;

    /// Delete the progress snapshot, returning whether one existed.
    async fn delete_progress(&self, database: &str) -> Result<bool>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}
