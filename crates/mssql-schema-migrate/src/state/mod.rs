//! Migration sessions and their persistence.
//!
//! A session binds a database name to its source server, the schema pair being
//! migrated, and its artifact tree. A session exists exactly when its tree
//! exists; [`ensure_session`] creates both.

mod backend;
mod json;
mod mssql_db;

pub use backend::{InsertOutcome, SessionStore, StageClaim};
pub use json::JsonSessionStore;
pub use mssql_db::MssqlSessionStore;

use crate::artifacts::ArtifactPaths;
use crate::config::{Config, StoreBackend};
use crate::error::{MigrateError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Persisted state of one database migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSession {
    /// Session id returned by `ensure_session`.
    pub id: Uuid,

    /// Database under migration; the session key.
    pub database_name: String,

    /// Server hosting the database.
    pub source_server: String,

    /// Server holding the legacy copy of the tables (stages 10-11).
    pub counterparty_server: Option<String>,

    /// Database holding the legacy copy of the tables.
    pub counterparty_database: Option<String>,

    /// One table name per line.
    pub table_manifest_path: Option<PathBuf>,

    /// Legacy owner schema being retired.
    pub schema_from: String,

    /// Schema receiving the objects.
    pub schema_to: String,

    /// Artifact tree.
    pub paths: ArtifactPaths,

    pub tree_created: bool,

    /// Stage currently holding the session, if any.
    #[serde(default)]
    pub active_stage: Option<u8>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Request to create a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub database_name: String,
    pub source_server: String,
    pub folder_root: PathBuf,
    pub counterparty_server: Option<String>,
    pub counterparty_database: Option<String>,
    pub table_manifest_path: Option<PathBuf>,
    pub schema_from: String,
    pub schema_to: String,
}

impl NewSession {
    fn validate(&self) -> Result<()> {
        if self.source_server.trim().is_empty() {
            return Err(MigrateError::Config("server name is required".into()));
        }
        if self.schema_from.trim().is_empty() || self.schema_to.trim().is_empty() {
            return Err(MigrateError::Config(
                "schema_from and schema_to are required".into(),
            ));
        }
        Ok(())
    }

    fn into_session(self, paths: ArtifactPaths) -> MigrationSession {
        let now = Utc::now();
        MigrationSession {
            id: Uuid::new_v4(),
            database_name: self.database_name,
            source_server: self.source_server,
            counterparty_server: self.counterparty_server,
            counterparty_database: self.counterparty_database,
            table_manifest_path: self.table_manifest_path,
            schema_from: self.schema_from,
            schema_to: self.schema_to,
            paths,
            tree_created: true,
            active_stage: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Counterparty override fields; `None` leaves the stored value unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterpartyUpdate {
    pub server: Option<String>,
    pub database: Option<String>,
    pub table_manifest_path: Option<PathBuf>,
}

impl CounterpartyUpdate {
    pub fn is_empty(&self) -> bool {
        self.server.is_none() && self.database.is_none() && self.table_manifest_path.is_none()
    }

    /// Apply the overrides to a session in memory.
    pub fn apply(&self, session: &mut MigrationSession) {
        if let Some(server) = &self.server {
            session.counterparty_server = Some(server.clone());
        }
        if let Some(database) = &self.database {
            session.counterparty_database = Some(database.clone());
        }
        if let Some(path) = &self.table_manifest_path {
            session.table_manifest_path = Some(path.clone());
        }
    }
}

/// Opaque operator progress saved per database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub database_name: String,
    pub data: serde_json::Value,
    pub saved_at: DateTime<Utc>,
}

/// Create the session for a database, or return the existing one.
///
/// The row is inserted before the tree is created. For an existing session
/// the tree is re-ensured and nothing else changes.
/// Losing an insert race to a concurrent caller yields `AlreadyExistsRace`;
/// retrying then takes the existing-session path.
pub async fn ensure_session(store: &dyn SessionStore, request: NewSession) -> Result<MigrationSession> {
    if let Some(existing) = store.get(&request.database_name).await? {
        existing.paths.ensure()?;
        info!(
            "Session for {} already exists ({})",
            existing.database_name, existing.id
        );
        return Ok(existing);
    }

    request.validate()?;
    let paths = ArtifactPaths::derive(&request.folder_root, &request.database_name)?;
    let session = request.into_session(paths);

    // The tree is created only once the row exists.
    match store.insert_if_absent(&session).await? {
        InsertOutcome::Inserted => {
            session.paths.ensure()?;
            info!(
                "Created session {} for {} at {}",
                session.id,
                session.database_name,
                session.paths.base.display()
            );
            Ok(session)
        }
        InsertOutcome::Existing => Err(MigrateError::AlreadyExistsRace(session.database_name)),
    }
}

/// Load a session or fail with `SessionNotFound`.
pub async fn require_session(store: &dyn SessionStore, database: &str) -> Result<MigrationSession> {
    store
        .get(database)
        .await?
        .ok_or_else(|| MigrateError::SessionNotFound(database.to_string()))
}

/// Open and initialize the configured session store.
pub async fn open_session_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.session_store.backend {
        StoreBackend::Json => Arc::new(JsonSessionStore::new(&config.session_store.path)),
        StoreBackend::Mssql => Arc::new(
            MssqlSessionStore::connect(&config.connection, &config.session_store).await?,
        ),
    };
    store.init_schema().await?;
    info!("Using {} session store", store.backend_type());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(root: &std::path::Path) -> NewSession {
        NewSession {
            database_name: "Sales".into(),
            source_server: "sqlhost".into(),
            folder_root: root.to_path_buf(),
            counterparty_server: None,
            counterparty_database: None,
            table_manifest_path: None,
            schema_from: "corpuser".into(),
            schema_to: "sales".into(),
        }
    }

    #[tokio::test]
    async fn test_ensure_session_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = JsonSessionStore::new(dir.path().join("sessions"));
        store.init_schema().await.unwrap();
        let root = dir.path().join("artifacts");

        let first = ensure_session(&store, request(&root)).await.unwrap();
        assert!(first.paths.is_complete());

        let mut second_request = request(&root);
        second_request.schema_to = "other".into();
        let second = ensure_session(&store, second_request).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.schema_to, "sales");
        let files = std::fs::read_dir(dir.path().join("sessions"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".session.json"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn test_ensure_session_heals_tree() {
        let dir = TempDir::new().unwrap();
        let store = JsonSessionStore::new(dir.path().join("sessions"));
        store.init_schema().await.unwrap();
        let root = dir.path().join("artifacts");

        let session = ensure_session(&store, request(&root)).await.unwrap();
        std::fs::remove_dir_all(&session.paths.scripts).unwrap();
        assert!(!session.paths.is_complete());

        ensure_session(&store, request(&root)).await.unwrap();
        assert!(session.paths.is_complete());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_creates_one_session() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonSessionStore::new(dir.path().join("sessions")));
        store.init_schema().await.unwrap();
        let root = dir.path().join("artifacts");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let req = request(&root);
            handles.push(tokio::spawn(async move {
                match ensure_session(store.as_ref(), req.clone()).await {
                    Err(MigrateError::AlreadyExistsRace(_)) => ensure_session(store.as_ref(), req).await,
                    other => other,
                }
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_require_session_not_found() {
        let dir = TempDir::new().unwrap();
        let store = JsonSessionStore::new(dir.path());
        let err = require_session(&store, "Nope").await.unwrap_err();
        assert!(matches!(err, MigrateError::SessionNotFound(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_invalid_request_rejected() {
        let dir = TempDir::new().unwrap();
        let store = JsonSessionStore::new(dir.path().join("sessions"));
        let mut req = request(dir.path());
        req.schema_from = " ".into();
        let err = ensure_session(&store, req).await.unwrap_err();
        assert!(matches!(err, MigrateError::Config(_)));
        assert!(!dir.path().join("Sales").exists());
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_no_tree() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("sessions");
        std::fs::write(&blocker, "not a directory").unwrap();
        let store = JsonSessionStore::new(&blocker);
        let root = dir.path().join("artifacts");

        assert!(ensure_session(&store, request(&root)).await.is_err());
        assert!(!root.join("Sales").exists());
    }

    #[test]
    fn test_counterparty_update_applies_only_set_fields() {
        let paths = ArtifactPaths::derive(std::path::Path::new("/data"), "Sales").unwrap();
        let mut session = request(std::path::Path::new("/data")).into_session(paths);
        session.counterparty_server = Some("old".into());

        let update = CounterpartyUpdate {
            database: Some("LegacySales".into()),
            ..Default::default()
        };
        update.apply(&mut session);
        assert_eq!(session.counterparty_server.as_deref(), Some("old"));
        assert_eq!(session.counterparty_database.as_deref(), Some("LegacySales"));
        assert!(CounterpartyUpdate::default().is_empty());
    }
}
