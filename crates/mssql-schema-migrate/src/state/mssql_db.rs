//! MSSQL database-backed session storage.

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tiberius::Row;
use tracing::debug;
use uuid::Uuid;

use super::backend::{InsertOutcome, SessionStore, StageClaim};
use super::{CounterpartyUpdate, MigrationSession, ProgressSnapshot};
use crate::catalog::TiberiusConnectionManager;
use crate::config::{ConnectionConfig, SessionStoreConfig};
use crate::error::{MigrateError, Result};

/// Duplicate key in a unique index / primary key.
const DUPLICATE_KEY_ERRORS: [u32; 2] = [2601, 2627];

/// Claim attempts when the holder releases between the claim and the lookup.
const CLAIM_ATTEMPTS: usize = 3;

const SESSION_COLUMNS: &str = "database_name, session_id, source_server, counterparty_server, \
     counterparty_database, table_manifest_path, schema_from, schema_to, paths, tree_created, \
     active_stage, created_at, updated_at";

/// MSSQL session store.
pub struct MssqlSessionStore {
    pool: Pool<TiberiusConnectionManager>,
    schema: String,
}

impl MssqlSessionStore {
    pub fn new(pool: Pool<TiberiusConnectionManager>, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Connect to the configured store database.
    pub async fn connect(connection: &ConnectionConfig, store: &SessionStoreConfig) -> Result<Self> {
        let server = store.server.as_deref().ok_or_else(|| {
            MigrateError::Config("session_store.server is required for the mssql backend".into())
        })?;
        let database = store.database.as_deref().ok_or_else(|| {
            MigrateError::Config("session_store.database is required for the mssql backend".into())
        })?;
        let pool = TiberiusConnectionManager::new(connection, server, database)
            .pool()
            .await?;
        Ok(Self::new(pool, store.schema.clone()))
    }

    async fn get_conn(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "getting session store connection"))
    }

    fn table(&self, name: &str) -> String {
        format!("[{}].[{}]", self.schema.replace(']', "]]"), name)
    }

    fn row_to_session(row: &Row) -> Result<MigrationSession> {
        let text = |idx: usize, field: &str| -> Result<String> {
            row.try_get::<&str, _>(idx)?
                .map(str::to_string)
                .ok_or_else(|| MigrateError::State(format!("Failed to get {} from database", field)))
        };
        let optional_text =
            |idx: usize| -> Result<Option<String>> { Ok(row.try_get::<&str, _>(idx)?.map(str::to_string)) };

        let id: Uuid = row
            .try_get(1)?
            .ok_or_else(|| MigrateError::State("Failed to get session_id from database".into()))?;
        let paths = serde_json::from_str(&text(8, "paths")?)?;
        let created_at: DateTime<Utc> = row
            .try_get(11)?
            .ok_or_else(|| MigrateError::State("Failed to get created_at from database".into()))?;
        let updated_at: DateTime<Utc> = row
            .try_get(12)?
            .ok_or_else(|| MigrateError::State("Failed to get updated_at from database".into()))?;

        Ok(MigrationSession {
            id,
            database_name: text(0, "database_name")?,
            source_server: text(2, "source_server")?,
            counterparty_server: optional_text(3)?,
            counterparty_database: optional_text(4)?,
            table_manifest_path: optional_text(5)?.map(PathBuf::from),
            schema_from: text(6, "schema_from")?,
            schema_to: text(7, "schema_to")?,
            paths,
            tree_created: row.try_get::<bool, _>(9)?.unwrap_or(false),
            active_stage: row.try_get::<u8, _>(10)?,
            created_at,
            updated_at,
        })
    }

    fn is_duplicate_key(err: &tiberius::error::Error) -> bool {
        matches!(err, tiberius::error::Error::Server(token) if DUPLICATE_KEY_ERRORS.contains(&token.code()))
    }

    /// Map the insert-if-absent result: zero rows or a duplicate key means
    /// another caller already holds the row.
    fn insert_outcome(
        rows_affected: std::result::Result<u64, tiberius::error::Error>,
        database: &str,
    ) -> Result<InsertOutcome> {
        match rows_affected {
            Ok(0) => Ok(InsertOutcome::Existing),
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if Self::is_duplicate_key(&e) => {
                debug!("Duplicate key inserting session {}", database);
                Ok(InsertOutcome::Existing)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for MssqlSessionStore {
    async fn init_schema(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;

        // Create schema
        let sql = format!(
            "IF NOT EXISTS (SELECT * FROM sys.schemas WHERE name = @P1)
             BEGIN
                 EXEC('CREATE SCHEMA [{}]')
             END",
            self.schema.replace(']', "]]").replace('\'', "''")
        );
        conn.execute(sql, &[&self.schema.as_str()]).await?;

        let sql = format!(
            "IF NOT EXISTS (SELECT * FROM sys.tables WHERE name = 'migration_sessions' AND schema_id = SCHEMA_ID(@P1))
             BEGIN
                 CREATE TABLE {} (
                     database_name NVARCHAR(128) NOT NULL PRIMARY KEY,
                     session_id UNIQUEIDENTIFIER NOT NULL,
                     source_server NVARCHAR(256) NOT NULL,
                     counterparty_server NVARCHAR(256),
                     counterparty_database NVARCHAR(128),
                     table_manifest_path NVARCHAR(1024),
                     schema_from NVARCHAR(128) NOT NULL,
                     schema_to NVARCHAR(128) NOT NULL,
                     paths NVARCHAR(MAX) NOT NULL,
                     tree_created BIT NOT NULL,
                     active_stage TINYINT,
                     created_at DATETIMEOFFSET NOT NULL,
                     updated_at DATETIMEOFFSET NOT NULL
                 )
             END",
            self.table("migration_sessions")
        );
        conn.execute(sql, &[&self.schema.as_str()]).await?;

        let sql = format!(
            "IF NOT EXISTS (SELECT * FROM sys.tables WHERE name = 'session_progress' AND schema_id = SCHEMA_ID(@P1))
             BEGIN
                 CREATE TABLE {} (
                     database_name NVARCHAR(128) NOT NULL PRIMARY KEY,
                     data NVARCHAR(MAX) NOT NULL,
                     saved_at DATETIMEOFFSET NOT NULL
                 )
             END",
            self.table("session_progress")
        );
        conn.execute(sql, &[&self.schema.as_str()]).await?;

        Ok(())
    }

    async fn get(&self, database: &str) -> Result<Option<MigrationSession>> {
        let mut conn = self.get_conn().await?;
        let sql = format!(
            "SELECT {} FROM {} WHERE database_name = @P1",
            SESSION_COLUMNS,
            self.table("migration_sessions")
        );
        let row = conn.query(sql, &[&database]).await?.into_row().await?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn insert_if_absent(&self, session: &MigrationSession) -> Result<InsertOutcome> {
        let mut conn = self.get_conn().await?;
        let table = self.table("migration_sessions");
        let sql = format!(
            "INSERT INTO {table} ({cols})
             SELECT @P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8, @P9, @P10, NULL, @P11, @P12
             WHERE NOT EXISTS (
                 SELECT 1 FROM {table} WITH (UPDLOCK, HOLDLOCK) WHERE database_name = @P1
             )",
            table = table,
            cols = SESSION_COLUMNS
        );

        let paths = serde_json::to_string(&session.paths)?;
        let manifest = session
            .table_manifest_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let result = conn
            .execute(
                sql,
                &[
                    &session.database_name,
                    &session.id,
                    &session.source_server,
                    &session.counterparty_server,
                    &session.counterparty_database,
                    &manifest,
                    &session.schema_from,
                    &session.schema_to,
                    &paths,
                    &session.tree_created,
                    &session.created_at,
                    &session.updated_at,
                ],
            )
            .await;

        Self::insert_outcome(result.map(|done| done.total()), &session.database_name)
    }

    async fn update_counterparty(
        &self,
        database: &str,
        update: &CounterpartyUpdate,
    ) -> Result<MigrationSession> {
        let manifest = update
            .table_manifest_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());
        {
            let mut conn = self.get_conn().await?;
            let sql = format!(
                "UPDATE {}
                 SET counterparty_server = COALESCE(@P2, counterparty_server),
                     counterparty_database = COALESCE(@P3, counterparty_database),
                     table_manifest_path = COALESCE(@P4, table_manifest_path),
                     updated_at = SYSUTCDATETIME()
                 WHERE database_name = @P1",
                self.table("migration_sessions")
            );
            let done = conn
                .execute(
                    sql,
                    &[&database, &update.server, &update.database, &manifest],
                )
                .await?;
            if done.total() == 0 {
                return Err(MigrateError::SessionNotFound(database.to_string()));
            }
        }
        self.get(database)
            .await?
            .ok_or_else(|| MigrateError::SessionNotFound(database.to_string()))
    }

    async fn try_begin_stage(&self, database: &str, stage: u8) -> Result<StageClaim> {
        let mut conn = self.get_conn().await?;
        let table = self.table("migration_sessions");

        let sql = format!(
            "UPDATE {} SET active_stage = @P2, updated_at = SYSUTCDATETIME()
             WHERE database_name = @P1 AND active_stage IS NULL",
            table
        );
        let holder_sql = format!("SELECT active_stage FROM {} WHERE database_name = @P1", table);

        for _ in 0..CLAIM_ATTEMPTS {
            let done = conn.execute(sql.as_str(), &[&database, &stage]).await?;
            if done.total() > 0 {
                return Ok(StageClaim::Acquired);
            }

            let row = conn
                .query(holder_sql.as_str(), &[&database])
                .await?
                .into_row()
                .await?;
            match row {
                None => return Err(MigrateError::SessionNotFound(database.to_string())),
                Some(row) => {
                    if let Some(holder) = row.try_get::<u8, _>(0)? {
                        return Ok(StageClaim::Busy(holder));
                    }
                }
            }
            debug!("Stage flag on {} was released concurrently, claiming again", database);
        }
        Err(MigrateError::State(format!(
            "Could not claim the stage flag for {}",
            database
        )))
    }

    async fn end_stage(&self, database: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let sql = format!(
            "UPDATE {} SET active_stage = NULL, updated_at = SYSUTCDATETIME() WHERE database_name = @P1",
            self.table("migration_sessions")
        );
        conn.execute(sql, &[&database]).await?;
        Ok(())
    }

    async fn save_progress(&self, database: &str, data: &serde_json::Value) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let sql = format!(
            "MERGE {} AS target
             USING (SELECT @P1 AS database_name) AS source
             ON target.database_name = source.database_name
             WHEN MATCHED THEN
                 UPDATE SET data = @P2, saved_at = @P3
             WHEN NOT MATCHED THEN
                 INSERT (database_name, data, saved_at) VALUES (@P1, @P2, @P3);",
            self.table("session_progress")
        );
        let content = serde_json::to_string(data)?;
        conn.execute(sql, &[&database, &content, &Utc::now()]).await?;
        Ok(())
    }

    async fn recover_progress(&self, database: &str) -> Result<Option<ProgressSnapshot>> {
        let mut conn = self.get_conn().await?;
        let sql = format!(
            "SELECT data, saved_at FROM {} WHERE database_name = @P1",
            self.table("session_progress")
        );
        let Some(row) = conn.query(sql, &[&database]).await?.into_row().await? else {
            return Ok(None);
        };
        let data: &str = row
            .try_get(0)?
            .ok_or_else(|| MigrateError::State("Failed to get progress data from database".into()))?;
        let saved_at: DateTime<Utc> = row
            .try_get(1)?
            .ok_or_else(|| MigrateError::State("Failed to get saved_at from database".into()))?;
        Ok(Some(ProgressSnapshot {
            database_name: database.to_string(),
            data: serde_json::from_str(data)?,
            saved_at,
        }))
    }

    async fn delete_progress(&self, database: &str) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let sql = format!(
            "DELETE FROM {} WHERE database_name = @P1",
            self.table("session_progress")
        );
        let done = conn.execute(sql, &[&database]).await?;
        Ok(done.total() > 0)
    }

    fn backend_type(&self) -> &'static str {
        "mssql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiberius::error::{Error, IoErrorKind, TokenError};

    fn server_error(code: u32) -> Error {
        Error::Server(TokenError::new(
            code,
            1,
            14,
            "Violation of PRIMARY KEY constraint".into(),
            "sqlhost".into(),
            String::new(),
            1,
        ))
    }

    #[test]
    fn test_insert_outcome_rows_affected() {
        assert_eq!(
            MssqlSessionStore::insert_outcome(Ok(1), "Sales").unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            MssqlSessionStore::insert_outcome(Ok(0), "Sales").unwrap(),
            InsertOutcome::Existing
        );
    }

    #[test]
    fn test_insert_outcome_duplicate_key_is_existing() {
        for code in DUPLICATE_KEY_ERRORS {
            assert_eq!(
                MssqlSessionStore::insert_outcome(Err(server_error(code)), "Sales").unwrap(),
                InsertOutcome::Existing
            );
        }
    }

    #[test]
    fn test_insert_outcome_other_errors_propagate() {
        let err = MssqlSessionStore::insert_outcome(Err(server_error(208)), "Sales").unwrap_err();
        assert!(matches!(err, MigrateError::Database(_)));

        let io = Error::Io {
            kind: IoErrorKind::ConnectionReset,
            message: "reset".into(),
        };
        let err = MssqlSessionStore::insert_outcome(Err(io), "Sales").unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
