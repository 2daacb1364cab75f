//! Catalog probes and connections to migrated databases.
//!
//! Stage validations are read-only catalog queries; the only mutating
//! statement is the per-type `ALTER SCHEMA ... TRANSFER TYPE::` used after
//! stage 3. Everything here sits behind traits so stages can be exercised
//! against in-memory catalogs.

mod mssql;

pub use mssql::{MssqlCatalog, MssqlConnector, MssqlTableSink, MssqlTableSource, TiberiusConnectionManager};

use crate::error::{MigrateError, Result};
use crate::transfer::{TableSink, TableSource};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// A foreign key constraint as listed by stage 12.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    /// `schema.table` owning the constraint.
    pub table: String,
    /// `schema.table` it references.
    pub referenced_table: String,
}

/// Read-only catalog queries against one database.
///
/// All counts are `COUNT_BIG` results. Schema arguments are schema names, not
/// quoted identifiers.
#[async_trait]
pub trait CatalogProbe: Send + Sync {
    /// Views in `schema` created `WITH SCHEMABINDING`.
    async fn count_schema_bound_views(&self, schema: &str) -> Result<i64>;

    /// All objects owned by `schema`.
    async fn count_objects_in_schema(&self, schema: &str) -> Result<i64>;

    /// Objects in `schema` that hang off a parent (`parent_object_id <> 0`).
    async fn count_child_objects(&self, schema: &str) -> Result<i64>;

    /// Names of user-defined types in `schema`.
    async fn list_user_types(&self, schema: &str) -> Result<Vec<String>>;

    /// `ALTER SCHEMA [to] TRANSFER TYPE::[from].[type_name]`.
    async fn transfer_user_type(&self, type_name: &str, from: &str, to: &str) -> Result<()>;

    async fn count_user_types(&self, schema: &str) -> Result<i64>;

    /// Procedures, views, functions and triggers (`P, V, FN, FS, FT, TR`).
    async fn count_exportable_objects(&self) -> Result<i64>;

    async fn count_foreign_keys(&self) -> Result<i64>;

    async fn list_foreign_keys(&self) -> Result<Vec<ForeignKeyInfo>>;

    /// Whether an object with this name exists in `sys.objects`.
    async fn table_exists(&self, name: &str) -> Result<bool>;

    /// Row count of an unqualified or `schema.table` name.
    async fn count_table_rows(&self, name: &str) -> Result<i64>;

    /// Unqualified names from `sys.tables`.
    async fn list_table_names(&self) -> Result<Vec<String>>;

    /// Online, non-system databases on the server.
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Round-trip `SELECT 1`.
    async fn ping(&self) -> Result<()>;
}

/// Opens catalogs and table endpoints for `(server, database)` pairs.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn catalog(&self, server: &str, database: &str) -> Result<Arc<dyn CatalogProbe>>;

    async fn table_source(&self, server: &str, database: &str) -> Result<Box<dyn TableSource>>;

    async fn table_sink(&self, server: &str, database: &str) -> Result<Box<dyn TableSink>>;
}

/// Outcome of moving every user-defined type between schemas.
#[derive(Debug, Default)]
pub struct TypeTransferReport {
    pub transferred: Vec<String>,
    /// `PerObjectTransferFailure` for each type that could not be moved.
    pub failures: Vec<MigrateError>,
}

impl TypeTransferReport {
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .transferred
            .iter()
            .map(|t| format!("Transferred type {}", t))
            .collect();
        lines.extend(self.failures.iter().map(|e| e.to_string()));
        lines
    }
}

/// Move every user-defined type from `from` to `to`, one statement per type.
///
/// A failing type is recorded and the loop continues.
pub async fn transfer_user_types(
    probe: &dyn CatalogProbe,
    from: &str,
    to: &str,
) -> Result<TypeTransferReport> {
    let types = probe.list_user_types(from).await?;
    let mut report = TypeTransferReport::default();

    for type_name in types {
        match probe.transfer_user_type(&type_name, from, to).await {
            Ok(()) => report.transferred.push(type_name),
            Err(e) => {
                warn!("Type {}.{} not transferred: {}", from, type_name, e);
                report.failures.push(MigrateError::PerObjectTransferFailure {
                    object: format!("{}.{}", from, type_name),
                    message: e.to_string(),
                });
            }
        }
    }

    info!(
        "Transferred {} user types from {} to {} ({} failed)",
        report.transferred.len(),
        from,
        to,
        report.failures.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCatalog;

    #[tokio::test]
    async fn test_transfer_user_types_contains_failures() {
        let catalog = MockCatalog::default();
        {
            let mut state = catalog.state.lock().unwrap();
            state.user_types.insert(
                "corpuser".into(),
                vec!["Phone".into(), "Broken".into(), "Email".into()],
            );
            state.failing_types.insert("Broken".into());
        }

        let report = transfer_user_types(&catalog, "corpuser", "sales").await.unwrap();
        assert_eq!(report.transferred, vec!["Phone".to_string(), "Email".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.lines()[2].contains("corpuser.Broken"));
        assert_eq!(catalog.count_user_types("sales").await.unwrap(), 2);
        assert_eq!(catalog.count_user_types("corpuser").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transfer_with_no_types_is_empty() {
        let catalog = MockCatalog::default();
        let report = transfer_user_types(&catalog, "corpuser", "sales").await.unwrap();
        assert!(report.transferred.is_empty());
        assert!(report.failures.is_empty());
    }
}
