//! SQL Server catalog and table endpoints over tiberius + bb8.

use super::{CatalogProbe, Connector, ForeignKeyInfo};
use crate::config::ConnectionConfig;
use crate::error::{MigrateError, Result};
use crate::manifest::ManifestTable;
use crate::transfer::{
    build_insert_sql, build_page_sql, convert_row_value, is_supported_type, quote_ident,
    rows_per_insert, to_sql_param, ColumnMeta, QualifiedTable, SqlValue, TableShape, TableSink,
    TableSource,
};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

type MssqlClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    connection: ConnectionConfig,
    host: String,
    port: u16,
    database: String,
}

impl TiberiusConnectionManager {
    pub fn new(connection: &ConnectionConfig, server: &str, database: &str) -> Self {
        let (host, port) = connection.host_and_port(server);
        Self {
            connection: connection.clone(),
            host,
            port,
            database: database.to_string(),
        }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.authentication(AuthMethod::sql_server(
            &self.connection.user,
            &self.connection.password,
        ));

        if self.connection.encrypt_enabled() {
            config.encryption(EncryptionLevel::Required);
            if self.connection.trust_server_cert {
                config.trust_cert();
            }
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }

    /// Build a pool and verify it with a round trip.
    pub async fn pool(self) -> Result<Pool<Self>> {
        let label = format!("{}:{}/{}", self.host, self.port, self.database);
        let pool = Pool::builder()
            .max_size(self.connection.pool_size)
            .connection_timeout(self.connection.connect_timeout())
            .build(self)
            .await
            .map_err(|e| MigrateError::pool(e, format!("creating pool for {}", label)))?;

        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| MigrateError::pool(e, format!("testing connection to {}", label)))?;
            simple_batch(&mut conn, "SELECT 1").await?;
        }

        info!("Connected to SQL Server: {}", label);
        Ok(pool)
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let timeout = self.connection.connect_timeout();
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(config.get_addr()))
            .await
            .map_err(|_| tiberius::error::Error::Io {
                kind: std::io::ErrorKind::TimedOut,
                message: format!(
                    "connecting to {}:{} timed out after {}s",
                    self.host,
                    self.port,
                    timeout.as_secs()
                ),
            })?
            .map_err(|e| tiberius::error::Error::Io {
                kind: e.kind(),
                message: e.to_string(),
            })?;

        tcp.set_nodelay(true).ok();

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Run a parameterless batch and drain its results.
///
/// `SET` options and transaction control must not go through
/// `sp_executesql`, whose scope would discard them.
pub(crate) async fn simple_batch(conn: &mut MssqlClient, sql: &str) -> Result<()> {
    conn.simple_query(sql).await?.into_results().await?;
    Ok(())
}

fn first_i64(row: Option<Row>) -> Result<i64> {
    match row {
        Some(row) => Ok(row.try_get::<i64, _>(0)?.unwrap_or(0)),
        None => Ok(0),
    }
}

fn string_column(row: &Row, idx: usize) -> Result<String> {
    row.try_get::<&str, _>(idx)?
        .map(str::to_string)
        .ok_or_else(|| MigrateError::State(format!("unexpected NULL in column {}", idx)))
}

/// Catalog probe over a pooled connection to one database.
pub struct MssqlCatalog {
    pool: Pool<TiberiusConnectionManager>,
    label: String,
}

impl MssqlCatalog {
    pub fn new(pool: Pool<TiberiusConnectionManager>, server: &str, database: &str) -> Self {
        Self {
            pool,
            label: format!("{}/{}", server, database),
        }
    }

    /// Connect to `server`/`database` with a fresh pool.
    pub async fn connect(config: &ConnectionConfig, server: &str, database: &str) -> Result<Self> {
        let pool = TiberiusConnectionManager::new(config, server, database)
            .pool()
            .await?;
        Ok(Self::new(pool, server, database))
    }

    async fn get_conn(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("getting connection to {}", self.label)))
    }

    async fn query_count(&self, sql: &str, params: &[&dyn ToSql]) -> Result<i64> {
        let mut conn = self.get_conn().await?;
        debug!("{}: {}", self.label, sql);
        let row = conn.query(sql, params).await?.into_row().await?;
        first_i64(row)
    }

    async fn query_strings(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<String>> {
        let mut conn = self.get_conn().await?;
        debug!("{}: {}", self.label, sql);
        let rows = conn.query(sql, params).await?.into_first_result().await?;
        rows.iter().map(|r| string_column(r, 0)).collect()
    }
}

#[async_trait]
impl CatalogProbe for MssqlCatalog {
    async fn count_schema_bound_views(&self, schema: &str) -> Result<i64> {
        self.query_count(
            "SELECT COUNT_BIG(*) FROM sys.views \
             WHERE OBJECTPROPERTY(object_id, 'IsSchemaBound') = 1 AND schema_id = SCHEMA_ID(@P1)",
            &[&schema],
        )
        .await
    }

    async fn count_objects_in_schema(&self, schema: &str) -> Result<i64> {
        self.query_count(
            "SELECT COUNT_BIG(*) FROM sys.objects WHERE schema_id = SCHEMA_ID(@P1)",
            &[&schema],
        )
        .await
    }

    async fn count_child_objects(&self, schema: &str) -> Result<i64> {
        self.query_count(
            "SELECT COUNT_BIG(*) FROM sys.objects \
             WHERE schema_id = SCHEMA_ID(@P1) AND parent_object_id <> 0",
            &[&schema],
        )
        .await
    }

    async fn list_user_types(&self, schema: &str) -> Result<Vec<String>> {
        self.query_strings(
            "SELECT name FROM sys.types \
             WHERE schema_id = SCHEMA_ID(@P1) AND is_user_defined = 1 ORDER BY name",
            &[&schema],
        )
        .await
    }

    async fn transfer_user_type(&self, type_name: &str, from: &str, to: &str) -> Result<()> {
        let sql = format!(
            "ALTER SCHEMA {} TRANSFER TYPE::{}.{}",
            quote_ident(to),
            quote_ident(from),
            quote_ident(type_name)
        );
        let mut conn = self.get_conn().await?;
        debug!("{}: {}", self.label, sql);
        simple_batch(&mut conn, &sql).await
    }

    async fn count_user_types(&self, schema: &str) -> Result<i64> {
        self.query_count(
            "SELECT COUNT_BIG(*) FROM sys.types \
             WHERE schema_id = SCHEMA_ID(@P1) AND is_user_defined = 1",
            &[&schema],
        )
        .await
    }

    async fn count_exportable_objects(&self) -> Result<i64> {
        self.query_count(
            "SELECT COUNT_BIG(*) FROM sys.objects WHERE type IN ('P', 'V', 'FN', 'FS', 'FT', 'TR')",
            &[],
        )
        .await
    }

    async fn count_foreign_keys(&self) -> Result<i64> {
        self.query_count("SELECT COUNT_BIG(*) FROM sys.foreign_keys", &[])
            .await
    }

    async fn list_foreign_keys(&self) -> Result<Vec<ForeignKeyInfo>> {
        let sql = r#"SELECT fk.name,
                   SCHEMA_NAME(pt.schema_id) + '.' + pt.name,
                   SCHEMA_NAME(rt.schema_id) + '.' + rt.name
            FROM sys.foreign_keys fk
            JOIN sys.tables pt ON pt.object_id = fk.parent_object_id
            JOIN sys.tables rt ON rt.object_id = fk.referenced_object_id
            ORDER BY 2, 1"#;
        let mut conn = self.get_conn().await?;
        let rows = conn.query(sql, &[]).await?.into_first_result().await?;
        rows.iter()
            .map(|r| {
                Ok(ForeignKeyInfo {
                    name: string_column(r, 0)?,
                    table: string_column(r, 1)?,
                    referenced_table: string_column(r, 2)?,
                })
            })
            .collect()
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let count = self
            .query_count("SELECT COUNT_BIG(*) FROM sys.objects WHERE name = @P1", &[&name])
            .await?;
        Ok(count > 0)
    }

    async fn count_table_rows(&self, name: &str) -> Result<i64> {
        let table = ManifestTable::parse(name)
            .ok_or_else(|| MigrateError::Config(format!("invalid table name '{}'", name)))?;
        let sql = format!("SELECT COUNT_BIG(*) FROM {}", table.quoted());
        self.query_count(&sql, &[]).await
    }

    async fn list_table_names(&self) -> Result<Vec<String>> {
        self.query_strings("SELECT name FROM sys.tables ORDER BY name", &[])
            .await
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.query_strings(
            "SELECT name FROM sys.databases \
             WHERE state_desc = 'ONLINE' AND name NOT IN ('master', 'tempdb', 'model', 'msdb') \
             ORDER BY name",
            &[],
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get_conn().await?;
        simple_batch(&mut conn, "SELECT 1").await
    }
}

/// Reads table pages over a dedicated connection.
pub struct MssqlTableSource {
    conn: PooledConnection<'static, TiberiusConnectionManager>,
}

#[async_trait]
impl TableSource for MssqlTableSource {
    async fn describe(&mut self, table: &QualifiedTable) -> Result<TableShape> {
        let sql = r#"SELECT c.name, TYPE_NAME(c.system_type_id), c.is_identity
            FROM sys.columns c
            JOIN sys.tables t ON c.object_id = t.object_id
            JOIN sys.schemas s ON t.schema_id = s.schema_id
            WHERE s.name = @P1 AND t.name = @P2 AND c.is_computed = 0
            ORDER BY c.column_id"#;
        let rows = self
            .conn
            .query(sql, &[&table.schema.as_str(), &table.name.as_str()])
            .await?
            .into_first_result()
            .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = string_column(row, 0)?;
            let data_type = string_column(row, 1)?;
            if data_type.eq_ignore_ascii_case("timestamp") {
                debug!("{}: skipping rowversion column {}", table, name);
                continue;
            }
            if !is_supported_type(&data_type) {
                return Err(MigrateError::transfer(
                    table.to_string(),
                    format!("column {} has unsupported type {}", name, data_type),
                ));
            }
            columns.push(ColumnMeta {
                name,
                data_type,
                is_identity: row.try_get::<bool, _>(2)?.unwrap_or(false),
            });
        }
        if columns.is_empty() {
            return Err(MigrateError::transfer(
                table.to_string(),
                "table not found in source",
            ));
        }

        let pk_sql = r#"SELECT c.name
            FROM sys.indexes i
            JOIN sys.index_columns ic ON i.object_id = ic.object_id AND i.index_id = ic.index_id
            JOIN sys.columns c ON ic.object_id = c.object_id AND ic.column_id = c.column_id
            WHERE i.is_primary_key = 1 AND i.object_id = OBJECT_ID(@P1)
            ORDER BY ic.key_ordinal"#;
        let quoted = table.quoted();
        let pk_rows = self
            .conn
            .query(pk_sql, &[&quoted.as_str()])
            .await?
            .into_first_result()
            .await?;
        let primary_key = pk_rows
            .iter()
            .map(|r| string_column(r, 0))
            .collect::<Result<Vec<_>>>()?;

        let order_by = TableShape::choose_order_by(&columns, primary_key);
        if order_by.is_empty() {
            warn!("{} has no orderable columns; it will be copied in one pass", table);
        }
        Ok(TableShape { columns, order_by })
    }

    async fn fetch_page(
        &mut self,
        table: &QualifiedTable,
        shape: &TableShape,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Vec<SqlValue>>> {
        let sql = build_page_sql(table, shape);
        let rows = if shape.order_by.is_empty() {
            if offset > 0 {
                return Ok(Vec::new());
            }
            self.conn.query(sql.as_str(), &[]).await?.into_first_result().await?
        } else {
            let offset = offset as i64;
            let limit = limit as i64;
            self.conn
                .query(sql.as_str(), &[&offset, &limit])
                .await?
                .into_first_result()
                .await?
        };

        let mut page = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = shape
                .columns
                .iter()
                .enumerate()
                .map(|(idx, col)| {
                    convert_row_value(row, idx, &col.data_type).map_err(|e| {
                        MigrateError::transfer(table.to_string(), format!("{}: {}", col.name, e))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            page.push(values);
        }
        Ok(page)
    }
}

/// Writes rows over a dedicated connection so `IDENTITY_INSERT` stays in scope.
pub struct MssqlTableSink {
    conn: PooledConnection<'static, TiberiusConnectionManager>,
}

#[async_trait]
impl TableSink for MssqlTableSink {
    async fn has_identity(&mut self, table: &QualifiedTable) -> Result<bool> {
        let query = r#"SELECT COUNT_BIG(*)
               FROM sys.columns c
               JOIN sys.tables t ON c.object_id = t.object_id
               JOIN sys.schemas s ON t.schema_id = s.schema_id
               WHERE s.name = @P1 AND t.name = @P2 AND c.is_identity = 1"#;
        debug!("Identity check query for {}", table);
        let row = self
            .conn
            .query(query, &[&table.schema.as_str(), &table.name.as_str()])
            .await?
            .into_row()
            .await?;
        Ok(first_i64(row)? > 0)
    }

    async fn set_identity_insert(&mut self, table: &QualifiedTable, enabled: bool) -> Result<()> {
        let sql = format!(
            "SET IDENTITY_INSERT {} {}",
            table.quoted(),
            if enabled { "ON" } else { "OFF" }
        );
        simple_batch(&mut self.conn, &sql).await
    }

    async fn insert_rows(
        &mut self,
        table: &QualifiedTable,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        simple_batch(&mut self.conn, "BEGIN TRANSACTION").await?;
        match insert_batches(&mut self.conn, table, columns, rows).await {
            Ok(inserted) => {
                simple_batch(&mut self.conn, "COMMIT TRANSACTION").await?;
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback) =
                    simple_batch(&mut self.conn, "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION").await
                {
                    warn!("Rollback failed for {}: {}", table, rollback);
                }
                Err(e)
            }
        }
    }
}

async fn insert_batches(
    conn: &mut MssqlClient,
    table: &QualifiedTable,
    columns: &[String],
    rows: &[Vec<SqlValue>],
) -> Result<u64> {
    let mut total_inserted = 0u64;
    for batch in rows.chunks(rows_per_insert(columns.len())) {
        let sql = build_insert_sql(table, columns, batch.len());

        let params: Vec<Box<dyn ToSql>> = batch
            .iter()
            .flat_map(|row| row.iter().map(to_sql_param))
            .collect();
        let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.execute(sql.as_str(), &param_refs).await.map_err(|e| {
            MigrateError::transfer(
                table.to_string(),
                format!("batched INSERT ({} rows): {}", batch.len(), e),
            )
        })?;
        total_inserted += batch.len() as u64;
    }
    Ok(total_inserted)
}

/// Opens pooled connections per `(server, database)`, reusing pools.
pub struct MssqlConnector {
    config: ConnectionConfig,
    pools: Mutex<HashMap<(String, String), Pool<TiberiusConnectionManager>>>,
}

impl MssqlConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn pool(&self, server: &str, database: &str) -> Result<Pool<TiberiusConnectionManager>> {
        let key = (server.to_lowercase(), database.to_lowercase());
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        let pool = TiberiusConnectionManager::new(&self.config, server, database)
            .pool()
            .await?;
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    async fn dedicated(
        &self,
        server: &str,
        database: &str,
    ) -> Result<PooledConnection<'static, TiberiusConnectionManager>> {
        self.pool(server, database)
            .await?
            .get_owned()
            .await
            .map_err(|e| MigrateError::pool(e, format!("getting connection to {}/{}", server, database)))
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    async fn catalog(&self, server: &str, database: &str) -> Result<Arc<dyn CatalogProbe>> {
        let pool = self.pool(server, database).await?;
        Ok(Arc::new(MssqlCatalog::new(pool, server, database)))
    }

    async fn table_source(&self, server: &str, database: &str) -> Result<Box<dyn TableSource>> {
        Ok(Box::new(MssqlTableSource {
            conn: self.dedicated(server, database).await?,
        }))
    }

    async fn table_sink(&self, server: &str, database: &str) -> Result<Box<dyn TableSink>> {
        Ok(Box::new(MssqlTableSink {
            conn: self.dedicated(server, database).await?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            user: "migrator".into(),
            password: "secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_manager_splits_server_port() {
        let manager = TiberiusConnectionManager::new(&connection(), "sqlhost,1500", "Sales");
        assert_eq!(manager.host, "sqlhost");
        assert_eq!(manager.port, 1500);
        assert_eq!(manager.database, "Sales");

        let manager = TiberiusConnectionManager::new(&connection(), "sqlhost", "Sales");
        assert_eq!(manager.port, 1433);
    }

    #[test]
    fn test_build_config_addr() {
        let manager = TiberiusConnectionManager::new(&connection(), "sqlhost,1500", "Sales");
        assert_eq!(manager.build_config().get_addr(), "sqlhost:1500");
    }
}
