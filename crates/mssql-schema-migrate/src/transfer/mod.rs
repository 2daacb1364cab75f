//! Row mover: paged table copy between two SQL Server databases.
//!
//! Rows are read in source column order, one `OFFSET/FETCH` page at a time,
//! ordered by a stable key, and written as multi-row parameterized `INSERT`s.
//! When the destination table has an identity column, `IDENTITY_INSERT` is
//! switched on for the copy and always switched off again afterwards.

mod checkpoint;
mod value;

pub use checkpoint::{RowMoveCheckpoint, TableProgress, TaskStatus, CHECKPOINT_FILE};
pub use value::{convert_row_value, is_orderable_type, is_supported_type, to_sql_param, SqlNullType, SqlValue};

use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// SQL Server rejects statements with more than 2100 parameters.
pub const MAX_PARAMS_PER_STATEMENT: usize = 2000;

/// A `schema.table` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTable {
    pub schema: String,
    pub name: String,
}

impl QualifiedTable {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Bracket-quoted `[schema].[name]`.
    pub fn quoted(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Quote an MSSQL identifier with brackets.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    /// SQL Server base type name (`int`, `nvarchar`, ...).
    pub data_type: String,
    pub is_identity: bool,
}

/// Copyable shape of a source table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableShape {
    /// Columns in ordinal order, computed and rowversion columns excluded.
    pub columns: Vec<ColumnMeta>,
    /// Stable ordering key for paging. Empty means the table cannot be paged.
    pub order_by: Vec<String>,
}

impl TableShape {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Choose the paging key: primary key, else identity, else every
    /// orderable column.
    pub fn choose_order_by(columns: &[ColumnMeta], primary_key: Vec<String>) -> Vec<String> {
        if !primary_key.is_empty() {
            return primary_key;
        }
        if let Some(identity) = columns.iter().find(|c| c.is_identity) {
            return vec![identity.name.clone()];
        }
        columns
            .iter()
            .filter(|c| is_orderable_type(&c.data_type))
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Reads pages of rows from a table.
#[async_trait]
pub trait TableSource: Send {
    /// Column list and paging key. Errors if the table does not exist.
    async fn describe(&mut self, table: &QualifiedTable) -> Result<TableShape>;

    /// Read up to `limit` rows starting at `offset` in `shape.order_by` order.
    async fn fetch_page(
        &mut self,
        table: &QualifiedTable,
        shape: &TableShape,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Vec<SqlValue>>>;
}

/// Writes rows into a table.
#[async_trait]
pub trait TableSink: Send {
    async fn has_identity(&mut self, table: &QualifiedTable) -> Result<bool>;

    async fn set_identity_insert(&mut self, table: &QualifiedTable, enabled: bool) -> Result<()>;

    /// Insert rows, returning the number written.
    async fn insert_rows(
        &mut self,
        table: &QualifiedTable,
        columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64>;
}

/// Options for a single table copy.
#[derive(Debug, Clone, Copy)]
pub struct MoveOptions {
    /// Rows per page.
    pub batch_rows: usize,
    /// Rows already committed by an earlier run.
    pub resume_offset: u64,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            batch_rows: 1000,
            resume_offset: 0,
        }
    }
}

/// Statistics from a table copy.
#[derive(Debug, Clone, Default)]
pub struct MoveStats {
    /// Rows written by this call.
    pub rows_copied: u64,
    /// Rows committed in total, including the resume offset.
    pub rows_committed: u64,
    pub pages: u32,
    pub identity_insert: bool,
    pub elapsed: Duration,
}

/// Rows that fit in one INSERT for a given column count.
pub fn rows_per_insert(column_count: usize) -> usize {
    if column_count == 0 {
        return 1;
    }
    (MAX_PARAMS_PER_STATEMENT / column_count).max(1)
}

/// Build `INSERT INTO t (cols) VALUES (@P1, @P2), (@P3, @P4), ...`.
pub fn build_insert_sql(table: &QualifiedTable, columns: &[String], row_count: usize) -> String {
    let col_str = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut param_idx = 1;
    let mut value_groups = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let placeholders: Vec<String> = (0..columns.len())
            .map(|_| {
                let p = format!("@P{}", param_idx);
                param_idx += 1;
                p
            })
            .collect();
        value_groups.push(format!("({})", placeholders.join(", ")));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table.quoted(),
        col_str,
        value_groups.join(", ")
    )
}

/// Build the paged `SELECT` for a table.
///
/// Without an ordering key the whole table is read in one statement.
pub fn build_page_sql(table: &QualifiedTable, shape: &TableShape) -> String {
    let cols = shape
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    if shape.order_by.is_empty() {
        return format!("SELECT {} FROM {}", cols, table.quoted());
    }
    let order = shape
        .order_by
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {} FROM {} ORDER BY {} OFFSET @P1 ROWS FETCH NEXT @P2 ROWS ONLY",
        cols,
        table.quoted(),
        order
    )
}

/// Copy every row of `table` from `source` to `sink`.
///
/// `on_page` is called with the committed row total after each page, so the
/// caller can persist a checkpoint. Identity insert is turned off on every
/// exit path once it has been turned on.
pub async fn move_table<S, T, F>(
    source: &mut S,
    sink: &mut T,
    table: &QualifiedTable,
    options: MoveOptions,
    mut on_page: F,
) -> Result<MoveStats>
where
    S: TableSource + ?Sized,
    T: TableSink + ?Sized,
    F: FnMut(u64) -> Result<()> + Send,
{
    let started = Instant::now();
    let shape = source.describe(table).await?;
    if shape.columns.is_empty() {
        return Err(MigrateError::transfer(
            table.to_string(),
            "no copyable columns in source",
        ));
    }
    if shape.order_by.is_empty() && options.resume_offset > 0 {
        return Err(MigrateError::transfer(
            table.to_string(),
            "cannot resume a table without an orderable key",
        ));
    }

    let identity = sink.has_identity(table).await?;
    if identity {
        debug!("Enabling IDENTITY_INSERT on {}", table);
        sink.set_identity_insert(table, true).await?;
    }

    let copied = copy_pages(source, sink, table, &shape, options, &mut on_page).await;

    if identity {
        let off = sink.set_identity_insert(table, false).await;
        match (&copied, off) {
            (Ok(_), Err(e)) => return Err(e),
            (Err(_), Err(e)) => warn!("Failed to disable IDENTITY_INSERT on {}: {}", table, e),
            _ => {}
        }
    }

    let (rows_copied, pages) = copied?;
    let stats = MoveStats {
        rows_copied,
        rows_committed: options.resume_offset + rows_copied,
        pages,
        identity_insert: identity,
        elapsed: started.elapsed(),
    };
    info!(
        "Copied {} rows into {} in {} pages ({:.2}s)",
        stats.rows_copied,
        table,
        stats.pages,
        stats.elapsed.as_secs_f64()
    );
    Ok(stats)
}

async fn copy_pages<S, T, F>(
    source: &mut S,
    sink: &mut T,
    table: &QualifiedTable,
    shape: &TableShape,
    options: MoveOptions,
    on_page: &mut F,
) -> Result<(u64, u32)>
where
    S: TableSource + ?Sized,
    T: TableSink + ?Sized,
    F: FnMut(u64) -> Result<()> + Send,
{
    let batch_rows = options.batch_rows.max(1);
    let columns = shape.column_names();
    let paged = !shape.order_by.is_empty();

    let mut offset = options.resume_offset;
    let mut copied = 0u64;
    let mut pages = 0u32;

    loop {
        let page = source.fetch_page(table, shape, offset, batch_rows).await?;
        if page.is_empty() {
            break;
        }
        let fetched = page.len();
        let written = sink.insert_rows(table, &columns, &page).await?;
        copied += written;
        offset += written;
        pages += 1;
        on_page(offset)?;
        debug!("{}: page {} committed, {} rows total", table, pages, offset);

        if !paged || fetched < batch_rows {
            break;
        }
    }
    Ok((copied, pages))
}
