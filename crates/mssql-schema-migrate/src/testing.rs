//! In-memory catalog, table endpoints and tool runner for unit tests.

use crate::catalog::{CatalogProbe, Connector, ForeignKeyInfo};
use crate::error::{MigrateError, Result};
use crate::tool::{ToolInvocation, ToolOutput, ToolRunner};
use crate::transfer::{QualifiedTable, SqlValue, TableShape, TableSink, TableSource};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Mutable catalog contents behind [`MockCatalog`].
#[derive(Debug, Default)]
pub struct CatalogState {
    pub schema_bound_views: HashMap<String, i64>,
    pub objects_in_schema: HashMap<String, i64>,
    pub child_objects: HashMap<String, i64>,
    pub user_types: HashMap<String, Vec<String>>,
    pub failing_types: HashSet<String>,
    pub exportable_objects: i64,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Unqualified table names.
    pub tables: Vec<String>,
    pub table_rows: HashMap<String, i64>,
    pub databases: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MockCatalog {
    pub state: Mutex<CatalogState>,
}

impl MockCatalog {
    fn read<T>(&self, f: impl FnOnce(&CatalogState) -> T) -> Result<T> {
        let state = self
            .state
            .lock()
            .map_err(|_| MigrateError::State("catalog lock poisoned".into()))?;
        Ok(f(&state))
    }
}

#[async_trait]
impl CatalogProbe for MockCatalog {
    async fn count_schema_bound_views(&self, schema: &str) -> Result<i64> {
        self.read(|s| s.schema_bound_views.get(schema).copied().unwrap_or(0))
    }

    async fn count_objects_in_schema(&self, schema: &str) -> Result<i64> {
        self.read(|s| s.objects_in_schema.get(schema).copied().unwrap_or(0))
    }

    async fn count_child_objects(&self, schema: &str) -> Result<i64> {
        self.read(|s| s.child_objects.get(schema).copied().unwrap_or(0))
    }

    async fn list_user_types(&self, schema: &str) -> Result<Vec<String>> {
        self.read(|s| s.user_types.get(schema).cloned().unwrap_or_default())
    }

    async fn transfer_user_type(&self, type_name: &str, from: &str, to: &str) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| MigrateError::State("catalog lock poisoned".into()))?;
        if state.failing_types.contains(type_name) {
            return Err(MigrateError::State(format!(
                "Cannot transfer a schema bound object: {}",
                type_name
            )));
        }
        if let Some(types) = state.user_types.get_mut(from) {
            types.retain(|t| t != type_name);
        }
        state
            .user_types
            .entry(to.to_string())
            .or_default()
            .push(type_name.to_string());
        Ok(())
    }

    async fn count_user_types(&self, schema: &str) -> Result<i64> {
        self.read(|s| s.user_types.get(schema).map(|t| t.len() as i64).unwrap_or(0))
    }

    async fn count_exportable_objects(&self) -> Result<i64> {
        self.read(|s| s.exportable_objects)
    }

    async fn count_foreign_keys(&self) -> Result<i64> {
        self.read(|s| s.foreign_keys.len() as i64)
    }

    async fn list_foreign_keys(&self) -> Result<Vec<ForeignKeyInfo>> {
        self.read(|s| s.foreign_keys.clone())
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        self.read(|s| s.tables.iter().any(|t| t.eq_ignore_ascii_case(name)))
    }

    async fn count_table_rows(&self, name: &str) -> Result<i64> {
        self.read(|s| s.table_rows.get(name).copied().unwrap_or(0))
    }

    async fn list_table_names(&self) -> Result<Vec<String>> {
        self.read(|s| s.tables.clone())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        self.read(|s| s.databases.clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Serves the same rows for any table, paged by offset.
pub struct MemorySource {
    shape: TableShape,
    rows: Vec<Vec<SqlValue>>,
}

impl MemorySource {
    pub fn new(shape: TableShape, rows: Vec<Vec<SqlValue>>) -> Self {
        Self { shape, rows }
    }
}

#[async_trait]
impl TableSource for MemorySource {
    async fn describe(&mut self, _table: &QualifiedTable) -> Result<TableShape> {
        Ok(self.shape.clone())
    }

    async fn fetch_page(
        &mut self,
        _table: &QualifiedTable,
        shape: &TableShape,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Vec<SqlValue>>> {
        if shape.order_by.is_empty() {
            return Ok(if offset == 0 { self.rows.clone() } else { Vec::new() });
        }
        Ok(self
            .rows
            .iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Collects inserted rows and identity-insert toggles.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Whether the destination table has an identity column.
    pub identity: bool,
    /// Fail any insert that would take the row total past this.
    pub fail_after_rows: Option<usize>,
    pub rows: Vec<Vec<SqlValue>>,
    pub identity_calls: Vec<bool>,
    pub identity_insert_on: bool,
}

#[async_trait]
impl TableSink for MemorySink {
    async fn has_identity(&mut self, _table: &QualifiedTable) -> Result<bool> {
        Ok(self.identity)
    }

    async fn set_identity_insert(&mut self, _table: &QualifiedTable, enabled: bool) -> Result<()> {
        self.identity_calls.push(enabled);
        self.identity_insert_on = enabled;
        Ok(())
    }

    async fn insert_rows(
        &mut self,
        table: &QualifiedTable,
        _columns: &[String],
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        if let Some(limit) = self.fail_after_rows {
            if self.rows.len() + rows.len() > limit {
                return Err(MigrateError::transfer(
                    table.to_string(),
                    "Violation of PRIMARY KEY constraint",
                ));
            }
        }
        self.rows.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }
}

/// Hands out one shared [`MockCatalog`] and fresh memory endpoints.
pub struct MockConnector {
    pub catalog: Arc<MockCatalog>,
    pub source_shape: TableShape,
    pub source_rows: Vec<Vec<SqlValue>>,
    /// `(server, database)` pairs requested, in order.
    pub opened: Mutex<Vec<(String, String)>>,
}

impl MockConnector {
    pub fn new(catalog: Arc<MockCatalog>) -> Self {
        Self {
            catalog,
            source_shape: TableShape::default(),
            source_rows: Vec::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, server: &str, database: &str) {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push((server.to_string(), database.to_string()));
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn catalog(&self, server: &str, database: &str) -> Result<Arc<dyn CatalogProbe>> {
        self.record(server, database);
        Ok(self.catalog.clone())
    }

    async fn table_source(&self, server: &str, database: &str) -> Result<Box<dyn TableSource>> {
        self.record(server, database);
        Ok(Box::new(MemorySource::new(
            self.source_shape.clone(),
            self.source_rows.clone(),
        )))
    }

    async fn table_sink(&self, server: &str, database: &str) -> Result<Box<dyn TableSink>> {
        self.record(server, database);
        Ok(Box::new(MemorySink::default()))
    }
}

type ToolHook = Box<dyn Fn(&ToolInvocation) + Send + Sync>;

/// Records invocations and replays queued outputs.
///
/// Once the queue is empty every run returns a clean, empty output. The hook,
/// if set, runs before each output is returned and can mutate catalog state or
/// write artifact files the way a real script would.
#[derive(Default)]
pub struct ScriptedTools {
    pub calls: Mutex<Vec<ToolInvocation>>,
    outputs: Mutex<VecDeque<ToolOutput>>,
    hook: Option<ToolHook>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: impl Fn(&ToolInvocation) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn push_output(&self, output: ToolOutput) {
        if let Ok(mut outputs) = self.outputs.lock() {
            outputs.push_back(output);
        }
    }

    pub fn push_stdout(&self, stdout: &str) {
        self.push_output(ToolOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            ..Default::default()
        });
    }

    pub fn push_stderr(&self, stderr: &str) {
        self.push_output(ToolOutput {
            exit_code: Some(1),
            stderr: stderr.to_string(),
            ..Default::default()
        });
    }

    pub fn scripts(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|c| c.script.clone()).collect())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ToolRunner for ScriptedTools {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        if let Some(hook) = &self.hook {
            hook(invocation);
        }
        let queued = self.outputs.lock().ok().and_then(|mut o| o.pop_front());
        Ok(queued.unwrap_or(ToolOutput {
            exit_code: Some(0),
            ..Default::default()
        }))
    }
}
