//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Credentials and connection settings shared by every server the pipeline touches.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Where session rows and progress snapshots are persisted.
    #[serde(default)]
    pub session_store: SessionStoreConfig,

    /// External transformation tool invocation.
    #[serde(default)]
    pub tool: ToolConfig,

    /// Stage behavior.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// SQL Server connection profile.
///
/// Server and database come from the session; this holds everything else.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Default port when the server name carries none (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Username.
    #[serde(default)]
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Maximum pooled connections per server/database pair (default: 4).
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: default_mssql_port(),
            user: String::new(),
            password: String::new(),
            encrypt: default_true_string(),
            trust_server_cert: false,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("pool_size", &self.pool_size)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// Session store backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One signed JSON file per database.
    #[default]
    Json,
    /// Tables in a SQL Server database.
    Mssql,
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStoreConfig {
    /// Backend kind (default: json).
    #[serde(default)]
    pub backend: StoreBackend,

    /// Directory for the JSON backend (default: "./sessions").
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Server hosting the session tables (mssql backend).
    pub server: Option<String>,

    /// Database hosting the session tables (mssql backend).
    pub database: Option<String>,

    /// Schema for the session tables (default: "_mssql_schema_migrate").
    #[serde(default = "default_store_schema")]
    pub schema: String,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            server: None,
            database: None,
            schema: default_store_schema(),
        }
    }
}

/// External tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Interpreter executable (default: "powershell").
    #[serde(default = "default_tool_program")]
    pub program: String,

    /// Arguments placed before the script path.
    #[serde(default = "default_tool_program_args")]
    pub program_args: Vec<String>,

    /// Directory holding the stage scripts (default: "./scripts").
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Treat a non-zero exit code as failure even when stderr is empty.
    #[serde(default)]
    pub fail_on_nonzero_exit: bool,

    /// Kill a tool run after this many seconds. Unset means wait forever.
    pub timeout_secs: Option<u64>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: default_tool_program(),
            program_args: default_tool_program_args(),
            scripts_dir: default_scripts_dir(),
            fail_on_nonzero_exit: false,
            timeout_secs: None,
        }
    }
}

/// Stage behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Schema emptied by stage 2. Falls back to the session's source schema.
    pub cleanup_schema: Option<String>,

    /// Upper bound on stage 2 tool invocations (default: 50).
    #[serde(default = "default_max_cleanup_iterations")]
    pub max_cleanup_iterations: u32,

    /// Unconditional export runs in stages 7 and 16 (default: 3).
    #[serde(default = "default_three")]
    pub export_attempts: u32,

    /// Staging-table drop iterations in stage 9 (default: 3).
    #[serde(default = "default_three")]
    pub staging_iterations: u32,

    /// Side table populated by the stage 8 tool (default: "fk").
    #[serde(default = "default_fk_staging_table")]
    pub fk_staging_table: String,

    /// Definition files whose name starts with this are left alone (default: "dbo").
    #[serde(default = "default_dbo")]
    pub skip_file_prefix: String,

    /// Rows per page in stage 11 row moves (default: 1000).
    #[serde(default = "default_row_move_batch_size")]
    pub row_move_batch_size: usize,

    /// Schema assumed for unqualified manifest entries (default: "dbo").
    #[serde(default = "default_dbo")]
    pub default_table_schema: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cleanup_schema: None,
            max_cleanup_iterations: default_max_cleanup_iterations(),
            export_attempts: default_three(),
            staging_iterations: default_three(),
            fk_staging_table: default_fk_staging_table(),
            skip_file_prefix: default_dbo(),
            row_move_batch_size: default_row_move_batch_size(),
            default_table_schema: default_dbo(),
        }
    }
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_true_string() -> String {
    "true".to_string()
}

fn default_pool_size() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./sessions")
}

fn default_store_schema() -> String {
    "_mssql_schema_migrate".to_string()
}

fn default_tool_program() -> String {
    "powershell".to_string()
}

fn default_tool_program_args() -> Vec<String> {
    vec![
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-File".to_string(),
    ]
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("./scripts")
}

fn default_max_cleanup_iterations() -> u32 {
    50
}

fn default_three() -> u32 {
    3
}

fn default_fk_staging_table() -> String {
    "fk".to_string()
}

fn default_dbo() -> String {
    "dbo".to_string()
}

fn default_row_move_batch_size() -> usize {
    1000
}
