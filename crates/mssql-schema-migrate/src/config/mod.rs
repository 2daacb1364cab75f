//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;
use std::time::Duration;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl ConnectionConfig {
    /// Whether the connection should be encrypted.
    pub fn encrypt_enabled(&self) -> bool {
        !matches!(
            self.encrypt.to_lowercase().as_str(),
            "false" | "no" | "0" | "disable"
        )
    }

    /// Connection timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Split a server name into host and port.
    ///
    /// Accepts `host`, `host,port` (SQL Server style) and `host:port`.
    pub fn host_and_port(&self, server: &str) -> (String, u16) {
        let server = server.trim();
        for sep in [',', ':'] {
            if let Some((host, port)) = server.rsplit_once(sep) {
                if let Ok(port) = port.trim().parse::<u16>() {
                    return (host.trim().to_string(), port);
                }
            }
        }
        (server.to_string(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_minimal() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.connection.port, 1433);
        assert_eq!(config.session_store.backend, StoreBackend::Json);
        assert_eq!(config.tool.program, "powershell");
        assert_eq!(
            config.tool.program_args,
            vec!["-ExecutionPolicy", "Bypass", "-File"]
        );
        assert_eq!(config.pipeline.export_attempts, 3);
        assert_eq!(config.pipeline.fk_staging_table, "fk");
    }

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
connection:
  user: migrator
  password: secret
  encrypt: "false"
  trust_server_cert: true
session_store:
  backend: mssql
  server: admin-sql
  database: DbaPortal
tool:
  program: pwsh
  scripts_dir: /opt/migrate/scripts
  timeout_secs: 900
pipeline:
  cleanup_schema: lmn
  max_cleanup_iterations: 10
  row_move_batch_size: 250
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.session_store.backend, StoreBackend::Mssql);
        assert_eq!(config.session_store.server.as_deref(), Some("admin-sql"));
        assert!(!config.connection.encrypt_enabled());
        assert_eq!(config.tool.timeout_secs, Some(900));
        assert_eq!(config.pipeline.cleanup_schema.as_deref(), Some("lmn"));
        assert_eq!(config.pipeline.row_move_batch_size, 250);
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert!(Config::from_yaml("pipeline:\n  export_attempts: 0\n").is_err());
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let config = ConnectionConfig {
            password: "hunter2".into(),
            ..Default::default()
        };
        let debug = format!("{:?}", config);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_host_and_port() {
        let config = ConnectionConfig::default();
        assert_eq!(config.host_and_port("sqlhost"), ("sqlhost".into(), 1433));
        assert_eq!(config.host_and_port("sqlhost,14330"), ("sqlhost".into(), 14330));
        assert_eq!(config.host_and_port("10.0.0.5:1500"), ("10.0.0.5".into(), 1500));
    }
}
