//! External transformation tool invocation.
//!
//! Each stage drives one or more scripts through an interpreter
//! (`powershell -ExecutionPolicy Bypass -File <script> -flag value ...`).
//! The only contract is the process boundary: named arguments in, stdout and
//! stderr captured in full, an exit status out.

use crate::config::ToolConfig;
use crate::error::{MigrateError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One call of an external script with its ordered named arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Script file name, resolved against the configured scripts directory.
    pub script: String,
    /// `(flag, value)` pairs in the order they are passed.
    pub args: Vec<(String, String)>,
}

impl ToolInvocation {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
        }
    }

    /// Append a named argument.
    pub fn arg(mut self, flag: &str, value: impl AsRef<str>) -> Self {
        self.args.push((flag.to_string(), value.as_ref().to_string()));
        self
    }

    /// Append a named path argument.
    pub fn path_arg(self, flag: &str, value: &Path) -> Self {
        let value = value.to_string_lossy().into_owned();
        self.arg(flag, value)
    }

    /// Value of a named argument, if present.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(f, _)| f == flag)
            .map(|(_, v)| v.as_str())
    }
}

/// Captured result of a finished tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    /// Primary failure signal: anything written to stderr.
    pub fn has_stderr(&self) -> bool {
        !self.stderr.trim().is_empty()
    }

    /// Secondary failure signal: abnormal exit status.
    pub fn exited_nonzero(&self) -> bool {
        self.exit_code != Some(0)
    }

    /// Whether this run counts as a failure under the configured policy.
    pub fn failed(&self, fail_on_nonzero_exit: bool) -> bool {
        self.has_stderr() || (fail_on_nonzero_exit && self.exited_nonzero())
    }
}

/// Per-run summary returned to callers of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRunSummary {
    pub script: String,
    pub attempt: u32,
    pub exit_code: Option<i32>,
    pub stderr_written: bool,
    pub elapsed_ms: u64,
}

impl ToolRunSummary {
    pub fn new(invocation: &ToolInvocation, attempt: u32, output: &ToolOutput) -> Self {
        Self {
            script: invocation.script.clone(),
            attempt,
            exit_code: output.exit_code,
            stderr_written: output.has_stderr(),
            elapsed_ms: output.elapsed.as_millis() as u64,
        }
    }
}

/// Runs external tool invocations.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run to completion, draining both output streams.
    ///
    /// Returns `ToolLaunch` when the process cannot be started and
    /// `Cancelled` when `cancel` fires first. Stderr output is not an error
    /// at this level; callers decide.
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput>;
}

/// Spawns the configured interpreter as a child process.
pub struct ProcessToolRunner {
    program: String,
    program_args: Vec<String>,
    scripts_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ProcessToolRunner {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            program: config.program.clone(),
            program_args: config.program_args.clone(),
            scripts_dir: config.scripts_dir.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Full argument vector passed to the interpreter.
    pub fn command_args(&self, invocation: &ToolInvocation) -> Vec<String> {
        let mut args = self.program_args.clone();
        args.push(
            self.scripts_dir
                .join(&invocation.script)
                .to_string_lossy()
                .into_owned(),
        );
        for (flag, value) in &invocation.args {
            args.push(flag.clone());
            args.push(value.clone());
        }
        args
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        let args = self.command_args(invocation);
        debug!("Running {} {:?}", self.program, args);

        let started = Instant::now();
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MigrateError::tool_launch(&invocation.script, e))?;

        // Dropping the wait future kills the child (kill_on_drop).
        let wait = child.wait_with_output();
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Cancelling {}", invocation.script);
                return Err(MigrateError::Cancelled);
            }
            result = with_timeout(self.timeout, wait) => match result {
                Some(output) => output.map_err(|e| MigrateError::tool_launch(&invocation.script, e))?,
                None => {
                    return Err(MigrateError::ToolTimeout {
                        script: invocation.script.clone(),
                        seconds: self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                    });
                }
            },
        };

        let result = ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: started.elapsed(),
        };

        info!(
            "{} finished in {:.2}s (exit: {:?}, stderr: {} bytes)",
            invocation.script,
            result.elapsed.as_secs_f64(),
            result.exit_code,
            result.stderr.len()
        );

        Ok(result)
    }
}

async fn with_timeout<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn total_files_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)Total files created\s*:\s*(\d+)").expect("valid regex")
    })
}

/// Extract the last `Total files created: N` count reported on stdout.
pub fn parse_total_files_created(stdout: &str) -> Option<u64> {
    total_files_pattern()
        .captures_iter(stdout)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(program: &str) -> ProcessToolRunner {
        ProcessToolRunner::new(&ToolConfig {
            program: program.to_string(),
            program_args: vec!["-File".into()],
            scripts_dir: PathBuf::from("/opt/scripts"),
            ..Default::default()
        })
    }

    #[test]
    fn test_invocation_builder_keeps_order() {
        let inv = ToolInvocation::new("step3.ps1")
            .arg("-serverName", "sqlhost")
            .arg("-databaseName", "Sales")
            .arg("-Fromsch", "corpuser");
        assert_eq!(inv.args[0].0, "-serverName");
        assert_eq!(inv.args[2], ("-Fromsch".to_string(), "corpuser".to_string()));
        assert_eq!(inv.value_of("-databaseName"), Some("Sales"));
        assert_eq!(inv.value_of("-Tosch"), None);
    }

    #[test]
    fn test_command_args() {
        let inv = ToolInvocation::new("step1.ps1").arg("-serverName", "sqlhost");
        let args = runner("pwsh").command_args(&inv);
        assert_eq!(args[0], "-File");
        assert!(args[1].ends_with("step1.ps1"));
        assert_eq!(&args[2..], ["-serverName", "sqlhost"]);
    }

    #[test]
    fn test_failure_policy() {
        let mut out = ToolOutput {
            exit_code: Some(1),
            ..Default::default()
        };
        assert!(!out.failed(false));
        assert!(out.failed(true));

        out.exit_code = Some(0);
        out.stderr = "Access denied\n".into();
        assert!(out.failed(false));

        out.stderr = "  \n".into();
        assert!(!out.failed(true));
    }

    #[test]
    fn test_parse_total_files_created() {
        let stdout = "Exporting...\nTotal files created: 12\nRetrying\nTotal files created: 57\n";
        assert_eq!(parse_total_files_created(stdout), Some(57));
        assert_eq!(parse_total_files_created("nothing here"), None);
        assert_eq!(parse_total_files_created("total files created:3"), Some(3));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let runner = runner("definitely-not-a-real-interpreter-7f3a");
        let inv = ToolInvocation::new("step1.ps1");
        let err = runner
            .run(&inv, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::ToolLaunch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let runner = ProcessToolRunner::new(&ToolConfig {
            program: "sh".into(),
            program_args: vec!["-c".into()],
            scripts_dir: PathBuf::new(),
            ..Default::default()
        });
        let inv = ToolInvocation::new("echo out; echo err >&2; exit 3");
        let out = runner.run(&inv, &CancellationToken::new()).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_run() {
        let runner = ProcessToolRunner::new(&ToolConfig {
            program: "sh".into(),
            program_args: vec!["-c".into()],
            scripts_dir: PathBuf::new(),
            timeout_secs: Some(1),
            ..Default::default()
        });
        let inv = ToolInvocation::new("sleep 5");
        let err = runner.run(&inv, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MigrateError::ToolTimeout { seconds: 1, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_stops_run() {
        let runner = ProcessToolRunner::new(&ToolConfig {
            program: "sh".into(),
            program_args: vec!["-c".into()],
            scripts_dir: PathBuf::new(),
            ..Default::default()
        });
        let token = CancellationToken::new();
        token.cancel();
        let inv = ToolInvocation::new("sleep 5");
        let err = runner.run(&inv, &token).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
    }
}
