//! In-place schema rewriting of exported definition files.
//!
//! Three ordered passes run over each file:
//!
//! 1. `CREATE`/`ALTER` headers whose target carries no schema are qualified
//!    with the new schema.
//! 2. The legacy schema token is replaced wherever it appears.
//! 3. Every remaining `CREATE <kind>` header becomes `ALTER <kind>`, including
//!    the ones just qualified.
//!
//! After writing, the file is read back and its first eight lines are checked
//! for the same three properties.

use crate::artifacts::{has_sql_extension, ArtifactFile, ObjectType, RewriteStatus};
use crate::error::{MigrateError, Result};
use crate::text::{self, TextEncoding, REWRITER_ENCODINGS};
use regex::{Captures, Regex};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Lines inspected by the post-write check.
const VALIDATION_LINES: usize = 8;

const SUCCESS_HEADER: &str = "Validation successful. All SQL files were modified correctly.";
const FAILURE_HEADER: &str = "Validation failed for the following files:";

fn header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(CREATE|ALTER)\s+(PROCEDURE|PROC|VIEW|FUNCTION|TRIGGER)\b\s*")
            .expect("valid regex")
    })
}

fn create_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bCREATE\s+(PROCEDURE|PROC|VIEW|FUNCTION|TRIGGER)\b")
            .expect("valid regex")
    })
}

fn qualified_target_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^(?:\[[^\]]*\]|"[^"]*"|[\w@#$]+)\s*\."#).expect("valid regex")
    })
}

fn object_type_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:CREATE|ALTER)\s+(PROCEDURE|PROC|VIEW|FUNCTION|TRIGGER|TABLE)\b")
            .expect("valid regex")
    })
}

/// What to rewrite and into what.
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Prefix inserted before unqualified targets, e.g. `[sales]`.
    pub qualifier: String,
    /// Schema name being retired, replaced wherever it appears.
    pub legacy_token: String,
    /// Replacement for the legacy token.
    pub replacement_token: String,
    /// Files whose name starts with this (any case) are skipped.
    pub skip_prefix: String,
}

impl RewriteOptions {
    /// Options for moving objects from `schema_from` to `new_schema`.
    ///
    /// `new_schema` is used verbatim as the qualifier; its bracket-free form
    /// replaces the legacy token.
    pub fn new(schema_from: &str, new_schema: &str, skip_prefix: &str) -> Self {
        let bare = new_schema
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        Self {
            qualifier: new_schema.trim().to_string(),
            legacy_token: schema_from.to_string(),
            replacement_token: bare,
            skip_prefix: skip_prefix.to_string(),
        }
    }
}

/// Apply the three rewrite passes to one definition.
pub fn rewrite_definition(sql: &str, options: &RewriteOptions) -> String {
    let qualified = qualify_headers(sql, &options.qualifier);
    let renamed = replace_legacy_token(&qualified, options);
    create_pattern()
        .replace_all(&renamed, |caps: &Captures| format!("ALTER {}", &caps[1]))
        .into_owned()
}

fn qualify_headers(sql: &str, qualifier: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 32);
    let mut last = 0;
    for caps in header_pattern().captures_iter(sql) {
        let Some(whole) = caps.get(0) else { continue };
        let rest = &sql[whole.end()..];
        if qualified_target_pattern().is_match(rest) {
            continue;
        }
        out.push_str(&sql[last..whole.start()]);
        let _ = write!(
            out,
            "{} {} {}.",
            caps[1].to_uppercase(),
            &caps[2],
            qualifier
        );
        last = whole.end();
    }
    out.push_str(&sql[last..]);
    out
}

fn replace_legacy_token(sql: &str, options: &RewriteOptions) -> String {
    if options.legacy_token.is_empty() {
        return sql.to_string();
    }
    let legacy = regex::escape(&options.legacy_token);
    // Single pass, so bracketed tokens are not bracketed twice.
    let Ok(pattern) = Regex::new(&format!(r"\[{legacy}\]|{legacy}")) else {
        return sql.replace(&options.legacy_token, &options.replacement_token);
    };
    pattern
        .replace_all(sql, |caps: &Captures| {
            if caps[0].starts_with('[') {
                format!("[{}]", options.replacement_token)
            } else {
                options.replacement_token.clone()
            }
        })
        .into_owned()
}

/// Check the head of a rewritten definition. Returns one message per problem.
pub fn validate_definition(sql: &str, file_name: &str, options: &RewriteOptions) -> Vec<String> {
    let head: String = sql
        .lines()
        .take(VALIDATION_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    let mut errors = Vec::new();

    let unqualified = header_pattern().captures_iter(&head).any(|caps| {
        caps.get(0)
            .map(|m| !targets_schema(&head[m.end()..], &options.replacement_token))
            .unwrap_or(false)
    });
    if unqualified {
        errors.push(format!(
            "Error: Schema {} not added in file {}",
            options.qualifier, file_name
        ));
    }

    if !options.legacy_token.is_empty() {
        // Occurrences inside the replacement token do not count.
        let masked = if options.replacement_token.contains(&options.legacy_token) {
            head.replace(&options.replacement_token, "")
        } else {
            head.clone()
        };
        if masked.contains(&options.legacy_token) {
            errors.push(format!(
                "Error: '{}' not replaced in file {}",
                options.legacy_token, file_name
            ));
        }
    }

    if create_pattern().is_match(&head) {
        errors.push(format!(
            "Error: 'create' statements not replaced with 'alter' in file {}",
            file_name
        ));
    }

    errors
}

fn targets_schema(rest: &str, schema: &str) -> bool {
    let rest = rest.trim_start();
    let lower = rest.to_lowercase();
    let schema = schema.to_lowercase();
    [format!("[{}]", schema), schema]
        .iter()
        .any(|prefix| {
            lower
                .strip_prefix(prefix.as_str())
                .map(|after| after.trim_start().starts_with('.'))
                .unwrap_or(false)
        })
}

/// Object type named by the first definition header, if any.
pub fn detect_object_type(sql: &str) -> ObjectType {
    object_type_pattern()
        .captures(sql)
        .map(|caps| ObjectType::from_keyword(&caps[1]))
        .unwrap_or(ObjectType::Unknown)
}

/// Outcome of one rewrite pass over a folder.
#[derive(Debug, Clone, Default)]
pub struct RewriteSummary {
    pub folder: PathBuf,
    pub files: Vec<FileRewrite>,
}

/// Per-file rewrite result.
#[derive(Debug, Clone)]
pub struct FileRewrite {
    pub file: ArtifactFile,
    /// Path relative to the rewritten folder, used in messages.
    pub display_name: String,
    pub encoding: Option<TextEncoding>,
    pub errors: Vec<String>,
}

impl RewriteSummary {
    /// All validation errors, in file order.
    pub fn errors(&self) -> Vec<String> {
        self.files.iter().flat_map(|f| f.errors.clone()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.files.iter().all(|f| f.errors.is_empty())
    }

    pub fn failed_files(&self) -> usize {
        self.files.iter().filter(|f| !f.errors.is_empty()).count()
    }

    /// Human-readable validation report.
    pub fn report(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.is_clean() {
            SUCCESS_HEADER
        } else {
            FAILURE_HEADER
        });
        out.push('\n');
        for file in &self.files {
            for error in &file.errors {
                out.push_str(error);
                out.push('\n');
            }
            if file.errors.is_empty() {
                let _ = writeln!(out, "File: {} - Successfully modified", file.display_name);
            } else {
                let _ = writeln!(out, "File: {} - ERROR", file.display_name);
            }
        }
        out
    }
}

/// Definition files directly inside the immediate subfolders of `folder`.
pub fn candidate_files(folder: &Path, skip_prefix: &str) -> Result<Vec<PathBuf>> {
    let skip = skip_prefix.to_lowercase();
    let mut files = Vec::new();
    for entry in WalkDir::new(folder)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry?;
        if !entry.file_type().is_file() || !has_sql_extension(entry.path()) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !skip.is_empty() && name.starts_with(&skip) {
            debug!("Skipping {}", entry.path().display());
            continue;
        }
        files.push(entry.into_path());
    }
    Ok(files)
}

/// Rewrite every candidate file under `folder` and validate the result.
///
/// Per-file problems (unreadable encodings, write failures, validation
/// findings) are collected in the summary. Finding no files at all is an error.
pub fn rewrite_schema(folder: &Path, options: &RewriteOptions) -> Result<RewriteSummary> {
    let files = candidate_files(folder, &options.skip_prefix)?;
    if files.is_empty() {
        return Err(MigrateError::Rewrite(format!(
            "No SQL files found in the subfolders of {}",
            folder.display()
        )));
    }

    let mut summary = RewriteSummary {
        folder: folder.to_path_buf(),
        files: Vec::with_capacity(files.len()),
    };
    for path in files {
        summary.files.push(rewrite_file(folder, path, options));
    }

    info!(
        "Rewrote {} files in {} ({} with errors)",
        summary.files.len(),
        folder.display(),
        summary.failed_files()
    );
    Ok(summary)
}

fn rewrite_file(folder: &Path, path: PathBuf, options: &RewriteOptions) -> FileRewrite {
    let display_name = path
        .strip_prefix(folder)
        .unwrap_or(&path)
        .to_string_lossy()
        .into_owned();

    let mut result = FileRewrite {
        file: ArtifactFile::new(path),
        display_name,
        encoding: None,
        errors: Vec::new(),
    };

    match apply_to_file(&result.file.path, options) {
        Ok((object_type, encoding, rewritten)) => {
            result.file.object_type = object_type;
            result.encoding = Some(encoding);
            result.errors = validate_definition(&rewritten, &result.display_name, options);
        }
        Err(e) => {
            warn!("Could not rewrite {}: {}", result.display_name, e);
            result.errors.push(format!("Error: {} ({})", e, result.display_name));
        }
    }

    result.file.status = if result.errors.is_empty() {
        RewriteStatus::RewrittenOk
    } else {
        RewriteStatus::RewrittenError
    };
    result
}

fn apply_to_file(path: &Path, options: &RewriteOptions) -> Result<(ObjectType, TextEncoding, String)> {
    let (original, encoding) = text::read_file(path, REWRITER_ENCODINGS)?;
    let object_type = detect_object_type(&original);
    std::fs::write(path, rewrite_definition(&original, options))?;

    // Validate what actually landed on disk.
    let written = std::fs::read_to_string(path)?;
    Ok((object_type, encoding, written))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn opts() -> RewriteOptions {
        RewriteOptions::new("corpuser", "[sales]", "dbo")
    }

    #[test]
    fn test_options_strip_brackets() {
        let o = opts();
        assert_eq!(o.qualifier, "[sales]");
        assert_eq!(o.replacement_token, "sales");

        let plain = RewriteOptions::new("corpuser", "S", "dbo");
        assert_eq!(plain.qualifier, "S");
        assert_eq!(plain.replacement_token, "S");
    }

    #[test]
    fn test_unqualified_create_becomes_qualified_alter() {
        let options = RewriteOptions::new("corpuser", "S", "dbo");
        let out = rewrite_definition("CREATE PROCEDURE X\nAS\nSELECT 1", &options);
        assert!(out.contains("ALTER PROCEDURE S.X"), "{out}");
        assert!(!out.to_uppercase().contains("CREATE PROCEDURE"));
    }

    #[test]
    fn test_qualified_targets_untouched() {
        let out = rewrite_definition("ALTER VIEW [dbo].[v_orders] AS SELECT 1", &opts());
        assert_eq!(out, "ALTER VIEW [dbo].[v_orders] AS SELECT 1");

        let out = rewrite_definition("create function dbo.fn_total() returns int", &opts());
        assert_eq!(out, "ALTER function dbo.fn_total() returns int");
    }

    #[test]
    fn test_legacy_token_replaced_once() {
        let out = rewrite_definition(
            "CREATE PROC [corpuser].[usp_load] AS SELECT * FROM corpuser.Orders",
            &opts(),
        );
        assert_eq!(
            out,
            "ALTER PROC [sales].[usp_load] AS SELECT * FROM sales.Orders"
        );
    }

    #[test]
    fn test_create_or_alter_left_alone() {
        let out = rewrite_definition("CREATE OR ALTER VIEW v AS SELECT 1", &opts());
        assert_eq!(out, "CREATE OR ALTER VIEW [sales].v AS SELECT 1");
    }

    #[test]
    fn test_trigger_and_lowercase_headers() {
        let out = rewrite_definition(
            "create trigger trg_audit on dbo.Orders after insert as select 1",
            &opts(),
        );
        assert!(out.starts_with("ALTER trigger [sales].trg_audit"), "{out}");
    }

    #[test]
    fn test_validate_clean_definition() {
        let errors = validate_definition(
            "ALTER PROCEDURE [sales].usp_x\nAS\nSELECT 1",
            "Procs/usp_x.sql",
            &opts(),
        );
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_validate_reports_all_three_problems() {
        let errors = validate_definition(
            "CREATE PROCEDURE dbo.usp_x\nAS\nSELECT * FROM corpuser.T",
            "usp_x.sql",
            &opts(),
        );
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors[0].contains("Schema [sales] not added"));
        assert!(errors[1].contains("'corpuser' not replaced"));
        assert!(errors[2].contains("'create' statements not replaced"));
    }

    #[test]
    fn test_validate_only_reads_first_lines() {
        let mut sql = String::from("ALTER VIEW [sales].v AS\n");
        for _ in 0..10 {
            sql.push_str("-- filler\n");
        }
        sql.push_str("SELECT * FROM corpuser.T");
        assert!(validate_definition(&sql, "v.sql", &opts()).is_empty());
    }

    #[test]
    fn test_detect_object_type() {
        assert_eq!(detect_object_type("CREATE PROC p AS"), ObjectType::Procedure);
        assert_eq!(detect_object_type("alter view v as"), ObjectType::View);
        assert_eq!(detect_object_type("CREATE TABLE t (id int)"), ObjectType::Table);
        assert_eq!(detect_object_type("SELECT 1"), ObjectType::Unknown);
    }

    fn scripts_fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let procs = dir.path().join("StoredProcedures");
        fs::create_dir_all(&procs).unwrap();
        fs::write(
            procs.join("usp_orders.sql"),
            "CREATE PROCEDURE usp_orders\nAS\nSELECT * FROM corpuser.Orders\n",
        )
        .unwrap();
        fs::write(procs.join("dbo_keep.sql"), "CREATE PROCEDURE dbo.keep AS SELECT 1").unwrap();
        fs::write(dir.path().join("root_level.sql"), "CREATE VIEW v AS SELECT 1").unwrap();
        dir
    }

    #[test]
    fn test_rewrite_schema_over_folder() {
        let dir = scripts_fixture();
        let summary = rewrite_schema(dir.path(), &opts()).unwrap();

        assert_eq!(summary.files.len(), 1);
        assert!(summary.is_clean(), "{:?}", summary.errors());
        let file = &summary.files[0];
        assert_eq!(file.file.status, RewriteStatus::RewrittenOk);
        assert_eq!(file.file.object_type, ObjectType::Procedure);

        let content = fs::read_to_string(dir.path().join("StoredProcedures/usp_orders.sql")).unwrap();
        assert!(content.starts_with("ALTER PROCEDURE [sales].usp_orders"));
        assert!(content.contains("FROM sales.Orders"));

        // Skipped and root-level files keep their content.
        let kept = fs::read_to_string(dir.path().join("StoredProcedures/dbo_keep.sql")).unwrap();
        assert!(kept.starts_with("CREATE PROCEDURE"));
        let root = fs::read_to_string(dir.path().join("root_level.sql")).unwrap();
        assert!(root.starts_with("CREATE VIEW"));

        let report = summary.report();
        assert!(report.starts_with(SUCCESS_HEADER));
        assert!(report.contains("Successfully modified"));
    }

    #[test]
    fn test_cp1252_file_rewritten_as_utf8() {
        let dir = TempDir::new().unwrap();
        let views = dir.path().join("Views");
        fs::create_dir_all(&views).unwrap();
        fs::write(views.join("v.sql"), b"CREATE VIEW v AS SELECT 'caf\xE9' AS c").unwrap();

        let summary = rewrite_schema(dir.path(), &opts()).unwrap();
        assert_eq!(summary.files[0].encoding, Some(TextEncoding::Windows1252));
        let content = fs::read_to_string(views.join("v.sql")).unwrap();
        assert_eq!(content, "ALTER VIEW [sales].v AS SELECT 'café' AS c");
    }

    #[test]
    fn test_unreadable_file_is_contained() {
        let dir = TempDir::new().unwrap();
        let views = dir.path().join("Views");
        fs::create_dir_all(&views).unwrap();
        fs::write(views.join("bad.sql"), b"\x81\x8D").unwrap();
        fs::write(views.join("good.sql"), "CREATE VIEW g AS SELECT 1").unwrap();

        let summary = rewrite_schema(dir.path(), &opts()).unwrap();
        assert_eq!(summary.files.len(), 2);
        assert_eq!(summary.failed_files(), 1);
        assert!(summary.report().starts_with(FAILURE_HEADER));
        assert!(summary.report().contains("bad.sql - ERROR"));
    }

    #[test]
    fn test_empty_folder_is_error() {
        let dir = TempDir::new().unwrap();
        let err = rewrite_schema(dir.path(), &opts()).unwrap_err();
        assert!(matches!(err, MigrateError::Rewrite(_)));
    }
}
