//! Quarantine of definitions that reference other databases.
//!
//! Definitions containing three-part names (`OtherDb.dbo.Orders`) cannot be
//! deployed blindly into the migrated database. The router copies each such
//! file into `crossdb/<foreign database>/`, preserving its relative path, so
//! an operator can review it. Originals are never moved or modified.

use crate::artifacts::has_sql_extension;
use crate::error::{MigrateError, Result};
use crate::text::{self, ROUTER_ENCODINGS};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Folder under the destination root that receives routed copies.
pub const CROSSDB_FOLDER: &str = "crossdb";

fn three_part_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:\[([A-Za-z_][A-Za-z0-9_]*)\]|\b([A-Za-z_][A-Za-z0-9_]*))\.(?:\[[A-Za-z_][A-Za-z0-9_]*\]|[A-Za-z_][A-Za-z0-9_]*)?\.",
        )
        .expect("valid regex")
    })
}

/// Distinct database names referenced by three-part names in `sql`,
/// excluding `own_database` (compared case-insensitively).
pub fn foreign_databases(sql: &str, own_database: &str) -> BTreeSet<String> {
    let own = own_database.to_lowercase();
    let mut seen_lower = BTreeSet::new();
    let mut found = BTreeSet::new();
    for caps in three_part_name().captures_iter(sql) {
        let Some(db) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let lower = db.as_str().to_lowercase();
        if lower == own {
            continue;
        }
        if seen_lower.insert(lower) {
            found.insert(db.as_str().to_string());
        }
    }
    found
}

/// Result of a routing pass.
#[derive(Debug, Clone, Default)]
pub struct RouteReport {
    /// Foreign database to the source files (relative paths) that reference it.
    pub routed: BTreeMap<String, Vec<PathBuf>>,
    /// Number of definition files inspected.
    pub scanned: usize,
    /// Files no decoder could read; skipped.
    pub unreadable: Vec<PathBuf>,
}

impl RouteReport {
    /// Number of distinct source files copied at least once.
    pub fn routed_files(&self) -> usize {
        self.routed
            .values()
            .flatten()
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Human-readable summary for stage logs.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Cross-database scan: {} files scanned, {} routed, {} unreadable\n",
            self.scanned,
            self.routed_files(),
            self.unreadable.len()
        );
        for (db, files) in &self.routed {
            let _ = writeln!(out, "  {} ({} files)", db, files.len());
            for file in files {
                let _ = writeln!(out, "    {}", file.display());
            }
        }
        for file in &self.unreadable {
            let _ = writeln!(out, "  Unreadable: {}", file.display());
        }
        out
    }
}

/// Copy every definition under `source` that references another database into
/// `dest_root/crossdb/<database>/<relative path>`.
pub fn route_cross_db_files(source: &Path, dest_root: &Path, own_database: &str) -> Result<RouteReport> {
    let quarantine = dest_root.join(CROSSDB_FOLDER);
    let mut report = RouteReport::default();

    if !source.is_dir() {
        warn!("Router source {} does not exist", source.display());
        return Ok(report);
    }

    let walker = WalkDir::new(source)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !e.path().starts_with(&quarantine));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() || !has_sql_extension(entry.path()) {
            continue;
        }
        report.scanned += 1;

        let path = entry.path();
        let relative = path.strip_prefix(source).unwrap_or(path).to_path_buf();
        let sql = match text::read_file(path, ROUTER_ENCODINGS) {
            Ok((sql, _)) => sql,
            Err(MigrateError::FileEncodingUnreadable(p)) => {
                warn!("Skipping {}: no supported encoding", p.display());
                report.unreadable.push(relative);
                continue;
            }
            Err(e) => return Err(e),
        };

        for db in foreign_databases(&sql, own_database) {
            let target = quarantine.join(&db).join(&relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(path, &target)?;
            debug!("Copied {} to {}", path.display(), target.display());
            report.routed.entry(db).or_default().push(relative.clone());
        }
    }

    info!(
        "Routed {} of {} files from {} to {} foreign databases",
        report.routed_files(),
        report.scanned,
        source.display(),
        report.routed.len()
    );
    Ok(report)
}
