//! Table manifests and object-list discovery.
//!
//! A table manifest is a text file with one table name per line, optionally
//! schema-qualified and bracketed. Object-list manifests for stage 14 are
//! located by keyword in their file names.

use crate::error::{MigrateError, Result};
use crate::text::{self, REWRITER_ENCODINGS};
use crate::transfer::{quote_ident, QualifiedTable};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// One line of a table manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTable {
    pub schema: Option<String>,
    pub name: String,
}

fn unbracket(part: &str) -> &str {
    let part = part.trim();
    part.strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
        .unwrap_or(part)
}

impl ManifestTable {
    /// Parse `table`, `schema.table` or `db.schema.table`, brackets optional.
    ///
    /// Returns `None` for blank input.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let parts: Vec<&str> = line.split('.').map(unbracket).collect();
        let name = parts.last()?.to_string();
        if name.is_empty() {
            return None;
        }
        let schema = if parts.len() >= 2 {
            Some(parts[parts.len() - 2].to_string()).filter(|s| !s.is_empty())
        } else {
            None
        };
        Some(Self { schema, name })
    }

    /// Fully qualified table, filling in `default_schema` when absent.
    pub fn qualified(&self, default_schema: &str) -> QualifiedTable {
        QualifiedTable::new(
            self.schema.as_deref().unwrap_or(default_schema),
            self.name.clone(),
        )
    }

    /// `[schema].[name]`, or `[name]` when unqualified.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }
}

impl fmt::Display for ManifestTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Read a table manifest, ignoring blank lines.
pub fn read_table_manifest(path: &Path) -> Result<Vec<ManifestTable>> {
    if !path.is_file() {
        return Err(MigrateError::Config(format!(
            "table manifest not found: {}",
            path.display()
        )));
    }
    let (content, _) = text::read_file(path, REWRITER_ENCODINGS)?;
    Ok(content.lines().filter_map(ManifestTable::parse).collect())
}

/// Difference between manifest names and catalog table names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableSetDiff {
    /// In the manifest but not in the catalog.
    pub missing: Vec<String>,
    /// In the catalog but not in the manifest.
    pub extra: Vec<String>,
}

impl TableSetDiff {
    pub fn is_match(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }

    /// Validation file text.
    pub fn report(&self) -> String {
        if self.is_match() {
            return "Validation Successful: All table names match.\n".to_string();
        }
        let mut out = String::new();
        if !self.missing.is_empty() {
            out.push_str(&format!(
                "Missing Tables in Destination: {}\n",
                self.missing.join(", ")
            ));
        }
        if !self.extra.is_empty() {
            out.push_str(&format!(
                "Extra Tables in Destination: {}\n",
                self.extra.join(", ")
            ));
        }
        out
    }
}

/// Compare unqualified names case-insensitively.
pub fn compare_table_sets(manifest: &[ManifestTable], catalog: &[String]) -> TableSetDiff {
    let expected: BTreeSet<String> = manifest.iter().map(|t| t.name.to_lowercase()).collect();
    let actual: BTreeSet<String> = catalog.iter().map(|t| t.to_lowercase()).collect();

    let mut missing: Vec<String> = manifest
        .iter()
        .filter(|t| !actual.contains(&t.name.to_lowercase()))
        .map(|t| t.name.clone())
        .collect();
    missing.sort();
    missing.dedup();

    let mut extra: Vec<String> = catalog
        .iter()
        .filter(|t| !expected.contains(&t.to_lowercase()))
        .cloned()
        .collect();
    extra.sort();
    extra.dedup();

    TableSetDiff { missing, extra }
}

/// Kinds of object-list manifests produced by stage 13.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Functions,
    Views,
    Procedures,
}

impl ManifestKind {
    pub const ALL: [ManifestKind; 3] = [Self::Functions, Self::Views, Self::Procedures];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Functions => "function",
            Self::Views => "view",
            Self::Procedures => "stored procedure",
        }
    }

    /// Whether a file name carries this kind's keyword.
    ///
    /// `function` and `view` match anywhere in the name. For procedures the
    /// name is split into alphanumeric words: `sp` must be a whole word and
    /// `proc` a word prefix, so names like `display_views` stay views.
    pub fn matches(&self, file_name: &str) -> bool {
        let lower = file_name.to_lowercase();
        match self {
            Self::Functions => lower.contains("function"),
            Self::Views => lower.contains("view"),
            Self::Procedures => lower
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|word| word == "sp" || word.starts_with("proc")),
        }
    }
}

/// The three object-list manifests, one per kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectManifests {
    pub functions: PathBuf,
    pub views: PathBuf,
    pub procedures: PathBuf,
}

/// Locate exactly one `.txt` manifest per kind in `folder`.
pub fn discover_object_manifests(folder: &Path) -> Result<ObjectManifests> {
    let mut txt_files: Vec<PathBuf> = Vec::new();
    if folder.is_dir() {
        for entry in fs::read_dir(folder)? {
            let path = entry?.path();
            let is_txt = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("txt"))
                .unwrap_or(false);
            if path.is_file() && is_txt {
                txt_files.push(path);
            }
        }
    }
    txt_files.sort();

    let find = |kind: ManifestKind| -> Result<PathBuf> {
        let mut matches: Vec<PathBuf> = txt_files
            .iter()
            .filter(|p| {
                p.file_name()
                    .map(|n| kind.matches(&n.to_string_lossy()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        match matches.len() {
            0 => Err(MigrateError::ManifestMissing {
                kind: kind.as_str().to_string(),
                folder: folder.to_path_buf(),
            }),
            1 => Ok(matches.remove(0)),
            _ => Err(MigrateError::ManifestAmbiguous {
                kind: kind.as_str().to_string(),
                files: matches,
            }),
        }
    };

    Ok(ObjectManifests {
        functions: find(ManifestKind::Functions)?,
        views: find(ManifestKind::Views)?,
        procedures: find(ManifestKind::Procedures)?,
    })
}
