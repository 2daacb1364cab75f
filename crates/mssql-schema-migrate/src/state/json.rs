//! File-based session store with integrity validation.
//!
//! Layout under the store directory, per database (file stems are the
//! lower-cased database name):
//!
//! - `<db>.session.json`: the signed session
//! - `<db>.stage.lock`: present while a stage runs; holds the stage number
//! - `<db>.progress.json`: the operator's progress snapshot

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::{InsertOutcome, SessionStore, StageClaim};
use super::{CounterpartyUpdate, MigrationSession, ProgressSnapshot};
use crate::error::{MigrateError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Claim attempts when the holder releases between the claim and the read.
const CLAIM_ATTEMPTS: usize = 3;

/// On-disk envelope: the session plus its signature.
#[derive(Debug, Serialize, Deserialize)]
struct SessionFile {
    #[serde(flatten)]
    session: MigrationSession,

    /// HMAC-SHA256 over the serialized session, keyed by the database name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hmac: Option<String>,
}

/// JSON file session store.
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn stem(database: &str) -> Result<String> {
        let trimmed = database.trim();
        if trimmed.is_empty()
            || trimmed == "."
            || trimmed == ".."
            || trimmed.contains(|c: char| c == '/' || c == '\\')
        {
            return Err(MigrateError::Config(format!(
                "invalid database name '{}'",
                database
            )));
        }
        Ok(trimmed.to_lowercase())
    }

    fn session_path(&self, database: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.session.json", Self::stem(database)?)))
    }

    fn lock_path(&self, database: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.stage.lock", Self::stem(database)?)))
    }

    fn progress_path(&self, database: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.progress.json", Self::stem(database)?)))
    }

    /// Compute HMAC-SHA256 signature for session integrity validation.
    fn compute_hmac(session: &MigrationSession) -> Result<String> {
        let mut unsigned = session.clone();
        unsigned.active_stage = None;
        let content = serde_json::to_string(&unsigned)?;

        let mut mac = HmacSha256::new_from_slice(session.database_name.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn encode(session: &MigrationSession) -> Result<String> {
        let mut session = session.clone();
        session.active_stage = None;
        let file = SessionFile {
            hmac: Some(Self::compute_hmac(&session)?),
            session,
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    fn read_session(&self, path: &Path) -> Result<Option<MigrationSession>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: SessionFile = serde_json::from_str(&content)?;
        let expected = Self::compute_hmac(&file.session)?;
        match file.hmac {
            Some(stored) if stored == expected => Ok(Some(file.session)),
            Some(_) => Err(MigrateError::State(format!(
                "Session file {} integrity check failed: HMAC mismatch (possible tampering)",
                path.display()
            ))),
            None => Err(MigrateError::State(format!(
                "Session file {} has no HMAC signature",
                path.display()
            ))),
        }
    }

    /// Write to a unique temp file next to `path`.
    fn write_temp(&self, path: &Path, content: &str) -> Result<PathBuf> {
        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&temp_path, content)?;
        Ok(temp_path)
    }

    /// Atomic write: write to temp file, then rename.
    fn replace_file(&self, path: &Path, content: &str) -> Result<()> {
        let temp_path = self.write_temp(path, content)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Create `path` with its full content, or return `false` if it exists.
    ///
    /// Linking fails when the target exists, so exactly one caller wins and
    /// readers never see a partially written file.
    fn link_new(&self, path: &Path, content: &str) -> Result<bool> {
        let temp_path = self.write_temp(path, content)?;
        let linked = fs::hard_link(&temp_path, path);
        if let Err(e) = fs::remove_file(&temp_path) {
            warn!("Failed to remove {}: {}", temp_path.display(), e);
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn active_stage(&self, database: &str) -> Result<Option<u8>> {
        let path = self.lock_path(database)?;
        match fs::read_to_string(&path) {
            Ok(content) => content.trim().parse().map(Some).map_err(|_| {
                MigrateError::State(format!(
                    "Stage lock {} does not hold a stage number; run session unlock",
                    path.display()
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn init_schema(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    async fn get(&self, database: &str) -> Result<Option<MigrationSession>> {
        let path = self.session_path(database)?;
        let Some(mut session) = self.read_session(&path)? else {
            return Ok(None);
        };
        session.active_stage = self.active_stage(database)?;
        Ok(Some(session))
    }

    async fn insert_if_absent(&self, session: &MigrationSession) -> Result<InsertOutcome> {
        fs::create_dir_all(&self.dir)?;
        let path = self.session_path(&session.database_name)?;
        if self.link_new(&path, &Self::encode(session)?)? {
            debug!("Wrote session file {}", path.display());
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Existing)
        }
    }

    async fn update_counterparty(
        &self,
        database: &str,
        update: &CounterpartyUpdate,
    ) -> Result<MigrationSession> {
        let path = self.session_path(database)?;
        let mut session = self
            .read_session(&path)?
            .ok_or_else(|| MigrateError::SessionNotFound(database.to_string()))?;

        update.apply(&mut session);
        session.updated_at = Utc::now();
        self.replace_file(&path, &Self::encode(&session)?)?;

        session.active_stage = self.active_stage(database)?;
        Ok(session)
    }

    async fn try_begin_stage(&self, database: &str, stage: u8) -> Result<StageClaim> {
        if self.read_session(&self.session_path(database)?)?.is_none() {
            return Err(MigrateError::SessionNotFound(database.to_string()));
        }
        let lock_path = self.lock_path(database)?;
        for _ in 0..CLAIM_ATTEMPTS {
            if self.link_new(&lock_path, &stage.to_string())? {
                return Ok(StageClaim::Acquired);
            }
            if let Some(holder) = self.active_stage(database)? {
                return Ok(StageClaim::Busy(holder));
            }
            debug!("Stage lock for {} was released concurrently, claiming again", database);
        }
        Err(MigrateError::State(format!(
            "Could not claim the stage lock for {}",
            database
        )))
    }

    async fn end_stage(&self, database: &str) -> Result<()> {
        match fs::remove_file(self.lock_path(database)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_progress(&self, database: &str, data: &serde_json::Value) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let snapshot = ProgressSnapshot {
            database_name: database.to_string(),
            data: data.clone(),
            saved_at: Utc::now(),
        };
        let path = self.progress_path(database)?;
        self.replace_file(&path, &serde_json::to_string_pretty(&snapshot)?)
    }

    async fn recover_progress(&self, database: &str) -> Result<Option<ProgressSnapshot>> {
        match fs::read_to_string(self.progress_path(database)?) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_progress(&self, database: &str) -> Result<bool> {
        match fs::remove_file(self.progress_path(database)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "json"
    }
}
