use crate::deadline::Deadline;
use crate::image_store::ImageStore;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// A single rollback step that can undo part of an upload.
///
/// Only keys the operation itself created are journaled; content another
/// build published stays untouched by this entry's rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RollbackStep {
    /// Remove a key created in the image store.
    RemoveKey(String),
}

/// The type of mutating operation being tracked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WalOpKind {
    BuildApplicationType,
    BuildApplication,
    UpgradeApplication,
}

impl std::fmt::Display for WalOpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalOpKind::BuildApplicationType => write!(f, "build-application-type"),
            WalOpKind::BuildApplication => write!(f, "build-application"),
            WalOpKind::UpgradeApplication => write!(f, "upgrade-application"),
        }
    }
}

/// A WAL entry representing an in-flight upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub op_id: String,
    pub kind: WalOpKind,
    pub target: String,
    pub timestamp: String,
    pub rollback_steps: Vec<RollbackStep>,
}

/// Write-ahead log for crash recovery of uploads.
///
/// The engine begins an entry before uploading, records every key it creates,
/// and commits the entry once the publish marker is written. Incomplete
/// entries are rolled back in reverse order on the next engine start.
pub struct WriteAheadLog {
    wal_dir: PathBuf,
}

impl WriteAheadLog {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            wal_dir: working_dir.join("wal"),
        }
    }

    /// Ensure the WAL directory exists.
    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        Ok(())
    }

    /// Begin a new WAL entry for an operation. Returns the op_id.
    pub fn begin(&self, kind: WalOpKind, target: &str) -> Result<String, StoreError> {
        let op_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            &blake3::hash(target.as_bytes()).to_hex()[..8]
        );
        let entry = WalEntry {
            op_id: op_id.clone(),
            kind,
            target: target.to_owned(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            rollback_steps: Vec::new(),
        };
        self.write_entry(&entry)?;
        debug!("WAL begin: {} for {target} (op_id={op_id})", entry.kind);
        Ok(op_id)
    }

    /// Append a rollback step to an existing WAL entry.
    pub fn add_rollback_step(&self, op_id: &str, step: RollbackStep) -> Result<(), StoreError> {
        let mut entry = self.read_entry(op_id)?;
        entry.rollback_steps.push(step);
        self.write_entry(&entry)?;
        Ok(())
    }

    /// Commit (remove) a WAL entry after successful completion.
    pub fn commit(&self, op_id: &str) -> Result<(), StoreError> {
        let path = self.entry_path(op_id);
        if path.exists() {
            fs::remove_file(&path)?;
            debug!("WAL commit: {op_id}");
        }
        Ok(())
    }

    /// List all incomplete WAL entries, oldest first.
    pub fn list_incomplete(&self) -> Result<Vec<WalEntry>, StoreError> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.wal_dir)? {
            let path = dir_entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                match fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<WalEntry>(&content) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!("corrupt WAL entry {}: {e}", path.display());
                            let _ = fs::remove_file(&path);
                        }
                    },
                    Err(e) => {
                        warn!("unreadable WAL entry {}: {e}", path.display());
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    /// Roll back the steps of one entry and remove it.
    ///
    /// The entry is kept when any step fails, so a later [`recover`] retries
    /// it. Callers pass a deadline of its own, not the one the failed
    /// operation ran out of.
    ///
    /// [`recover`]: WriteAheadLog::recover
    pub fn rollback(
        &self,
        op_id: &str,
        store: &dyn ImageStore,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let entry = self.read_entry(op_id)?;
        Self::rollback_entry(&entry, store, deadline)?;
        self.commit(op_id)
    }

    /// Roll back all incomplete WAL entries.
    ///
    /// Returns the number of entries fully rolled back. Entries with a step
    /// that could not be undone stay in the log.
    pub fn recover(&self, store: &dyn ImageStore, deadline: Deadline) -> Result<usize, StoreError> {
        let entries = self.list_incomplete()?;
        let mut count = 0;
        for entry in &entries {
            info!(
                "WAL recovery: rolling back {} on {} (op_id={})",
                entry.kind, entry.target, entry.op_id
            );
            match Self::rollback_entry(entry, store, deadline) {
                Ok(()) => {
                    self.commit(&entry.op_id)?;
                    count += 1;
                }
                Err(e) => warn!("WAL recovery: {e}"),
            }
        }
        if count > 0 {
            info!("WAL recovery complete: {count} entries rolled back");
        }
        Ok(count)
    }

    fn rollback_entry(
        entry: &WalEntry,
        store: &dyn ImageStore,
        deadline: Deadline,
    ) -> Result<(), StoreError> {
        let mut failed = 0;
        for step in entry.rollback_steps.iter().rev() {
            match step {
                RollbackStep::RemoveKey(key) => {
                    if let Err(e) = store.delete(key, deadline) {
                        warn!("WAL rollback: failed to remove key {key}: {e}");
                        failed += 1;
                    } else {
                        debug!("WAL rollback: removed key {key}");
                    }
                }
            }
        }
        if failed > 0 {
            return Err(StoreError::RollbackIncomplete {
                op_id: entry.op_id.clone(),
                failed,
            });
        }
        Ok(())
    }

    fn entry_path(&self, op_id: &str) -> PathBuf {
        self.wal_dir.join(format!("{op_id}.json"))
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<(), StoreError> {
        fs::create_dir_all(&self.wal_dir)?;
        let content = serde_json::to_string_pretty(entry)?;
        let mut tmp = NamedTempFile::new_in(&self.wal_dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        let dest = self.entry_path(&entry.op_id);
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        crate::fsync_dir(&self.wal_dir)?;
        Ok(())
    }

    fn read_entry(&self, op_id: &str) -> Result<WalEntry, StoreError> {
        let content = fs::read_to_string(self.entry_path(op_id))?;
        Ok(serde_json::from_str(&content)?)
    }
}
