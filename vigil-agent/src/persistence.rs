//! Durable watch records.
//!
//! One pretty-printed JSON file per watch at `<base_dir>/<watchId>.json`.
//! Every write goes through a temp file in the same directory and is renamed
//! into place, so a reader never sees a truncated record. Read-modify-write
//! of a single record is not atomic across the whole operation; a crash in
//! between can lose the latest append.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{AgentError, Result};

/// Durable events kept per record, oldest dropped first
pub const DEFAULT_EVENT_CAP: usize = 5000;

const RECORD_EXTENSION: &str = "json";

/// Kind of filesystem change carried by a [`WatchEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Change,
    Rename,
    Remove,
    Other,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Create => "create",
            EventKind::Change => "change",
            EventKind::Rename => "rename",
            EventKind::Remove => "remove",
            EventKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// Absolute path of the affected entry
    pub target: PathBuf,
    /// Unix seconds
    pub time: i64,
}

/// Persisted projection of one watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRecord {
    pub watch_id: String,
    pub path: PathBuf,
    pub started_at: i64,
    pub expires_at: i64,
    pub expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<i64>,
    #[serde(default)]
    pub events: Vec<WatchEvent>,
}

impl WatchRecord {
    /// A fresh, live record with no events
    pub fn new(watch_id: String, path: PathBuf, started_at: i64, expires_at: i64) -> Self {
        Self {
            watch_id,
            path,
            started_at,
            expires_at,
            expired: false,
            expired_at: None,
            events: Vec::new(),
        }
    }
}

/// Append `item`, dropping from the front so at most `cap` entries remain
pub(crate) fn push_capped<T>(items: &mut Vec<T>, item: T, cap: usize) {
    items.push(item);
    if items.len() > cap {
        let excess = items.len() - cap;
        items.drain(..excess);
    }
}

/// JSON-file store for [`WatchRecord`]s
#[derive(Debug, Clone)]
pub struct WatchStore {
    base_dir: PathBuf,
    event_cap: usize,
}

impl WatchStore {
    /// Open a store, creating `base_dir` (0o700 on Unix) if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        create_private_dir(&base_dir)?;
        Ok(Self {
            base_dir,
            event_cap: DEFAULT_EVENT_CAP,
        })
    }

    pub fn with_event_cap(mut self, event_cap: usize) -> Self {
        self.event_cap = event_cap.max(1);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn event_cap(&self) -> usize {
        self.event_cap
    }

    fn record_path(&self, watch_id: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", watch_id, RECORD_EXTENSION))
    }

    /// Persist a new record; fails if one already exists under the same id
    pub fn create(&self, record: &WatchRecord) -> Result<()> {
        let path = self.record_path(&record.watch_id);
        if path.exists() {
            return Err(AgentError::Storage(format!(
                "Watch record '{}' already exists",
                record.watch_id
            )));
        }
        self.write(record)
    }

    pub fn read(&self, watch_id: &str) -> Result<Option<WatchRecord>> {
        let path = self.record_path(watch_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AgentError::Storage(format!(
                    "Failed to read '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        let record = serde_json::from_str(&content).map_err(|e| {
            AgentError::Storage(format!("Failed to parse '{}': {}", path.display(), e))
        })?;
        Ok(Some(record))
    }

    /// Overwrite the record stored under its `watch_id`
    pub fn write(&self, record: &WatchRecord) -> Result<()> {
        let path = self.record_path(&record.watch_id);
        let content = serde_json::to_string_pretty(record).map_err(|e| {
            AgentError::Storage(format!(
                "Failed to serialize watch record '{}': {}",
                record.watch_id, e
            ))
        })?;
        self.write_secure_file(&path, content.as_bytes())?;
        debug!("Saved watch record to {:?}", path);
        Ok(())
    }

    /// Append one event, keeping only the newest `event_cap` entries.
    ///
    /// Returns `false` without writing when the record does not exist.
    pub fn append_event(&self, watch_id: &str, event: WatchEvent) -> Result<bool> {
        self.append_events(watch_id, vec![event])
    }

    /// Append a batch in order with a single rewrite of the record
    pub fn append_events(&self, watch_id: &str, events: Vec<WatchEvent>) -> Result<bool> {
        let Some(mut record) = self.read(watch_id)? else {
            debug!("Dropping {} event(s) for unknown watch record {}", events.len(), watch_id);
            return Ok(false);
        };
        for event in events {
            push_capped(&mut record.events, event, self.event_cap);
        }
        self.write(&record)?;
        Ok(true)
    }

    /// Flag the record expired at `at`. Returns `false` when it does not exist.
    pub fn mark_expired(&self, watch_id: &str, at: i64) -> Result<bool> {
        let Some(mut record) = self.read(watch_id)? else {
            debug!("Cannot mark unknown watch record {} expired", watch_id);
            return Ok(false);
        };
        record.expired = true;
        record.expired_at = Some(at);
        self.write(&record)?;
        Ok(true)
    }

    /// Ids of every stored record, in directory enumeration order
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.base_dir).map_err(|e| {
            AgentError::Storage(format!(
                "Failed to list '{}': {}",
                self.base_dir.display(),
                e
            ))
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }

    /// Remove a record. Returns `false` if there was nothing to remove.
    pub fn delete(&self, watch_id: &str) -> Result<bool> {
        let path = self.record_path(watch_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed watch record {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::Storage(format!(
                "Failed to remove '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    /// Write a file atomically with secure permissions (0o600 on Unix).
    fn write_secure_file(&self, path: &Path, content: &[u8]) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            AgentError::Storage(format!("No parent directory for '{}'", path.display()))
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            AgentError::Storage(format!(
                "Failed to create temp file in '{}': {}",
                parent.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| {
                    AgentError::Storage(format!("Failed to set permissions on temp file: {}", e))
                })?;
        }

        tmp.write_all(content)
            .map_err(|e| AgentError::Storage(format!("Failed to write temp file: {}", e)))?;

        tmp.persist(path).map_err(|e| {
            AgentError::Storage(format!("Failed to persist '{}': {}", path.display(), e))
        })?;

        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| {
        AgentError::Storage(format!(
            "Failed to create storage directory '{}': {}",
            dir.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests;
