//! Time-bounded directory watches.
//!
//! Each live watch is an actor task that owns the `notify` watcher and the
//! expiry deadline. The actor is the only writer of the session's live event
//! buffer and of its durable record; readers take cloned snapshots of the
//! buffer through a `parking_lot::RwLock`. Expiry closes the OS watch, marks
//! the record expired and removes the session, after which queries fall
//! through to the durable record.

use chrono::Utc;
use dashmap::DashMap;
use notify::event::ModifyKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::errors::AgentError;
use crate::persistence::{EventKind, WatchEvent, WatchRecord, WatchStore, push_capped};

/// Live events kept per session, oldest dropped first
pub const LIVE_EVENT_CAP: usize = 1000;

const WATCH_ID_BYTES: usize = 12;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Watch not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("File watcher error: {0}")]
    Backend(String),
}

impl From<AgentError> for WatchError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Storage(msg) => WatchError::Storage(msg),
            other => WatchError::Storage(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WatchError>;

/// Reply to a successful start
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStarted {
    pub watch_id: String,
    pub expires_at: i64,
}

/// Fresh unpredictable watch id: 12 random bytes, hex encoded
pub fn generate_watch_id() -> Result<String> {
    let mut bytes = [0u8; WATCH_ID_BYTES];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| WatchError::Backend(format!("Failed to generate watch id: {}", e)))?;
    Ok(hex::encode(bytes))
}

/// Only ids that could have been issued are allowed near the filesystem
pub fn is_valid_watch_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Translate one `notify` event into watch events, one per affected path
pub fn convert_event(event: &Event, time: i64) -> Vec<WatchEvent> {
    use notify::EventKind as Kind;

    let kind = match event.kind {
        Kind::Access(_) => return Vec::new(),
        Kind::Create(_) => EventKind::Create,
        Kind::Modify(ModifyKind::Name(_)) => EventKind::Rename,
        Kind::Modify(_) => EventKind::Change,
        Kind::Remove(_) => EventKind::Remove,
        Kind::Any | Kind::Other => EventKind::Other,
    };

    event
        .paths
        .iter()
        .map(|target| WatchEvent {
            kind,
            target: target.clone(),
            time,
        })
        .collect()
}

enum SessionCommand {
    Stop,
}

struct WatchSession {
    events: Arc<RwLock<Vec<WatchEvent>>>,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionExit {
    Expired,
    Stopped,
}

/// Single writer for one live watch
struct WatchActor {
    watch_id: String,
    store: WatchStore,
    events: Arc<RwLock<Vec<WatchEvent>>>,
    live_cap: usize,
    sessions: Arc<DashMap<String, WatchSession>>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    event_rx: mpsc::Receiver<notify::Result<Event>>,
}

impl WatchActor {
    async fn run(mut self, watcher: RecommendedWatcher, deadline: Instant) {
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        let exit = loop {
            tokio::select! {
                _ = &mut expiry => break SessionExit::Expired,

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(SessionCommand::Stop) | None => break SessionExit::Stopped,
                },

                Some(result) = self.event_rx.recv() => self.handle_notification(result).await,
            }
        };

        drop(watcher);

        match exit {
            SessionExit::Expired => self.expire().await,
            SessionExit::Stopped => debug!("Watch {} stopped", self.watch_id),
        }
    }

    async fn handle_notification(&self, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                warn!("File watcher error for watch {}: {}", self.watch_id, e);
                return;
            }
        };

        let batch = convert_event(&event, Utc::now().timestamp());
        if batch.is_empty() {
            return;
        }
        {
            let mut live = self.events.write();
            for watch_event in &batch {
                push_capped(&mut *live, watch_event.clone(), self.live_cap);
            }
        }

        let store = self.store.clone();
        let watch_id = self.watch_id.clone();
        match tokio::task::spawn_blocking(move || store.append_events(&watch_id, batch)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to persist events for watch {}: {}", self.watch_id, e),
            Err(e) => warn!("Event persistence task for watch {} failed: {}", self.watch_id, e),
        }
    }

    async fn expire(&self) {
        let now = Utc::now().timestamp();
        let store = self.store.clone();
        let watch_id = self.watch_id.clone();
        match tokio::task::spawn_blocking(move || store.mark_expired(&watch_id, now)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to mark watch {} expired: {}", self.watch_id, e),
            Err(e) => warn!("Expiry task for watch {} failed: {}", self.watch_id, e),
        }
        self.sessions.remove(&self.watch_id);
        info!("Watch {} expired", self.watch_id);
    }
}

/// Owns every live watch session and the durable store behind them
pub struct WatchManager {
    store: WatchStore,
    config: WatchConfig,
    sessions: Arc<DashMap<String, WatchSession>>,
    live_cap: usize,
}

impl WatchManager {
    pub fn new(store: WatchStore, config: WatchConfig) -> Self {
        Self {
            store,
            config,
            sessions: Arc::new(DashMap::new()),
            live_cap: LIVE_EVENT_CAP,
        }
    }

    pub fn with_live_cap(mut self, live_cap: usize) -> Self {
        self.live_cap = live_cap.max(1);
        self
    }

    /// Start observing `path` for a clamped number of seconds.
    ///
    /// Returns as soon as the record is persisted and the actor is spawned.
    pub fn start_watch(&self, path: &Path, requested_seconds: Option<i64>) -> Result<WatchStarted> {
        let is_dir = std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(WatchError::InvalidPath(format!(
                "'{}' does not exist or is not a directory",
                path.display()
            )));
        }
        let path = std::fs::canonicalize(path).map_err(|e| {
            WatchError::InvalidPath(format!("Cannot resolve '{}': {}", path.display(), e))
        })?;

        let seconds = self.config.effective_seconds(requested_seconds);
        let watch_id = generate_watch_id()?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            if event_tx.blocking_send(result).is_err() {
                debug!("Watch event channel closed");
            }
        })
        .map_err(|e| WatchError::Backend(e.to_string()))?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&path, mode)
            .map_err(|e| WatchError::Backend(format!("Failed to watch '{}': {}", path.display(), e)))?;

        let started_at = Utc::now().timestamp();
        let expires_at = started_at + seconds;
        let record = WatchRecord::new(watch_id.clone(), path.clone(), started_at, expires_at);
        self.store.create(&record)?;

        let events = Arc::new(RwLock::new(Vec::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        self.sessions.insert(
            watch_id.clone(),
            WatchSession {
                events: events.clone(),
                cmd_tx,
            },
        );

        let actor = WatchActor {
            watch_id: watch_id.clone(),
            store: self.store.clone(),
            events,
            live_cap: self.live_cap,
            sessions: self.sessions.clone(),
            cmd_rx,
            event_rx,
        };
        let deadline = Instant::now() + Duration::from_secs(seconds as u64);
        tokio::spawn(actor.run(watcher, deadline));

        info!("Watching {:?} as {} for {}s", path, watch_id, seconds);
        Ok(WatchStarted {
            watch_id,
            expires_at,
        })
    }

    /// Live buffer if the watch is active, otherwise the durable events
    pub fn get_events(&self, watch_id: &str) -> Result<Vec<WatchEvent>> {
        if !is_valid_watch_id(watch_id) {
            return Err(WatchError::NotFound(watch_id.to_string()));
        }
        if let Some(session) = self.sessions.get(watch_id) {
            return Ok(session.events.read().clone());
        }
        match self.store.read(watch_id)? {
            Some(record) => Ok(record.events),
            None => Err(WatchError::NotFound(watch_id.to_string())),
        }
    }

    /// The durable record, including `expired` and `expiredAt`
    pub fn get_record(&self, watch_id: &str) -> Result<WatchRecord> {
        if !is_valid_watch_id(watch_id) {
            return Err(WatchError::NotFound(watch_id.to_string()));
        }
        self.store
            .read(watch_id)?
            .ok_or_else(|| WatchError::NotFound(watch_id.to_string()))
    }

    /// Every watch with a durable record, active or expired
    pub fn list_watch_ids(&self) -> Result<Vec<String>> {
        Ok(self.store.list_ids()?)
    }

    pub fn active_watch_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_active(&self, watch_id: &str) -> bool {
        self.sessions.contains_key(watch_id)
    }

    /// Mark records left live by a previous process as expired.
    ///
    /// Returns how many records were updated.
    pub fn reconcile(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let mut updated = 0;
        for watch_id in self.store.list_ids()? {
            if self.sessions.contains_key(&watch_id) {
                continue;
            }
            match self.store.read(&watch_id) {
                Ok(Some(record)) if !record.expired => {
                    self.store.mark_expired(&watch_id, now)?;
                    updated += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable watch record {}: {}", watch_id, e),
            }
        }
        if updated > 0 {
            info!("Marked {} stale watch record(s) expired", updated);
        }
        Ok(updated)
    }

    /// Stop every live session without marking its record expired
    pub fn shutdown(&self) {
        let ids = self.active_watch_ids();
        for watch_id in ids {
            if let Some((_, session)) = self.sessions.remove(&watch_id) {
                // A full channel means the actor is busy; dropping the sender ends it too
                let _ = session.cmd_tx.try_send(SessionCommand::Stop);
            }
        }
        debug!("Watch manager shut down");
    }
}

impl Drop for WatchManager {
    fn drop(&mut self) {
        self.sessions.clear();
    }
}
