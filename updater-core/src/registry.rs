//! Update registry.
//!
//! The registry owns every [`UpdateRecord`] once it has been registered and
//! announces each mutation as a [`RegistryEvent`]. Events are published while
//! the registry lock is held, so subscribers observe them in mutation order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::record::{PersistentStatus, UpdateRecord, UpdateStatus};

/// Capacity of the event channel. Slow subscribers past this lag and skip.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind of change announced by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryEventKind {
    StatusChanged,
    DownloadProgress,
    InstallProgress,
}

/// A change to one record. Listeners read the current snapshot from the
/// registry, except for removals, which carry the last one.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub download_id: String,
    /// Monotonic per registry
    pub sequence: u64,
    /// Final `Deleted` snapshot of a record that left the registry
    pub removed: Option<UpdateRecord>,
}

impl RegistryEvent {
    pub fn new(kind: RegistryEventKind, download_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            kind,
            download_id: download_id.into(),
            sequence,
            removed: None,
        }
    }
}

/// Store of known updates.
///
/// `add_update` and `get_update` are atomic with respect to each other.
pub trait UpdateRegistry: Send + Sync {
    /// Register a record. Returns `true` if it was new.
    ///
    /// A local import always replaces the previous one. For other ids an
    /// existing record is kept and only its online flag is refreshed.
    fn add_update(&self, update: UpdateRecord) -> Result<bool, RegistryError>;

    /// Current snapshot of one record.
    fn get_update(&self, download_id: &str) -> Option<UpdateRecord>;

    /// Snapshots of all records.
    fn updates(&self) -> Vec<UpdateRecord>;

    /// Remove a record, returning it. Listeners see it one last time as
    /// `Deleted`.
    fn remove_update(&self, download_id: &str) -> Result<UpdateRecord, RegistryError>;

    /// Mutate a record in place and announce the change as `kind`.
    fn modify(
        &self,
        download_id: &str,
        kind: RegistryEventKind,
        change: &mut dyn FnMut(&mut UpdateRecord),
    ) -> Result<UpdateRecord, RegistryError>;

    /// Mark which records the remote feed advertises. Records not listed go
    /// offline; with `purge`, offline records with nothing durable are dropped.
    fn set_available_online(&self, download_ids: &[String], purge: bool);

    /// Ordered stream of changes from now on.
    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;
}

/// Durable part of a record, as written to the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedRecord {
    download_id: String,
    name: String,
    version: String,
    file: Option<PathBuf>,
    file_size: u64,
    timestamp: i64,
    download_url: String,
    persistent_status: PersistentStatus,
}

impl From<&UpdateRecord> for PersistedRecord {
    fn from(update: &UpdateRecord) -> Self {
        Self {
            download_id: update.download_id.clone(),
            name: update.name.clone(),
            version: update.version.clone(),
            file: update.file.clone(),
            file_size: update.file_size,
            timestamp: update.timestamp,
            download_url: update.download_url.clone(),
            persistent_status: update.persistent_status,
        }
    }
}

impl PersistedRecord {
    fn restore(self) -> UpdateRecord {
        UpdateRecord {
            download_id: self.download_id,
            name: self.name,
            version: self.version,
            file: self.file,
            file_size: self.file_size,
            timestamp: self.timestamp,
            download_url: self.download_url,
            status: UpdateStatus::restored_from(self.persistent_status),
            persistent_status: self.persistent_status,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct RegistryState {
    updates: HashMap<String, UpdateRecord>,
    sequence: u64,
}

/// In-memory registry with optional JSON persistence of durable fields.
pub struct InMemoryRegistry {
    state: RwLock<RegistryState>,
    events: broadcast::Sender<RegistryEvent>,
    state_file: Option<PathBuf>,
}

impl InMemoryRegistry {
    /// Create an empty, non-persistent registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            events,
            state_file: None,
        }
    }

    /// Create a registry backed by `state_file`, restoring what it holds.
    ///
    /// Restored records resume in [`UpdateStatus::restored_from`] their
    /// checkpoint. Records whose package has disappeared are dropped.
    pub fn with_state_file(state_file: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let state_file = state_file.into();
        let mut registry = Self::new();

        let restored = load_state(&state_file)?;
        {
            let mut state = registry.write_state()?;
            for record in restored {
                let update = record.restore();
                if !update.file_is_consistent() {
                    warn!(
                        download_id = %update.download_id,
                        "Dropping restored update whose package is missing"
                    );
                    continue;
                }
                state.updates.insert(update.download_id.clone(), update);
            }
            info!(
                path = %state_file.display(),
                count = state.updates.len(),
                "Update registry restored"
            );
        }

        registry.state_file = Some(state_file);
        Ok(registry)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, RegistryState>, RegistryError> {
        self.state
            .read()
            .map_err(|_| RegistryError::Internal("Lock poisoned".to_string()))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, RegistryState>, RegistryError> {
        self.state
            .write()
            .map_err(|_| RegistryError::Internal("Lock poisoned".to_string()))
    }

    /// Publish an event. Called with the write lock held.
    fn publish(&self, state: &mut RegistryState, kind: RegistryEventKind, download_id: &str) {
        state.sequence += 1;
        self.send(RegistryEvent::new(kind, download_id, state.sequence));
    }

    /// Publish the final snapshot of a removed record. Called with the write
    /// lock held.
    fn publish_removed(&self, state: &mut RegistryState, mut removed: UpdateRecord) {
        state.sequence += 1;
        removed.status = UpdateStatus::Deleted;
        removed.persistent_status = PersistentStatus::Unknown;
        removed.available_online = false;
        let mut event = RegistryEvent::new(
            RegistryEventKind::StatusChanged,
            removed.download_id.clone(),
            state.sequence,
        );
        event.removed = Some(removed);
        self.send(event);
    }

    fn send(&self, event: RegistryEvent) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }

    /// Persist durable fields. Called with the write lock held.
    fn persist(&self, state: &RegistryState) {
        let Some(path) = &self.state_file else {
            return;
        };
        let mut records: Vec<PersistedRecord> = state
            .updates
            .values()
            .filter(|u| u.persistent_status != PersistentStatus::Unknown)
            .map(PersistedRecord::from)
            .collect();
        records.sort_by(|a, b| a.download_id.cmp(&b.download_id));

        if let Err(e) = save_state(path, &records) {
            warn!(path = %path.display(), error = %e, "Failed to persist update registry");
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateRegistry for InMemoryRegistry {
    fn add_update(&self, update: UpdateRecord) -> Result<bool, RegistryError> {
        let mut state = self.write_state()?;
        let download_id = update.download_id.clone();

        if !update.is_local() {
            if let Some(existing) = state.updates.get_mut(&download_id) {
                existing.available_online |= update.available_online;
                debug!(download_id = %download_id, "Update already known");
                return Ok(false);
            }
        }

        info!(
            download_id = %download_id,
            status = ?update.status,
            "Registering update"
        );
        state.updates.insert(download_id.clone(), update);
        self.publish(&mut state, RegistryEventKind::StatusChanged, &download_id);
        self.persist(&state);
        Ok(true)
    }

    fn get_update(&self, download_id: &str) -> Option<UpdateRecord> {
        self.read_state().ok()?.updates.get(download_id).cloned()
    }

    fn updates(&self) -> Vec<UpdateRecord> {
        match self.read_state() {
            Ok(state) => {
                let mut updates: Vec<UpdateRecord> = state.updates.values().cloned().collect();
                updates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                updates
            }
            Err(_) => Vec::new(),
        }
    }

    fn remove_update(&self, download_id: &str) -> Result<UpdateRecord, RegistryError> {
        let mut state = self.write_state()?;
        let removed = state
            .updates
            .remove(download_id)
            .ok_or_else(|| RegistryError::NotFound(download_id.to_string()))?;
        info!(download_id = %download_id, "Update removed from registry");
        self.publish_removed(&mut state, removed.clone());
        self.persist(&state);
        Ok(removed)
    }

    fn modify(
        &self,
        download_id: &str,
        kind: RegistryEventKind,
        change: &mut dyn FnMut(&mut UpdateRecord),
    ) -> Result<UpdateRecord, RegistryError> {
        let mut state = self.write_state()?;
        let (snapshot, durable_changed) = {
            let update = state
                .updates
                .get_mut(download_id)
                .ok_or_else(|| RegistryError::NotFound(download_id.to_string()))?;
            let before = PersistedRecord::from(&*update);
            change(update);
            let after = PersistedRecord::from(&*update);
            (update.clone(), before != after)
        };

        self.publish(&mut state, kind, download_id);
        if durable_changed {
            self.persist(&state);
        }
        Ok(snapshot)
    }

    fn set_available_online(&self, download_ids: &[String], purge: bool) {
        let Ok(mut state) = self.write_state() else {
            return;
        };

        let mut offline = Vec::new();
        let mut purged = Vec::new();
        for update in state.updates.values_mut() {
            if download_ids.iter().any(|id| *id == update.download_id) {
                continue;
            }
            if purge && update.persistent_status == PersistentStatus::Unknown {
                purged.push(update.download_id.clone());
            } else if update.available_online {
                update.available_online = false;
                offline.push(update.download_id.clone());
            }
        }
        offline.sort();
        purged.sort();

        for download_id in &offline {
            debug!(download_id = %download_id, "Update went offline");
            self.publish(&mut state, RegistryEventKind::StatusChanged, download_id);
        }
        for download_id in &purged {
            if let Some(removed) = state.updates.remove(download_id) {
                debug!(download_id = %download_id, "Purged offline update");
                self.publish_removed(&mut state, removed);
            }
        }
        if !purged.is_empty() {
            self.persist(&state);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

fn load_state(path: &Path) -> Result<Vec<PersistedRecord>, RegistryError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).map_err(|e| RegistryError::Load(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| RegistryError::Load(e.to_string()))
}

/// Write to a temp file first, then rename over the state file.
fn save_state(path: &Path, records: &[PersistedRecord]) -> Result<(), RegistryError> {
    let content =
        serde_json::to_string_pretty(records).map_err(|e| RegistryError::Persist(e.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| RegistryError::Persist(e.to_string()))?;
    }
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).map_err(|e| RegistryError::Persist(e.to_string()))?;
    fs::rename(&temp_path, path).map_err(|e| RegistryError::Persist(e.to_string()))?;
    Ok(())
}

/// Shared handle used across the daemon.
pub type SharedRegistry = Arc<dyn UpdateRegistry>;
