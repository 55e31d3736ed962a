//! Persistent whitelist of trusted devices.
//!
//! The table lives behind a reader/writer lock. Saves snapshot the table under
//! the shared lock and write outside it; events are sent after locks are released.

pub mod persist;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::models::{DeviceIdentity, DeviceInfo, DeviceRecord, TrustLevel};
use crate::error::StoreError;

pub const SCHEMA_VERSION: &str = "1.0";

const AUTOSAVE_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Loaded { count: usize },
    Saved { count: usize },
    Error(String),
    HashMismatch {
        device_id: DeviceIdentity,
        expected: String,
        actual: String,
    },
    DeviceAdded(DeviceIdentity),
    DeviceUpdated(DeviceIdentity),
    DeviceRemoved(DeviceIdentity),
}

/// Result of checking a freshly computed hash against the stored baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashVerification {
    Match,
    Mismatch { expected: String, actual: String },
    /// The record exists but has no baseline yet.
    NoBaseline,
    UnknownDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Add records whose ids are not present; keep existing ones.
    Merge,
    /// Drop the current table and take the imported records.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    EmptyId,
    TrustedWithoutHash(DeviceIdentity),
    InvalidFirstSeen(DeviceIdentity),
    LastSeenBeforeFirstSeen(DeviceIdentity),
    KeyMismatch { key: DeviceIdentity, record_id: DeviceIdentity },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyId => write!(f, "record with empty unique_id"),
            Self::TrustedWithoutHash(id) => write!(f, "{id}: trusted but has no baseline hash"),
            Self::InvalidFirstSeen(id) => write!(f, "{id}: missing or invalid first_seen"),
            Self::LastSeenBeforeFirstSeen(id) => write!(f, "{id}: last_seen precedes first_seen"),
            Self::KeyMismatch { key, record_id } => {
                write!(f, "{key}: stored under a key that differs from unique_id {record_id}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub trusted: usize,
    pub auto_mount: usize,
    pub hashed: usize,
    pub last_saved: Option<DateTime<Utc>>,
    pub last_backup: Option<DateTime<Utc>>,
    pub file_size_bytes: u64,
}

/// On-disk layout; bookkeeping fields such as `last_modified` are written but not needed on load.
#[derive(Debug, Deserialize)]
struct WhitelistFile {
    version: String,
    #[serde(default)]
    devices: Vec<DeviceRecord>,
}

#[derive(Default)]
struct StoreState {
    devices: HashMap<DeviceIdentity, DeviceRecord>,
    dirty: bool,
    generation: u64,
    last_saved: Option<DateTime<Utc>>,
    last_backup: Option<DateTime<Utc>>,
}

impl StoreState {
    fn touch(&mut self) {
        self.dirty = true;
        self.generation += 1;
    }
}

/// First 16 characters of a digest for display; never splits a character.
pub fn short_hash(hash: &str) -> &str {
    match hash.char_indices().nth(16) {
        Some((end, _)) => &hash[..end],
        None => hash,
    }
}

/// Case-insensitive comparison of two hex digests.
pub fn compare(stored: &str, candidate: &str) -> bool {
    stored.trim().eq_ignore_ascii_case(candidate.trim())
}

pub struct WhitelistStore {
    path: PathBuf,
    state: RwLock<StoreState>,
    save_lock: Mutex<()>,
    events: Option<mpsc::UnboundedSender<StoreEvent>>,
    auto_save: AtomicBool,
    autosave_wake: Notify,
}

impl WhitelistStore {
    /// Open the whitelist at `path`. A missing file starts empty; an unreadable
    /// or unparseable one also starts empty and reports an error event.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::open_inner(path.into(), None)
    }

    pub fn open_with_events(
        path: impl Into<PathBuf>,
        events: mpsc::UnboundedSender<StoreEvent>,
    ) -> Self {
        Self::open_inner(path.into(), Some(events))
    }

    fn open_inner(path: PathBuf, events: Option<mpsc::UnboundedSender<StoreEvent>>) -> Self {
        let removed = persist::cleanup_staging(&path);
        if removed > 0 {
            warn!(count = removed, "Removed staging files left by an interrupted save");
        }

        let store = Self {
            path,
            state: RwLock::new(StoreState::default()),
            save_lock: Mutex::new(()),
            events,
            auto_save: AtomicBool::new(false),
            autosave_wake: Notify::new(),
        };

        match store.read_file(&store.path) {
            Ok(Some(devices)) => {
                let count = devices.len();
                store.state.write().devices = devices;
                info!(path = %store.path.display(), count, "Whitelist loaded");
                store.emit(StoreEvent::Loaded { count });
            }
            Ok(None) => {
                info!(path = %store.path.display(), "No whitelist yet, starting empty");
                store.emit(StoreEvent::Loaded { count: 0 });
            }
            Err(e) => {
                error!(error = %e, "Whitelist unreadable, starting empty");
                store.emit(StoreEvent::Error(e.to_string()));
                store.emit(StoreEvent::Loaded { count: 0 });
            }
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn mutated(&self, event: StoreEvent) {
        self.emit(event);
        if self.auto_save.load(Ordering::Relaxed) {
            self.autosave_wake.notify_one();
        }
    }

    // ----- queries -----

    pub fn has_device(&self, id: &DeviceIdentity) -> bool {
        self.state.read().devices.contains_key(id)
    }

    pub fn get_device(&self, id: &DeviceIdentity) -> Option<DeviceRecord> {
        self.state.read().devices.get(id).cloned()
    }

    pub fn all_devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<_> = self.state.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        devices
    }

    pub fn devices_where<F>(&self, predicate: F) -> Vec<DeviceRecord>
    where
        F: Fn(&DeviceRecord) -> bool,
    {
        let mut devices: Vec<_> = self
            .state
            .read()
            .devices
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        devices
    }

    pub fn device_count(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    // ----- CRUD -----

    pub fn add_device(&self, record: DeviceRecord) -> Result<(), StoreError> {
        let id = record.unique_id.clone();
        {
            let mut state = self.state.write();
            if state.devices.contains_key(&id) {
                return Err(StoreError::DuplicateDevice(id));
            }
            state.devices.insert(id.clone(), record);
            state.touch();
        }
        info!(identity = %id, "Device whitelisted");
        self.mutated(StoreEvent::DeviceAdded(id));
        Ok(())
    }

    pub fn update_device(&self, record: DeviceRecord) -> Result<(), StoreError> {
        let id = record.unique_id.clone();
        {
            let mut state = self.state.write();
            match state.devices.get_mut(&id) {
                Some(existing) => *existing = record,
                None => return Err(StoreError::UnknownDevice(id)),
            }
            state.touch();
        }
        self.mutated(StoreEvent::DeviceUpdated(id));
        Ok(())
    }

    pub fn upsert_device(&self, record: DeviceRecord) {
        let id = record.unique_id.clone();
        let existed = {
            let mut state = self.state.write();
            let existed = state.devices.insert(id.clone(), record).is_some();
            state.touch();
            existed
        };
        if existed {
            self.mutated(StoreEvent::DeviceUpdated(id));
        } else {
            self.mutated(StoreEvent::DeviceAdded(id));
        }
    }

    pub fn remove_device(&self, id: &DeviceIdentity) -> Result<(), StoreError> {
        {
            let mut state = self.state.write();
            if state.devices.remove(id).is_none() {
                return Err(StoreError::UnknownDevice(id.clone()));
            }
            state.touch();
        }
        info!(identity = %id, "Device removed from whitelist");
        self.mutated(StoreEvent::DeviceRemoved(id.clone()));
        Ok(())
    }

    /// Remove every listed id that exists; returns how many were removed.
    pub fn remove_devices(&self, ids: &[DeviceIdentity]) -> usize {
        let removed: Vec<DeviceIdentity> = {
            let mut state = self.state.write();
            let removed: Vec<_> = ids
                .iter()
                .filter(|id| state.devices.remove(*id).is_some())
                .cloned()
                .collect();
            if !removed.is_empty() {
                state.touch();
            }
            removed
        };
        let count = removed.len();
        for id in removed {
            self.mutated(StoreEvent::DeviceRemoved(id));
        }
        count
    }

    pub fn clear_all(&self) {
        let removed: Vec<DeviceIdentity> = {
            let mut state = self.state.write();
            let ids = state.devices.drain().map(|(id, _)| id).collect();
            state.touch();
            ids
        };
        warn!(count = removed.len(), "Whitelist cleared");
        for id in removed {
            self.mutated(StoreEvent::DeviceRemoved(id));
        }
    }

    /// Drop records with empty ids; returns how many were removed.
    pub fn compact(&self) -> usize {
        let removed: Vec<DeviceIdentity> = {
            let mut state = self.state.write();
            let removed: Vec<_> = state
                .devices
                .iter()
                .filter(|(key, record)| key.is_empty() || record.unique_id.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            for key in &removed {
                state.devices.remove(key);
            }
            if !removed.is_empty() {
                state.touch();
            }
            removed
        };
        let count = removed.len();
        if count > 0 {
            info!(count, "Compacted whitelist");
        }
        for id in removed {
            self.mutated(StoreEvent::DeviceRemoved(id));
        }
        count
    }

    fn modify<F>(&self, id: &DeviceIdentity, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        {
            let mut state = self.state.write();
            let record = state
                .devices
                .get_mut(id)
                .ok_or_else(|| StoreError::UnknownDevice(id.clone()))?;
            f(record);
            state.touch();
        }
        self.mutated(StoreEvent::DeviceUpdated(id.clone()));
        Ok(())
    }

    // ----- hash operations -----

    pub fn update_hash(
        &self,
        id: &DeviceIdentity,
        hash: &str,
        algorithm: &str,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        self.modify(id, |record| {
            record.hash = hash.to_ascii_lowercase();
            record.hash_algorithm = algorithm.to_string();
            record.hash_duration_ms = duration_ms;
            record.last_hashed = Some(Utc::now());
        })
    }

    pub fn get_hash(&self, id: &DeviceIdentity) -> Option<String> {
        self.state.read().devices.get(id).map(|r| r.hash.clone())
    }

    /// Compare a candidate against the stored baseline without side effects.
    pub fn verify_hash(&self, id: &DeviceIdentity, candidate: &str) -> HashVerification {
        let state = self.state.read();
        let Some(record) = state.devices.get(id) else {
            return HashVerification::UnknownDevice;
        };
        if !record.has_hash() {
            return HashVerification::NoBaseline;
        }
        if compare(&record.hash, candidate) {
            HashVerification::Match
        } else {
            HashVerification::Mismatch {
                expected: record.hash.clone(),
                actual: candidate.to_string(),
            }
        }
    }

    /// Publish a hash mismatch for `id`.
    pub fn report_mismatch(&self, id: &DeviceIdentity, expected: &str, actual: &str) {
        self.emit(StoreEvent::HashMismatch {
            device_id: id.clone(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    // ----- setters -----

    pub fn set_trust_level(&self, id: &DeviceIdentity, level: TrustLevel) -> Result<(), StoreError> {
        self.modify(id, |record| record.trust_level = level)
    }

    pub fn set_auto_mount(&self, id: &DeviceIdentity, enabled: bool) -> Result<(), StoreError> {
        self.modify(id, |record| record.auto_mount = enabled)
    }

    pub fn set_notes(&self, id: &DeviceIdentity, notes: &str) -> Result<(), StoreError> {
        self.modify(id, |record| record.notes = notes.to_string())
    }

    pub fn update_last_seen(&self, id: &DeviceIdentity) -> Result<(), StoreError> {
        self.modify(id, |record| record.last_seen = Some(Utc::now()))
    }

    pub fn update_device_info(&self, id: &DeviceIdentity, info: DeviceInfo) -> Result<(), StoreError> {
        self.modify(id, |record| record.device_info = info)
    }

    // ----- persistence -----

    fn serialize(
        devices: &HashMap<DeviceIdentity, DeviceRecord>,
        exported: bool,
        pretty: bool,
    ) -> Result<Vec<u8>, StoreError> {
        let mut records: Vec<&DeviceRecord> = devices.values().collect();
        records.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        let now = Utc::now();

        #[derive(Serialize)]
        struct Borrowed<'a> {
            version: &'static str,
            last_modified: DateTime<Utc>,
            #[serde(skip_serializing_if = "Option::is_none")]
            exported: Option<DateTime<Utc>>,
            device_count: usize,
            devices: Vec<&'a DeviceRecord>,
        }

        let file = Borrowed {
            version: SCHEMA_VERSION,
            last_modified: now,
            exported: exported.then_some(now),
            device_count: records.len(),
            devices: records,
        };
        let bytes = if pretty {
            serde_json::to_vec_pretty(&file)
        } else {
            serde_json::to_vec(&file)
        };
        bytes.map_err(StoreError::Serialize)
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<HashMap<DeviceIdentity, DeviceRecord>, StoreError> {
        let file: WhitelistFile =
            serde_json::from_slice(bytes).map_err(|source| StoreError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        if file.version != SCHEMA_VERSION {
            debug!(version = %file.version, "Whitelist written by a different schema version");
        }

        let mut devices = HashMap::with_capacity(file.devices.len());
        for record in file.devices {
            if record.unique_id.is_empty() {
                warn!(path = %path.display(), "Skipping whitelist record with empty unique_id");
                continue;
            }
            devices.insert(record.unique_id.clone(), record);
        }
        Ok(devices)
    }

    /// `Ok(None)` when the file does not exist or is empty.
    fn read_file(
        &self,
        path: &Path,
    ) -> Result<Option<HashMap<DeviceIdentity, DeviceRecord>>, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Self::parse(path, &bytes).map(Some)
    }

    /// Write the whole table. On failure the previous file is untouched and the
    /// store stays dirty.
    pub fn save(&self) -> Result<(), StoreError> {
        let _ordered = self.save_lock.lock();

        let (payload, generation, count) = {
            let state = self.state.read();
            (
                Self::serialize(&state.devices, false, true)?,
                state.generation,
                state.devices.len(),
            )
        };

        if let Err(source) = persist::write_atomic(&self.path, &payload) {
            let err = StoreError::WriteFailed {
                path: self.path.clone(),
                source,
            };
            error!(error = %err, "Whitelist save failed");
            self.emit(StoreEvent::Error(err.to_string()));
            return Err(err);
        }

        {
            let mut state = self.state.write();
            if state.generation == generation {
                state.dirty = false;
            }
            state.last_saved = Some(Utc::now());
        }
        debug!(path = %self.path.display(), count, "Whitelist saved");
        self.emit(StoreEvent::Saved { count });
        Ok(())
    }

    /// Re-read the file. On failure the in-memory table is kept.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let devices = self.read_file(&self.path)?.unwrap_or_default();
        let count = devices.len();
        {
            let mut state = self.state.write();
            state.devices = devices;
            state.dirty = false;
            state.generation += 1;
        }
        info!(count, "Whitelist reloaded");
        self.emit(StoreEvent::Loaded { count });
        Ok(count)
    }

    /// Write the current table to `dest` (or a timestamped file next to the
    /// database) and rotate old backups in that directory.
    pub fn create_backup(&self, dest: Option<&Path>) -> Result<PathBuf, StoreError> {
        let now = Utc::now();
        let dest = match dest {
            Some(path) => path.to_path_buf(),
            None => persist::backup_path(&self.path, now),
        };

        let payload = {
            let state = self.state.read();
            Self::serialize(&state.devices, false, true)?
        };

        persist::write_atomic(&dest, &payload).map_err(|source| StoreError::BackupFailed {
            path: dest.clone(),
            source,
        })?;

        if let Some(dir) = dest.parent() {
            persist::rotate_backups(&self.path, dir);
        }
        self.state.write().last_backup = Some(now);
        info!(backup = %dest.display(), "Whitelist backup created");
        Ok(dest)
    }

    pub fn list_backups(&self) -> Vec<PathBuf> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        persist::list_backups(&self.path, &dir)
    }

    /// Replace the table with the contents of `backup`, after backing up the
    /// current state.
    pub fn restore_from_backup(&self, backup: &Path) -> Result<usize, StoreError> {
        let devices = self
            .read_file(backup)
            .map_err(|e| match e {
                StoreError::ReadFailed { path, source } => StoreError::BackupFailed { path, source },
                other => other,
            })?
            .ok_or_else(|| StoreError::BackupFailed {
                path: backup.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "backup is missing or empty"),
            })?;

        let safety = self.create_backup(None)?;
        info!(safety = %safety.display(), "Safety backup taken before restore");

        let count = devices.len();
        {
            let mut state = self.state.write();
            state.devices = devices;
            state.touch();
        }
        self.save()?;
        info!(backup = %backup.display(), count, "Whitelist restored");
        self.emit(StoreEvent::Loaded { count });
        Ok(count)
    }

    pub fn export_to_file(&self, dest: &Path, pretty: bool) -> Result<usize, StoreError> {
        let (payload, count) = {
            let state = self.state.read();
            (Self::serialize(&state.devices, true, pretty)?, state.devices.len())
        };
        persist::write_atomic(dest, &payload).map_err(|source| StoreError::WriteFailed {
            path: dest.to_path_buf(),
            source,
        })?;
        info!(dest = %dest.display(), count, "Whitelist exported");
        Ok(count)
    }

    /// Returns the number of records added or replaced.
    pub fn import_from_file(&self, source: &Path, mode: ImportMode) -> Result<usize, StoreError> {
        let imported = self.read_file(source)?.unwrap_or_default();

        let changed: Vec<DeviceIdentity> = {
            let mut state = self.state.write();
            if mode == ImportMode::Replace {
                state.devices.clear();
            }
            let mut changed = Vec::new();
            for (id, record) in imported {
                if mode == ImportMode::Merge && state.devices.contains_key(&id) {
                    continue;
                }
                state.devices.insert(id.clone(), record);
                changed.push(id);
            }
            state.touch();
            changed
        };

        info!(source = %source.display(), count = changed.len(), ?mode, "Whitelist imported");
        let count = changed.len();
        self.mutated(StoreEvent::Loaded {
            count: self.device_count(),
        });
        Ok(count)
    }

    /// Report anomalies without changing anything.
    pub fn validate_integrity(&self) -> Vec<IntegrityIssue> {
        let state = self.state.read();
        let mut records: Vec<(&DeviceIdentity, &DeviceRecord)> = state.devices.iter().collect();
        records.sort_by(|a, b| a.0.cmp(b.0));

        let mut issues = Vec::new();
        for (key, record) in records {
            if key.is_empty() || record.unique_id.is_empty() {
                issues.push(IntegrityIssue::EmptyId);
                continue;
            }
            if *key != record.unique_id {
                issues.push(IntegrityIssue::KeyMismatch {
                    key: key.clone(),
                    record_id: record.unique_id.clone(),
                });
            }
            if record.trust_level > TrustLevel::New && !record.has_hash() {
                issues.push(IntegrityIssue::TrustedWithoutHash(key.clone()));
            }
            match (record.first_seen, record.last_seen) {
                (None, _) => issues.push(IntegrityIssue::InvalidFirstSeen(key.clone())),
                (Some(first), Some(last)) if last < first => {
                    issues.push(IntegrityIssue::LastSeenBeforeFirstSeen(key.clone()))
                }
                _ => {}
            }
        }
        issues
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        let devices = state.devices.values();
        StoreStats {
            total: state.devices.len(),
            trusted: devices
                .clone()
                .filter(|r| r.trust_level > TrustLevel::New)
                .count(),
            auto_mount: devices.clone().filter(|r| r.auto_mount).count(),
            hashed: devices.filter(|r| r.has_hash()).count(),
            last_saved: state.last_saved,
            last_backup: state.last_backup,
            file_size_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        }
    }

    // ----- auto-save -----

    pub fn set_auto_save(&self, enabled: bool) {
        self.auto_save.store(enabled, Ordering::Relaxed);
        if enabled && self.is_dirty() {
            self.autosave_wake.notify_one();
        }
    }

    /// Save in the background after mutations while auto-save is enabled.
    pub fn spawn_autosave(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(wake) = store.upgrade() else { break };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = wake.autosave_wake.notified() => {}
                }
                drop(wake);
                tokio::time::sleep(AUTOSAVE_DEBOUNCE).await;

                let Some(store) = store.upgrade() else { break };
                if !store.is_dirty() {
                    continue;
                }
                let result = tokio::task::spawn_blocking(move || store.save()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Auto-save failed, will retry on next change"),
                    Err(e) => error!(error = %e, "Auto-save task failed"),
                }
            }
            debug!("Auto-save task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::DeviceSnapshot;
    use tempfile::tempdir;

    fn record(serial: &str) -> DeviceRecord {
        let snapshot = DeviceSnapshot {
            device_node: PathBuf::from("/dev/sdb1"),
            serial: serial.to_string(),
            vendor: "Kingston".to_string(),
            model: "DT".to_string(),
            ..Default::default()
        };
        DeviceRecord::new(&snapshot, TrustLevel::New)
    }

    fn store() -> (tempfile::TempDir, WhitelistStore) {
        let dir = tempdir().unwrap();
        let store = WhitelistStore::open(dir.path().join("devices.json"));
        (dir, store)
    }

    #[test]
    fn test_add_rejects_duplicates_and_update_requires_existing() {
        let (_dir, store) = store();
        store.add_device(record("A")).unwrap();
        assert!(matches!(
            store.add_device(record("A")),
            Err(StoreError::DuplicateDevice(_))
        ));
        assert!(matches!(
            store.update_device(record("B")),
            Err(StoreError::UnknownDevice(_))
        ));
        store.upsert_device(record("B"));
        assert_eq!(store.device_count(), 2);
        assert!(store.is_dirty());
    }

    #[test]
    fn test_verify_hash_outcomes() {
        let (_dir, store) = store();
        let id = record("A").unique_id;
        store.add_device(record("A")).unwrap();

        assert_eq!(store.verify_hash(&id, "abc"), HashVerification::NoBaseline);
        store.update_hash(&id, "ABCDEF", "SHA256", 10).unwrap();
        assert_eq!(store.get_hash(&id).as_deref(), Some("abcdef"));
        assert_eq!(store.verify_hash(&id, "AbCdEf"), HashVerification::Match);
        assert_eq!(
            store.verify_hash(&id, "123456"),
            HashVerification::Mismatch {
                expected: "abcdef".into(),
                actual: "123456".into()
            }
        );
        assert_eq!(
            store.verify_hash(&DeviceIdentity::from("nope"), "abc"),
            HashVerification::UnknownDevice
        );
    }

    #[test]
    fn test_verify_hash_has_no_side_effects() {
        let dir = tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = WhitelistStore::open_with_events(dir.path().join("devices.json"), tx);
        store.add_device(record("A")).unwrap();
        let id = record("A").unique_id;
        store.update_hash(&id, "aa", "SHA256", 1).unwrap();
        while rx.try_recv().is_ok() {}

        let _ = store.verify_hash(&id, "bb");
        assert!(rx.try_recv().is_err());

        store.report_mismatch(&id, "aa", "bb");
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::HashMismatch {
                device_id: id,
                expected: "aa".into(),
                actual: "bb".into()
            }
        );
    }

    #[test]
    fn test_devices_where_and_remove() {
        let (_dir, store) = store();
        store.add_device(record("A")).unwrap();
        store.add_device(record("B")).unwrap();
        store.set_auto_mount(&record("B").unique_id, true).unwrap();

        let auto = store.devices_where(|r| r.auto_mount);
        assert_eq!(auto.len(), 1);
        assert_eq!(auto[0].unique_id, record("B").unique_id);

        let removed = store.remove_devices(&[record("A").unique_id, DeviceIdentity::from("x")]);
        assert_eq!(removed, 1);
        store.clear_all();
        assert_eq!(store.device_count(), 0);
    }

    #[test]
    fn test_validate_integrity_reports_without_mutating() {
        let (_dir, store) = store();
        let mut trusted = record("A");
        trusted.trust_level = TrustLevel::Trusted;
        let mut undated = record("B");
        undated.first_seen = None;
        let mut backwards = record("C");
        backwards.last_seen = Some(backwards.first_seen.unwrap() - chrono::Duration::days(1));
        let mut blank = record("D");
        blank.unique_id = DeviceIdentity::from("");

        store.add_device(trusted).unwrap();
        store.add_device(undated).unwrap();
        store.add_device(backwards).unwrap();
        store.add_device(blank).unwrap();

        let issues = store.validate_integrity();
        assert!(issues.contains(&IntegrityIssue::EmptyId));
        assert!(issues.contains(&IntegrityIssue::TrustedWithoutHash(record("A").unique_id)));
        assert!(issues.contains(&IntegrityIssue::InvalidFirstSeen(record("B").unique_id)));
        assert!(issues.contains(&IntegrityIssue::LastSeenBeforeFirstSeen(record("C").unique_id)));
        assert_eq!(store.device_count(), 4);

        assert_eq!(store.compact(), 1);
        assert!(!store.validate_integrity().contains(&IntegrityIssue::EmptyId));
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = store();
        let mut a = record("A");
        a.trust_level = TrustLevel::AlwaysAllow;
        a.hash = "ff".into();
        store.add_device(a).unwrap();
        store.add_device(record("B")).unwrap();
        store.save().unwrap();

        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.trusted, 1);
        assert_eq!(stats.hashed, 1);
        assert!(stats.last_saved.is_some());
        assert!(stats.file_size_bytes > 0);
    }

    #[test]
    fn test_short_hash_respects_char_boundaries() {
        assert_eq!(short_hash("0123456789abcdef0123"), "0123456789abcdef");
        assert_eq!(short_hash("abc"), "abc");
        assert_eq!(short_hash(""), "");
        let accented = "é".repeat(20);
        assert_eq!(short_hash(&accented).chars().count(), 16);
    }

    #[test]
    fn test_compare_is_case_insensitive() {
        assert!(compare("ABCdef", "abcDEF"));
        assert!(compare(" abc\n", "abc"));
        assert!(!compare("abc", "abd"));
    }
}
