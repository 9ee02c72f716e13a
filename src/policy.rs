//! Per-application allow/deny policies.
//!
//! The map lives in memory behind a lock and is mirrored to a JSON file that
//! the UI process also reads and writes. Both sides merge by timestamp before
//! saving, so an older entry never overwrites a newer one. Removals are kept
//! as timestamped tombstones for a while so they merge the same way.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// How long a removal is remembered for other writers to pick up.
const TOMBSTONE_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode or decode {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub app_id: String,
    pub allowed: bool,
    pub updated_at: DateTime<Utc>,
    /// Tombstone for an explicit removal. Never returned by the public getters.
    #[serde(default, skip_serializing_if = "is_false")]
    pub removed: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Policy {
    fn new(app_id: &str, allowed: bool) -> Self {
        Self {
            app_id: app_id.to_string(),
            allowed,
            updated_at: Utc::now(),
            removed: false,
        }
    }

    fn tombstone(app_id: &str) -> Self {
        Self {
            removed: true,
            ..Self::new(app_id, false)
        }
    }

    fn is_live(&self) -> bool {
        !self.removed
    }
}

pub struct PolicyStore {
    path: Option<PathBuf>,
    policies: RwLock<HashMap<String, Policy>>,
    /// Serializes read-merge-write cycles on the backing file.
    write_lock: Mutex<()>,
    last_seen_mtime: Mutex<Option<SystemTime>>,
}

impl PolicyStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            policies: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            last_seen_mtime: Mutex::new(None),
        }
    }

    /// Opens the store backed by `path`, loading whatever is there.
    /// A missing file is an empty store; an unreadable one is moved aside.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let store = Self {
            path: Some(path.clone()),
            ..Self::in_memory()
        };
        let loaded = read_file(&path)?;
        info!(
            "Loaded {} policies from {}",
            loaded.values().filter(|p| p.is_live()).count(),
            path.display()
        );
        *store.policies.write() = loaded;
        *store.last_seen_mtime.lock() = mtime(&path);
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, app_id: &str) -> Option<Policy> {
        self.policies.read().get(app_id).filter(|p| p.is_live()).cloned()
    }

    /// Records a decision for `app_id` and saves it. The in-memory map is
    /// updated first, so a failed save still leaves the new value visible.
    pub fn set(&self, app_id: &str, allowed: bool) -> Result<Policy, StoreError> {
        let policy = Policy::new(app_id, allowed);
        debug!("Policy {} -> {}", app_id, if allowed { "allow" } else { "deny" });
        self.commit(|policies| {
            policies.insert(app_id.to_string(), policy.clone());
        })?;
        Ok(policy)
    }

    /// Like [`PolicyStore::set`] but memory only; pair with
    /// [`PolicyStore::persist`] off the async workers.
    pub fn record(&self, app_id: &str, allowed: bool) -> Policy {
        let policy = Policy::new(app_id, allowed);
        self.policies.write().insert(app_id.to_string(), policy.clone());
        policy
    }

    /// Merges the file and writes memory back to it. Blocking file I/O.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.commit(|_| {})
    }

    /// All policies ordered by application id.
    pub fn all(&self) -> Vec<Policy> {
        let mut list: Vec<Policy> = self
            .policies
            .read()
            .values()
            .filter(|p| p.is_live())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        list
    }

    pub fn len(&self) -> usize {
        self.policies.read().values().filter(|p| p.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the policy for `app_id`, including one another writer saved
    /// since the last load. Returns whether one existed.
    pub fn remove(&self, app_id: &str) -> Result<bool, StoreError> {
        let mut existed = false;
        self.commit(|policies| {
            if policies.get(app_id).is_some_and(Policy::is_live) {
                existed = true;
                policies.insert(app_id.to_string(), Policy::tombstone(app_id));
            }
        })?;
        Ok(existed)
    }

    /// Forgets every policy.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.commit(|policies| {
            for policy in policies.values_mut().filter(|p| p.is_live()) {
                *policy = Policy::tombstone(&policy.app_id);
            }
        })
    }

    /// Merges the file into memory, newer timestamps winning.
    pub fn reload(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else { return Ok(()) };
        let on_disk = read_file(path)?;
        let mut policies = self.policies.write();
        merge_newer(&mut policies, on_disk);
        *self.last_seen_mtime.lock() = mtime(path);
        info!("Reloaded policies from {}", path.display());
        Ok(())
    }

    /// Reloads only when the file changed since the last load or save.
    pub fn refresh_if_changed(&self) -> Result<bool, StoreError> {
        let Some(path) = &self.path else { return Ok(false) };
        let current = mtime(path);
        if current.is_none() || current == *self.last_seen_mtime.lock() {
            return Ok(false);
        }
        self.reload()?;
        Ok(true)
    }

    /// Merges the file into memory, applies `change`, and writes the result.
    /// `change` reaches memory even when the file cannot be read.
    fn commit(&self, change: impl FnOnce(&mut HashMap<String, Policy>)) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            change(&mut self.policies.write());
            return Ok(());
        };
        let _guard = self.write_lock.lock();

        // Pick up writes the other process made since we last looked.
        let on_disk = read_file(path);
        let snapshot = {
            let mut policies = self.policies.write();
            let on_disk = match on_disk {
                Ok(on_disk) => on_disk,
                Err(e) => {
                    change(&mut policies);
                    return Err(e);
                }
            };
            merge_newer(&mut policies, on_disk);
            change(&mut policies);
            prune_tombstones(&mut policies, Utc::now());
            policies.clone()
        };
        write_file(path, &snapshot)?;
        *self.last_seen_mtime.lock() = mtime(path);
        Ok(())
    }
}

fn merge_newer(into: &mut HashMap<String, Policy>, from: HashMap<String, Policy>) {
    for (app_id, theirs) in from {
        match into.get(&app_id) {
            Some(ours) if ours.updated_at >= theirs.updated_at => {}
            _ => {
                into.insert(app_id, theirs);
            }
        }
    }
}

fn prune_tombstones(policies: &mut HashMap<String, Policy>, now: DateTime<Utc>) {
    let retention = Duration::days(TOMBSTONE_RETENTION_DAYS);
    policies.retain(|_, p| p.is_live() || now - p.updated_at < retention);
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn read_file(path: &Path) -> Result<HashMap<String, Policy>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(source) => return Err(StoreError::Io { path: path.to_path_buf(), source }),
    };
    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let list: Vec<Policy> = match serde_json::from_str(&content) {
        Ok(list) => list,
        Err(e) => {
            warn!("Policies in {} are unreadable ({}), starting empty", path.display(), e);
            quarantine(path);
            return Ok(HashMap::new());
        }
    };

    let mut map = HashMap::with_capacity(list.len());
    for policy in list {
        if policy.app_id.is_empty() {
            warn!("Skipping policy with empty app id in {}", path.display());
            continue;
        }
        merge_newer(&mut map, HashMap::from([(policy.app_id.clone(), policy)]));
    }
    Ok(map)
}

fn write_file(path: &Path, policies: &HashMap<String, Policy>) -> Result<(), StoreError> {
    let mut list: Vec<&Policy> = policies.values().collect();
    list.sort_by(|a, b| a.app_id.cmp(&b.app_id));
    let content = serde_json::to_string_pretty(&list)
        .map_err(|source| StoreError::Json { path: path.to_path_buf(), source })?;
    write_atomic(path, content.as_bytes())
}

/// Writes to a sibling temp file and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io { path: path.to_path_buf(), source };
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
    }
    let tmp = sibling(path, &format!(".tmp{}", std::process::id()));
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

/// Moves an unparsable file to `<path>.bad` so the next save starts clean.
pub(crate) fn quarantine(path: &Path) {
    let bad = sibling(path, ".bad");
    match fs::rename(path, &bad) {
        Ok(()) => warn!("Moved {} to {}", path.display(), bad.display()),
        Err(e) => warn!("Could not move {} aside: {}", path.display(), e),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
