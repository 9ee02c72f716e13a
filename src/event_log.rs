//! Bounded history of decisions, oldest first.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use crate::flow::{Direction, Flow, Protocol};
use crate::policy::{quarantine, write_atomic, StoreError};

pub const DEFAULT_CAPACITY: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallEvent {
    pub timestamp: DateTime<Utc>,
    pub app_id: String,
    pub remote_address: String,
    pub remote_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    pub allowed: bool,
    /// Set when the verdict came from the default rather than from a policy or the user.
    #[serde(default)]
    pub auto_resolved: bool,
}

fn default_protocol() -> Protocol { Protocol::Tcp }
fn default_direction() -> Direction { Direction::Outbound }

impl FirewallEvent {
    pub fn for_flow(flow: &Flow, allowed: bool, auto_resolved: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            app_id: flow.app_id.clone(),
            remote_address: flow.remote_address.clone(),
            remote_port: flow.remote_port,
            protocol: flow.protocol,
            direction: flow.direction,
            allowed,
            auto_resolved,
        }
    }
}

pub struct EventLog {
    capacity: usize,
    path: Option<PathBuf>,
    events: Mutex<VecDeque<FirewallEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            path: None,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// A log mirrored to `path` by [`EventLog::flush`]. Existing entries are
    /// loaded, keeping the newest `capacity` of them.
    pub fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let mut log = Self::new(capacity);
        let mut loaded = read_file(&path)?;
        if loaded.len() > log.capacity {
            loaded.drain(..loaded.len() - log.capacity);
        }
        info!("Loaded {} events from {}", loaded.len(), path.display());
        log.events = Mutex::new(loaded.into());
        log.path = Some(path);
        Ok(log)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `event`, evicting the oldest entry when full.
    pub fn append(&self, event: FirewallEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Snapshot in arrival order, oldest first.
    pub fn recent(&self) -> Vec<FirewallEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Writes the current buffer to disk, if the log has a path.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else { return Ok(()) };
        let snapshot = self.recent();
        let content = serde_json::to_vec(&snapshot)
            .map_err(|source| StoreError::Json { path: path.clone(), source })?;
        write_atomic(path, &content)?;
        debug!("Flushed {} events to {}", snapshot.len(), path.display());
        Ok(())
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn read_file(path: &Path) -> Result<Vec<FirewallEvent>, StoreError> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(StoreError::Io { path: path.to_path_buf(), source }),
    };
    if content.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_slice(&content) {
        Ok(events) => Ok(events),
        Err(e) => {
            warn!("Events in {} are unreadable ({}), starting empty", path.display(), e);
            quarantine(path);
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowId;

    fn event(port: u16) -> FirewallEvent {
        let flow = Flow::new(
            FlowId(port as u64),
            "com.example.App",
            "93.184.216.34",
            port,
            Protocol::Tcp,
            Direction::Outbound,
        );
        FirewallEvent::for_flow(&flow, true, false)
    }

    #[test]
    fn evicts_exactly_the_oldest_entry() {
        let log = EventLog::new(3);
        for port in 1..=3 {
            log.append(event(port));
        }
        assert_eq!(log.len(), 3);

        log.append(event(4));
        let ports: Vec<u16> = log.recent().iter().map(|e| e.remote_port).collect();
        assert_eq!(ports, vec![2, 3, 4]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let log = EventLog::new(10);
        for port in 0..100 {
            log.append(event(port));
            assert!(log.len() <= 10);
        }
        assert_eq!(log.recent().first().unwrap().remote_port, 90);
    }

    #[test]
    fn zero_capacity_still_keeps_one() {
        let log = EventLog::new(0);
        log.append(event(1));
        log.append(event(2));
        assert_eq!(log.recent().len(), 1);
    }

    #[test]
    fn flush_and_reopen_trims_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        let log = EventLog::open(&path, 5).unwrap();
        for port in 0..5 {
            log.append(event(port));
        }
        log.flush().unwrap();

        let smaller = EventLog::open(&path, 2).unwrap();
        let ports: Vec<u16> = smaller.recent().iter().map(|e| e.remote_port).collect();
        assert_eq!(ports, vec![3, 4]);
    }

    #[test]
    fn older_records_without_new_fields_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        fs::write(
            &path,
            r#"[{"timestamp":"2024-01-01T00:00:00Z","app_id":"com.x",
                "remote_address":"1.1.1.1","remote_port":443,"allowed":false,"extra":true}]"#,
        )
        .unwrap();
        let log = EventLog::open(&path, 10).unwrap();
        let events = log.recent();
        assert_eq!(events.len(), 1);
        assert!(!events[0].auto_resolved);
        assert_eq!(events[0].protocol, Protocol::Tcp);
    }

    #[test]
    fn corrupt_log_starts_empty_and_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");
        fs::write(&path, "[{\"timestamp\":").unwrap();

        let log = EventLog::open(&path, 10).unwrap();
        assert!(log.is_empty());
        assert!(dir.path().join("events.json.bad").exists());

        log.append(event(1));
        log.flush().unwrap();
        assert_eq!(EventLog::open(&path, 10).unwrap().len(), 1);
    }
}
