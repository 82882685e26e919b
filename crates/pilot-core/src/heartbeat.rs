//! Liveness timestamps on disk.
//!
//! The pilot periodically records when it (and the server) were last heard
//! from; a large gap in `last_pilot_update` means the host was suspended and
//! woke up again. The store is best-effort: every failure downgrades to a
//! warning so heartbeat trouble can never take the pilot down.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// The heartbeat document.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HeartbeatDoc {
    #[serde(default)]
    pub last_pilot_update: i64,
    #[serde(default)]
    pub last_server_update: i64,
}

/// Which counter to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatName {
    Pilot,
    Server,
}

/// Read-modify-write access to the heartbeat file.
///
/// The lock serialises writers within this process only; the write itself is
/// atomic (tmp + rename), so concurrent pilots sharing a path may lose an
/// update but never tear the document.
#[derive(Debug)]
pub struct HeartbeatStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HeartbeatStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Record `update_time` for the named counter. Returns false (after
    /// warning) when the file could not be updated.
    pub fn update(&self, name: HeartbeatName, update_time: i64) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut doc = self.read_unlocked();
        match name {
            HeartbeatName::Pilot => doc.last_pilot_update = update_time,
            HeartbeatName::Server => doc.last_server_update = update_time,
        }
        match self.write_unlocked(&doc) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to update heartbeat file {}: {err}", self.path.display());
                false
            }
        }
    }

    /// Record "now" for the named counter.
    pub fn touch(&self, name: HeartbeatName) -> bool {
        self.update(name, chrono::Utc::now().timestamp())
    }

    pub fn read(&self) -> HeartbeatDoc {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_unlocked()
    }

    pub fn last_update(&self, name: HeartbeatName) -> i64 {
        let doc = self.read();
        match name {
            HeartbeatName::Pilot => doc.last_pilot_update,
            HeartbeatName::Server => doc.last_server_update,
        }
    }

    /// True when more than `limit_secs` passed since the last pilot update,
    /// i.e. the host clock jumped while the pilot was frozen.
    pub fn is_suspended(&self, limit_secs: i64) -> bool {
        let last = self.last_update(HeartbeatName::Pilot);
        if last == 0 {
            return false;
        }
        chrono::Utc::now().timestamp() - last > limit_secs
    }

    fn read_unlocked(&self) -> HeartbeatDoc {
        if !self.path.exists() {
            return HeartbeatDoc::default();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!("failed to parse heartbeat file {}: {err}", self.path.display());
                    HeartbeatDoc::default()
                }
            },
            Err(err) => {
                warn!("failed to read heartbeat file {}: {err}", self.path.display());
                HeartbeatDoc::default()
            }
        }
    }

    fn write_unlocked(&self, doc: &HeartbeatDoc) -> std::io::Result<()> {
        write_atomic(&self.path, doc)
    }
}

fn write_atomic(path: &Path, doc: &HeartbeatDoc) -> std::io::Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(doc).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)
}

/// Default suspension threshold: ten minutes.
pub const SUSPENSION_LIMIT_SECS: i64 = 600;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_preserves_the_other_counter() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeartbeatStore::new(dir.path().join("heartbeat.json"));

        assert!(store.update(HeartbeatName::Pilot, 100));
        assert!(store.update(HeartbeatName::Server, 200));

        let doc = store.read();
        assert_eq!(doc.last_pilot_update, 100);
        assert_eq!(doc.last_server_update, 200);
    }

    #[test]
    fn suspension_is_detected_past_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeartbeatStore::new(dir.path().join("heartbeat.json"));
        let now = chrono::Utc::now().timestamp();

        store.update(HeartbeatName::Pilot, now - 700);
        assert!(store.is_suspended(600));

        store.update(HeartbeatName::Pilot, now - 10);
        assert!(!store.is_suspended(600));
    }

    #[test]
    fn no_heartbeat_yet_means_not_suspended() {
        let dir = tempfile::tempdir().unwrap();
        let store = HeartbeatStore::new(dir.path().join("heartbeat.json"));
        assert!(!store.is_suspended(600));
        assert_eq!(store.last_update(HeartbeatName::Pilot), 0);
    }

    #[test]
    fn corrupt_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heartbeat.json");
        std::fs::write(&path, "{{{").unwrap();
        let store = HeartbeatStore::new(&path);
        assert_eq!(store.read().last_pilot_update, 0);
        // and a fresh update repairs the file
        assert!(store.update(HeartbeatName::Pilot, 42));
        assert_eq!(store.last_update(HeartbeatName::Pilot), 42);
    }
}
