//! Pilot configuration file handling.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, PilotError};

/// Static pilot settings, loaded once at startup.
///
/// `PANDA_SERVER_URL` in the environment overrides `server_url` at request
/// time; everything else is taken from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotConfig {
    /// Workload-management server base URL.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Replica catalog base URL.
    #[serde(default)]
    pub catalog_url: String,
    /// Name of the panda queue this pilot serves.
    #[serde(default)]
    pub pandaqueue: String,
    /// Base directory for per-job work directories.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Pilot source directory, removed on forced shutdown.
    #[serde(default)]
    pub sourcedir: Option<PathBuf>,
    /// Location of the heartbeat document.
    #[serde(default = "default_heartbeat_file")]
    pub heartbeat_file: PathBuf,
    /// Seconds to idle between job requests when the server has no work.
    #[serde(default = "default_job_fetch_backoff")]
    pub job_fetch_backoff: u64,
}

fn default_server_url() -> String {
    "https://pandaserver.cern.ch:25443".to_string()
}

// under harvester the work directories live in its managed area
fn default_workdir() -> PathBuf {
    match std::env::var("HARVESTER_WORKDIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from("."),
    }
}

fn default_heartbeat_file() -> PathBuf {
    PathBuf::from("pilot_heartbeat.json")
}

fn default_job_fetch_backoff() -> u64 {
    60
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            catalog_url: String::new(),
            pandaqueue: String::new(),
            workdir: default_workdir(),
            sourcedir: None,
            heartbeat_file: default_heartbeat_file(),
            job_fetch_backoff: default_job_fetch_backoff(),
        }
    }
}

impl PilotConfig {
    /// Load the configuration document, or defaults when `path` is absent.
    pub fn load(path: &Path) -> Result<Self, PilotError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PilotError::new(ErrorCode::FileHandlingFailure)
                .with_kwarg("reason", format!("read {}: {err}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            PilotError::new(ErrorCode::ConversionFailure)
                .with_kwarg("reason", format!("parse {}: {err}", path.display()))
        })
    }

    /// Server URL after applying the environment override.
    pub fn resolved_server_url(&self) -> String {
        std::env::var("PANDA_SERVER_URL").unwrap_or_else(|_| self.server_url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = PilotConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.job_fetch_backoff, 60);
        assert_eq!(cfg.heartbeat_file, PathBuf::from("pilot_heartbeat.json"));
    }

    #[test]
    fn partial_document_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.json");
        std::fs::write(&path, r#"{"pandaqueue": "SITE_QUEUE"}"#).unwrap();
        let cfg = PilotConfig::load(&path).unwrap();
        assert_eq!(cfg.pandaqueue, "SITE_QUEUE");
        assert_eq!(cfg.server_url, default_server_url());
    }

    #[test]
    fn garbage_is_a_conversion_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pilot.json");
        std::fs::write(&path, "]").unwrap();
        let err = PilotConfig::load(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConversionFailure);
    }
}
