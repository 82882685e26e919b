//! Site configuration: queue settings and storage-endpoint descriptions.
//!
//! Loaded once at startup from a JSON document and shared read-only by
//! reference; nothing here mutates after load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, PilotError};
use crate::filespec::ProtocolSpec;

/// Description of one storage (DDM) endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageData {
    #[serde(default)]
    pub name: String,
    /// Endpoint flavour, e.g. `DATADISK`, `OS_ES`, `OS_LOGS`.
    #[serde(default, rename = "type")]
    pub storage_type: String,
    /// Space token descriptor.
    #[serde(default)]
    pub token: String,
    /// Deterministic endpoints derive the storage path from `scope:lfn`.
    #[serde(default)]
    pub is_deterministic: bool,
    /// Protocols per DDM activity, ordered by preference.
    #[serde(default)]
    pub arprotocols: BTreeMap<String, Vec<ProtocolSpec>>,
    /// Protocols by protocol id.
    #[serde(default)]
    pub rprotocols: BTreeMap<String, ProtocolSpec>,
    /// Environment commands per protocol id (objectstore credentials).
    #[serde(default)]
    pub special_setup: BTreeMap<String, String>,
}

impl StorageData {
    pub fn is_objectstore(&self) -> bool {
        matches!(self.storage_type.as_str(), "OS_ES" | "OS_LOGS")
    }
}

/// Configuration of the panda queue the pilot serves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueData {
    #[serde(default)]
    pub name: String,
    /// Copytool names per activity, in priority order.
    #[serde(default)]
    pub acopytools: BTreeMap<String, Vec<String>>,
    /// Storage-endpoint names per activity.
    #[serde(default)]
    pub astorages: BTreeMap<String, Vec<String>>,
    /// All configured copytools with their settings blobs.
    #[serde(default)]
    pub copytools: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub direct_access_lan: bool,
    #[serde(default)]
    pub direct_access_wan: bool,
    /// Minimum seconds between event-service output batches.
    #[serde(default = "default_es_stageout_gap")]
    pub es_stageout_gap: u64,
}

fn default_es_stageout_gap() -> u64 {
    600
}

/// Read-only view of the site configuration, shared by reference.
///
/// Replaces the process-wide mutable registry the pilot historically kept;
/// initialise once at startup and pass `Arc<InfoService>` around.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoService {
    #[serde(default)]
    pub queuedata: QueueData,
    /// Storage descriptions keyed by endpoint name.
    #[serde(default)]
    pub storages: BTreeMap<String, StorageData>,
}

impl InfoService {
    /// Load the site configuration document.
    pub fn load(path: &Path) -> Result<Self, PilotError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PilotError::new(ErrorCode::QueueData)
                .with_detail(format!("read {}: {err}", path.display()))
        })?;
        let mut info: Self = serde_json::from_str(&raw).map_err(|err| {
            PilotError::new(ErrorCode::QueueDataNotOk)
                .with_detail(format!("parse {}: {err}", path.display()))
        })?;
        for (name, storage) in &mut info.storages {
            if storage.name.is_empty() {
                storage.name = name.clone();
            }
        }
        Ok(info)
    }

    pub fn storage(&self, ddmendpoint: &str) -> Option<&StorageData> {
        self.storages.get(ddmendpoint)
    }

    /// Preferred local input endpoints for replica lookups.
    ///
    /// Seeded from the `read_lan` activity; older queue configurations used
    /// the activity name `pr` for the same list.
    pub fn input_ddms(&self) -> Vec<String> {
        let astorages = &self.queuedata.astorages;
        astorages
            .get("read_lan")
            .or_else(|| astorages.get("pr"))
            .cloned()
            .unwrap_or_default()
    }
}

/// Map a pilot transfer activity onto the DDM activity naming used by
/// storage protocol tables.
pub fn ddm_activity(activity: &str) -> &str {
    match activity {
        "pr" => "read_lan",
        "pw" => "write_lan",
        "pl" => "write_lan",
        "es_events" | "es_failover" => "write_lan",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> InfoService {
        serde_json::from_value(serde_json::json!({
            "queuedata": {
                "name": "SITE_QUEUE",
                "acopytools": {"default": ["mv"]},
                "astorages": {"read_lan": ["SITE_DATADISK"], "pr": ["OLD_DISK"]},
                "direct_access_lan": true
            },
            "storages": {
                "SITE_DATADISK": {
                    "type": "DATADISK",
                    "is_deterministic": true,
                    "arprotocols": {
                        "write_lan": [{"endpoint": "srm://x/", "path": "/atlas/", "flavour": "SRM"}]
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn storage_names_are_backfilled_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, serde_json::to_string(&sample_info()).unwrap()).unwrap();

        let info = InfoService::load(&path).unwrap();
        assert_eq!(info.storage("SITE_DATADISK").unwrap().name, "SITE_DATADISK");
        assert!(info.storage("NOWHERE").is_none());
    }

    #[test]
    fn input_ddms_prefers_read_lan_over_legacy_name() {
        let info = sample_info();
        assert_eq!(info.input_ddms(), vec!["SITE_DATADISK".to_string()]);

        let mut legacy = info.clone();
        legacy.queuedata.astorages.remove("read_lan");
        assert_eq!(legacy.input_ddms(), vec!["OLD_DISK".to_string()]);
    }

    #[test]
    fn ddm_activity_aliases() {
        assert_eq!(ddm_activity("pr"), "read_lan");
        assert_eq!(ddm_activity("pw"), "write_lan");
        assert_eq!(ddm_activity("write_lan"), "write_lan");
        assert_eq!(ddm_activity("default"), "default");
    }

    #[test]
    fn corrupt_document_maps_to_queuedata_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = InfoService::load(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueDataNotOk);
    }
}
