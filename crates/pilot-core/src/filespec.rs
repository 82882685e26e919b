//! One logical file in flight through the pilot.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How the payload is allowed to reach the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Not decided yet; the queue policy picks.
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Payload reads the file over the network from storage.
    #[serde(rename = "direct")]
    Direct,
    /// File is copied to the local work directory first.
    #[serde(rename = "copy")]
    Copy,
}

/// Transfer state of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    #[default]
    #[serde(rename = "")]
    Pending,
    #[serde(rename = "transferred")]
    Transferred,
    #[serde(rename = "failed")]
    Failed,
    /// Left on remote storage for direct access; no local copy is made.
    #[serde(rename = "remote_io")]
    RemoteIo,
}

/// A storage protocol entry attached to a file or endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub flavour: String,
    #[serde(default)]
    pub id: Option<i64>,
    /// Backend-specific settings (objectstore credential key names).
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Description of one logical file and everything the mover learns about it.
///
/// A `FileSpec` is created when its job is acquired and is mutated only by
/// the stage currently holding the job; once the job reaches a terminal
/// queue the spec is frozen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSpec {
    // identity
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub lfn: String,
    #[serde(default)]
    pub guid: String,

    // placement
    #[serde(default)]
    pub ddmendpoint: String,
    /// Preferred local endpoints, in order.
    #[serde(default)]
    pub inputddms: Vec<String>,
    /// Ordered `(endpoint, pfns)` pairs; `None` until the resolver ran.
    #[serde(default)]
    pub replicas: Option<Vec<(String, Vec<String>)>>,
    #[serde(default)]
    pub protocols: Vec<ProtocolSpec>,
    #[serde(default)]
    pub protocol_id: Option<i64>,

    // transfer
    #[serde(default)]
    pub turl: String,
    #[serde(default)]
    pub surl: String,
    #[serde(default)]
    pub filesize: u64,
    /// Checksums by algorithm name (`adler32`, `md5`), hex encoded.
    #[serde(default)]
    pub checksum: BTreeMap<String, String>,

    // policy
    #[serde(default)]
    pub accessmode: AccessMode,
    #[serde(default)]
    pub allowremoteinputs: bool,

    // state
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub status_code: i32,

    // workspace
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub activity: String,
}

impl FileSpec {
    pub fn new(scope: &str, lfn: &str) -> Self {
        Self {
            scope: scope.to_string(),
            lfn: lfn.to_string(),
            ..Self::default()
        }
    }

    /// Whether this file is a candidate for direct access.
    ///
    /// With `ensure_replica` the resolved replica list must actually hold a
    /// PFN usable for direct reads; without it only the declared access mode
    /// is consulted (used before replicas are resolved).
    pub fn is_directaccess(&self, ensure_replica: bool, local_schemas: &[&str]) -> bool {
        if self.accessmode != AccessMode::Direct {
            return false;
        }
        if !ensure_replica {
            return true;
        }
        match &self.replicas {
            None => false,
            Some(replicas) => replicas.iter().any(|(_, pfns)| {
                pfns.iter()
                    .any(|pfn| matches_any_schema(pfn, local_schemas))
            }),
        }
    }

    /// Mark the file transferred and clear the failure code.
    pub fn set_transferred(&mut self) {
        self.status = FileStatus::Transferred;
        self.status_code = 0;
    }

    /// Mark the file as served by remote I/O (direct access).
    pub fn set_remote_io(&mut self) {
        self.status = FileStatus::RemoteIo;
        self.status_code = 0;
    }

    pub fn set_failed(&mut self, code: crate::error::ErrorCode) {
        self.status = FileStatus::Failed;
        self.status_code = code.value();
    }

    /// `scope:lfn`, the canonical data identifier.
    pub fn did(&self) -> String {
        format!("{}:{}", self.scope, self.lfn)
    }
}

/// True when `pfn` speaks one of `schemas`; an empty schema matches any.
pub fn matches_any_schema(pfn: &str, schemas: &[&str]) -> bool {
    schemas
        .iter()
        .any(|schema| schema.is_empty() || pfn.starts_with(&format!("{schema}://")))
}
