//! Replica resolution: populate each file's ordered replica list from the
//! catalog, honouring local/remote preference and direct-access policy.

use tracing::{info, warn};

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::filespec::{AccessMode, FileSpec, matches_any_schema};
use gridpilot_core::infosys::InfoService;

use crate::catalog::{Did, ReplicaCatalog, detect_client_location};

/// Schemas usable for direct access against local replicas.
pub const DIRECT_LOCALINPUT_ALLOWED_SCHEMAS: &[&str] = &["root", "dcache", "dcap", "file", "https"];
/// Schemas usable for direct access against remote replicas.
pub const DIRECT_REMOTEINPUT_ALLOWED_SCHEMAS: &[&str] = &["root"];
/// Schemas usable for copy transfers from remote sites.
pub const REMOTEINPUT_ALLOWED_SCHEMAS: &[&str] = &["root", "gsiftp", "dcap", "davs", "srm"];
/// Schemes requested from the catalog.
pub const CATALOG_QUERY_SCHEMES: &[&str] = &["srm", "root", "davs", "gsiftp", "https"];

/// The replica chosen for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReplica {
    /// Transfer URL handed to the backend (or the payload, for direct access).
    pub pfn: String,
    /// Canonical storage URL.
    pub surl: String,
    pub ddmendpoint: String,
}

/// First PFN whose URL scheme appears earliest in `allowed_schemas`; an
/// empty schema matches any scheme.
pub fn get_preferred_replica<'a>(
    pfns: &'a [String],
    allowed_schemas: &[&str],
) -> Option<&'a String> {
    for &schema in allowed_schemas {
        for pfn in pfns {
            if !pfn.is_empty() && matches_any_schema(pfn, &[schema]) {
                return Some(pfn);
            }
        }
    }
    None
}

/// Populate `replicas` for each file from the catalog.
///
/// Files whose endpoint is unknown to the storage configuration fail the
/// whole call; the lookup itself is one catalog round-trip, geo-sorted when
/// any file allows remote inputs and the location probe succeeds.
pub async fn resolve_replicas(
    files: &mut [FileSpec],
    catalog: &dyn ReplicaCatalog,
    info: &InfoService,
) -> Result<(), PilotError> {
    for fspec in files.iter_mut() {
        if info.storage(&fspec.ddmendpoint).is_none() {
            return Err(PilotError::new(ErrorCode::QueueDataNotOk).with_detail(format!(
                "unknown input ddmendpoint {} for lfn={}",
                fspec.ddmendpoint, fspec.lfn
            )));
        }
        if fspec.inputddms.is_empty() {
            fspec.inputddms = info.input_ddms();
        }
    }
    if files.is_empty() {
        return Ok(());
    }

    let allow_remote = files.iter().any(|f| f.allowremoteinputs);
    let location = if allow_remote {
        detect_client_location()
    } else {
        None
    };

    let dids: Vec<Did> = files
        .iter()
        .map(|f| Did {
            scope: f.scope.clone(),
            name: f.lfn.clone(),
        })
        .collect();
    let records = catalog
        .list_replicas(CATALOG_QUERY_SCHEMES, &dids, location.as_ref())
        .await?;

    for record in records {
        let Some(fspec) = files
            .iter_mut()
            .find(|f| f.scope == record.scope && f.lfn == record.name)
        else {
            continue;
        };

        let mut replicas: Vec<(String, Vec<String>)> = Vec::new();
        let mut has_direct_local = false;

        for ddm in &fspec.inputddms {
            let Some(pfns) = record.rses.get(ddm) else {
                continue;
            };
            if pfns.is_empty() {
                continue;
            }
            replicas.push((ddm.clone(), pfns.clone()));
            if !has_direct_local {
                has_direct_local =
                    get_preferred_replica(pfns, DIRECT_LOCALINPUT_ALLOWED_SCHEMAS).is_some();
            }
        }

        let want_remote = (replicas.is_empty()
            || (fspec.accessmode == AccessMode::Direct && !has_direct_local))
            && fspec.allowremoteinputs;
        if want_remote {
            let allowed = if fspec.accessmode == AccessMode::Direct {
                DIRECT_REMOTEINPUT_ALLOWED_SCHEMAS
            } else {
                REMOTEINPUT_ALLOWED_SCHEMAS
            };
            info!(
                "looking for remote replicas of {}: accessmode={:?}, allowed_schemas={allowed:?}",
                fspec.lfn, fspec.accessmode
            );
            for (ddm, pfns) in &record.rses {
                if fspec.inputddms.contains(ddm) {
                    continue;
                }
                if get_preferred_replica(pfns, allowed).is_some() {
                    replicas.push((ddm.clone(), pfns.clone()));
                }
            }
        }

        fspec.replicas = Some(replicas);

        // reconcile size and checksums against the catalog
        if fspec.filesize != 0 && fspec.filesize != record.bytes {
            warn!(
                "filesize mismatch for {}: local={}, catalog={}",
                fspec.lfn, fspec.filesize, record.bytes
            );
        }
        if fspec.filesize == 0 {
            fspec.filesize = record.bytes;
        }
        for (ctype, value) in [("adler32", &record.adler32), ("md5", &record.md5)] {
            let Some(value) = value else { continue };
            match fspec.checksum.get(ctype) {
                Some(local) if local != value => {
                    warn!(
                        "{ctype} mismatch for {}: local={local}, catalog={value}",
                        fspec.lfn
                    );
                }
                Some(_) => {}
                None => {
                    fspec.checksum.insert(ctype.to_string(), value.clone());
                }
            }
        }
    }

    Ok(())
}

/// Default replica selection for one file.
///
/// When primary schemas are given (direct-access candidates) every endpoint
/// is searched for a primary match first, so a direct-readable replica on a
/// far endpoint beats a copy-only replica on a near one; otherwise the
/// backend's allow-list decides in replica order. The SURL prefers an SRM
/// PFN of the chosen endpoint.
pub fn resolve_replica_default(
    fspec: &FileSpec,
    primary_schemas: &[&str],
    allowed_schemas: &[&str],
) -> Result<ResolvedReplica, PilotError> {
    let replicas = fspec.replicas.as_deref().unwrap_or(&[]);
    let allowed = if allowed_schemas.is_empty() {
        &[""][..]
    } else {
        allowed_schemas
    };

    let pick = |schemas: &[&str]| -> Option<ResolvedReplica> {
        for (ddmendpoint, pfns) in replicas {
            if pfns.is_empty() {
                continue;
            }
            if let Some(pfn) = get_preferred_replica(pfns, schemas) {
                let surl = get_preferred_replica(pfns, &["srm"]).unwrap_or(&pfns[0]);
                return Some(ResolvedReplica {
                    pfn: pfn.clone(),
                    surl: surl.clone(),
                    ddmendpoint: ddmendpoint.clone(),
                });
            }
        }
        None
    };

    if !primary_schemas.is_empty()
        && let Some(resolved) = pick(primary_schemas)
    {
        return Ok(resolved);
    }
    if let Some(resolved) = pick(allowed) {
        return Ok(resolved);
    }

    Err(PilotError::new(ErrorCode::ReplicaNotFound)
        .with_kwarg("lfn", &fspec.lfn)
        .with_detail(format!("allowed_schemas={allowed:?}")))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::{ClientLocation, ReplicaRecord};

    struct FakeCatalog {
        records: Vec<ReplicaRecord>,
    }

    #[async_trait]
    impl ReplicaCatalog for FakeCatalog {
        async fn list_replicas(
            &self,
            _schemes: &[&str],
            _dids: &[Did],
            _location: Option<&ClientLocation>,
        ) -> Result<Vec<ReplicaRecord>, PilotError> {
            Ok(self.records.clone())
        }
    }

    fn site_info() -> InfoService {
        serde_json::from_value(serde_json::json!({
            "queuedata": {
                "astorages": {"read_lan": ["SITE_DATADISK"]}
            },
            "storages": {
                "SITE_DATADISK": {"type": "DATADISK", "is_deterministic": true},
                "FAR_DATADISK": {"type": "DATADISK", "is_deterministic": true}
            }
        }))
        .unwrap()
    }

    fn record(rses: BTreeMap<String, Vec<String>>) -> ReplicaRecord {
        ReplicaRecord {
            scope: "mc16".into(),
            name: "a.root".into(),
            bytes: 1024,
            adler32: Some("deadbeef".into()),
            md5: None,
            rses,
        }
    }

    fn input_file() -> FileSpec {
        let mut fspec = FileSpec::new("mc16", "a.root");
        fspec.ddmendpoint = "SITE_DATADISK".into();
        fspec.inputddms = vec!["SITE_DATADISK".into()];
        fspec
    }

    #[test]
    fn preferred_replica_follows_schema_order() {
        let pfns = vec![
            "gsiftp://host/a".to_string(),
            "root://host/a".to_string(),
            "srm://host/a".to_string(),
        ];
        assert_eq!(
            get_preferred_replica(&pfns, &["srm", "root"]).unwrap(),
            "srm://host/a"
        );
        assert_eq!(
            get_preferred_replica(&pfns, &["root", "srm"]).unwrap(),
            "root://host/a"
        );
        // empty schema matches anything, in pfn order
        assert_eq!(get_preferred_replica(&pfns, &[""]).unwrap(), "gsiftp://host/a");
        assert_eq!(get_preferred_replica(&pfns, &["davs"]), None);
        assert_eq!(get_preferred_replica(&[], &[""]), None);
    }

    #[tokio::test]
    async fn single_local_replica_is_resolved() {
        let catalog = FakeCatalog {
            records: vec![record(BTreeMap::from([(
                "SITE_DATADISK".to_string(),
                vec!["root://host/a.root".to_string()],
            )]))],
        };
        let mut files = vec![input_file()];

        resolve_replicas(&mut files, &catalog, &site_info()).await.unwrap();

        assert_eq!(
            files[0].replicas.as_ref().unwrap(),
            &vec![("SITE_DATADISK".to_string(), vec!["root://host/a.root".to_string()])]
        );
        assert_eq!(files[0].filesize, 1024);
        assert_eq!(files[0].checksum.get("adler32").unwrap(), "deadbeef");
    }

    #[tokio::test]
    async fn resolution_is_idempotent() {
        let catalog = FakeCatalog {
            records: vec![record(BTreeMap::from([(
                "SITE_DATADISK".to_string(),
                vec!["root://host/a.root".to_string()],
            )]))],
        };
        let mut files = vec![input_file()];

        resolve_replicas(&mut files, &catalog, &site_info()).await.unwrap();
        let first = files[0].clone();
        resolve_replicas(&mut files, &catalog, &site_info()).await.unwrap();

        assert_eq!(files[0].replicas, first.replicas);
        assert_eq!(files[0].filesize, first.filesize);
        assert_eq!(files[0].checksum, first.checksum);
    }

    #[tokio::test]
    async fn direct_access_falls_back_to_remote_root_replica() {
        // local endpoint only has srm, remote has a root replica
        let catalog = FakeCatalog {
            records: vec![record(BTreeMap::from([
                (
                    "SITE_DATADISK".to_string(),
                    vec!["srm://host/a.root".to_string()],
                ),
                (
                    "FAR_DATADISK".to_string(),
                    vec!["root://far/a.root".to_string()],
                ),
            ]))],
        };
        let mut files = vec![input_file()];
        files[0].accessmode = AccessMode::Direct;
        files[0].allowremoteinputs = true;

        resolve_replicas(&mut files, &catalog, &site_info()).await.unwrap();

        let replicas = files[0].replicas.as_ref().unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(replicas[0].0, "SITE_DATADISK");
        assert_eq!(replicas[1].0, "FAR_DATADISK");
    }

    #[tokio::test]
    async fn remote_endpoints_without_allowed_schema_are_skipped() {
        let catalog = FakeCatalog {
            records: vec![record(BTreeMap::from([(
                "FAR_DATADISK".to_string(),
                vec!["gsiftp://far/a.root".to_string()],
            )]))],
        };
        let mut files = vec![input_file()];
        files[0].accessmode = AccessMode::Direct;
        files[0].allowremoteinputs = true;

        resolve_replicas(&mut files, &catalog, &site_info()).await.unwrap();
        // direct access only allows root from remote sites
        assert!(files[0].replicas.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_endpoint_is_a_configuration_error() {
        let catalog = FakeCatalog { records: vec![] };
        let mut files = vec![input_file()];
        files[0].ddmendpoint = "NOWHERE".into();

        let err = resolve_replicas(&mut files, &catalog, &site_info()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueDataNotOk);
    }

    #[test]
    fn default_resolution_prefers_primary_then_allowed() {
        let mut fspec = input_file();
        fspec.replicas = Some(vec![(
            "SITE_DATADISK".to_string(),
            vec!["srm://host/a.root".to_string(), "root://host/a.root".to_string()],
        )]);

        let resolved =
            resolve_replica_default(&fspec, DIRECT_LOCALINPUT_ALLOWED_SCHEMAS, &["srm", "root"])
                .unwrap();
        assert_eq!(resolved.pfn, "root://host/a.root");
        assert_eq!(resolved.surl, "srm://host/a.root");
        assert_eq!(resolved.ddmendpoint, "SITE_DATADISK");

        let resolved = resolve_replica_default(&fspec, &[], &["srm", "root"]).unwrap();
        assert_eq!(resolved.pfn, "srm://host/a.root");
    }

    #[test]
    fn missing_replica_is_reported() {
        let fspec = input_file();
        let err = resolve_replica_default(&fspec, &[], &["root"]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReplicaNotFound);
    }
}
