//! Objectstore copytool.
//!
//! Serves `OS_ES` / `OS_LOGS` endpoints and other object stores reached
//! through s3-style URLs. The interesting part is the SURL layout override:
//! deterministic endpoints use the standard scope-hash path, event-service
//! and log stores key objects by panda queue and dataset, with `#{pandaid}`
//! substituted from the environment.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::filespec::{FileSpec, ProtocolSpec};

use crate::copytool::{Copytool, TransferContext};
use crate::copytools::http::{download_url, upload_url};
use crate::paths::{deterministic_path, join_path, transfer_timeout};

pub struct ObjectstoreCopytool;

fn os_surl(
    fspec: &FileSpec,
    protocol: &ProtocolSpec,
    ctx: &TransferContext,
) -> Result<String, PilotError> {
    let ddm = ctx.info.storage(&fspec.ddmendpoint).ok_or_else(|| {
        PilotError::new(ErrorCode::QueueDataNotOk)
            .with_detail(format!("unknown ddmendpoint {}", fspec.ddmendpoint))
    })?;

    if ddm.is_deterministic {
        return Ok(format!(
            "{}{}",
            protocol.endpoint,
            join_path(&protocol.path, &deterministic_path(&fspec.scope, &fspec.lfn))
        ));
    }

    if ddm.is_objectstore() {
        let mut dataset = fspec.dataset.clone();
        if dataset.contains("#{pandaid}") {
            let pandaid = std::env::var("PANDAID").unwrap_or_default();
            dataset = dataset.replace("#{pandaid}", &pandaid);
        }
        let remote = join_path(&join_path(&protocol.path, &ctx.pandaqueue), &dataset);
        return Ok(format!("{}{remote}", protocol.endpoint));
    }

    Err(PilotError::new(ErrorCode::NoStorageProtocol)
        .with_kwarg("lfn", &fspec.lfn)
        .with_detail(format!(
            "cannot construct SURL for non-deterministic endpoint {}",
            fspec.ddmendpoint
        )))
}

#[async_trait]
impl Copytool for ObjectstoreCopytool {
    fn name(&self) -> &'static str {
        "objectstore"
    }

    fn allowed_schemas(&self) -> &'static [&'static str] {
        &["s3", "https", "davs", "srm", "gsiftp", "root"]
    }

    fn resolve_surl(
        &self,
        fspec: &FileSpec,
        protocol: &ProtocolSpec,
        ctx: &TransferContext,
    ) -> Option<Result<String, PilotError>> {
        let result = os_surl(fspec, protocol, ctx);
        if let Ok(surl) = &result {
            debug!("objectstore surl for {}: {surl}", fspec.lfn);
        }
        Some(result)
    }

    async fn copy_in(
        &self,
        files: &mut [FileSpec],
        ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        for fspec in files.iter_mut() {
            let url = if fspec.turl.is_empty() {
                fspec.surl.clone()
            } else {
                fspec.turl.clone()
            };
            let dest = fspec
                .workdir
                .clone()
                .unwrap_or_else(|| ctx.workdir.clone())
                .join(&fspec.lfn);
            info!("downloading objectstore url {url} to {}", dest.display());

            match download_url(&ctx.http, &url, &dest, transfer_timeout(fspec.filesize)).await {
                Ok(_) => fspec.set_transferred(),
                Err(err) => {
                    fspec.set_failed(err.code());
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn copy_out(
        &self,
        files: &mut [FileSpec],
        ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        let extend = std::env::var("PANDA_PILOT_COPY_OUT_EXTEND").is_ok();

        for fspec in files.iter_mut() {
            let src = Path::new(&fspec.surl);
            if !src.is_file() {
                let path_display = src.display().to_string();
                fspec.set_failed(ErrorCode::MissingOutputFile);
                return Err(PilotError::new(ErrorCode::MissingOutputFile)
                    .with_kwarg("path", path_display));
            }
            // objects land under the surl keyed by lfn
            let url = join_path(&fspec.turl, &fspec.lfn);
            info!("uploading {} to objectstore url {url}", src.display());

            match upload_url(&ctx.http, src, &url, transfer_timeout(fspec.filesize)).await {
                Ok(()) => fspec.set_transferred(),
                Err(err) => {
                    fspec.set_failed(err.code());
                    return Err(err);
                }
            }

            if extend && fspec.lfn.ends_with("log.tgz") {
                self.upload_auxiliary_logs(fspec, ctx).await;
            }
        }
        Ok(())
    }
}

impl ObjectstoreCopytool {
    /// Extended stage-out ships the raw payload logs next to the log
    /// tarball; failures here are not fatal for the transfer.
    async fn upload_auxiliary_logs(&self, fspec: &FileSpec, ctx: &TransferContext) {
        for name in ["payload.stdout", "payload.stderr", "pilotlog.txt"] {
            let path = ctx.workdir.join(name);
            if !path.is_file() {
                continue;
            }
            let url = join_path(&fspec.turl, name);
            info!("uploading auxiliary log {} to {url}", path.display());
            if let Err(err) = upload_url(&ctx.http, &path, &url, transfer_timeout(0)).await {
                tracing::warn!("auxiliary log upload failed for {name}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gridpilot_core::infosys::InfoService;

    use super::*;

    fn ctx() -> TransferContext {
        let info: InfoService = serde_json::from_value(serde_json::json!({
            "queuedata": {"name": "SITE_QUEUE"},
            "storages": {
                "SITE_ES": {"type": "OS_ES", "is_deterministic": false},
                "SITE_DATADISK": {"type": "DATADISK", "is_deterministic": true}
            }
        }))
        .unwrap();
        TransferContext {
            info: Arc::new(info),
            http: reqwest::Client::new(),
            workdir: std::path::PathBuf::from("."),
            activity: "es_events".into(),
            pandaqueue: "SITE_QUEUE".into(),
        }
    }

    #[test]
    fn event_service_surl_is_keyed_by_queue_and_dataset() {
        let mut fspec = FileSpec::new("transient", "EventService_premerge_1.tar");
        fspec.ddmendpoint = "SITE_ES".into();
        fspec.dataset = "es_dataset_#{pandaid}".into();

        let protocol = ProtocolSpec {
            endpoint: "s3://s3.cern.ch:443/".into(),
            path: "/atlas-eventservice".into(),
            id: Some(175),
            ..ProtocolSpec::default()
        };

        // SAFETY: test-local env mutation, no concurrent env readers here.
        unsafe { std::env::set_var("PANDAID", "12345") };
        let surl = os_surl(&fspec, &protocol, &ctx()).unwrap();
        assert_eq!(
            surl,
            "s3://s3.cern.ch:443//atlas-eventservice/SITE_QUEUE/es_dataset_12345"
        );
    }

    #[test]
    fn deterministic_endpoint_uses_the_scope_hash_layout() {
        let mut fspec = FileSpec::new("mc16", "a.root");
        fspec.ddmendpoint = "SITE_DATADISK".into();

        let protocol = ProtocolSpec {
            endpoint: "s3://s3.cern.ch:443/".into(),
            path: "/bucket/".into(),
            ..ProtocolSpec::default()
        };

        let surl = os_surl(&fspec, &protocol, &ctx()).unwrap();
        assert!(surl.starts_with("s3://s3.cern.ch:443//bucket/mc16/"));
        assert!(surl.ends_with("/a.root"));
    }

    #[test]
    fn unknown_endpoint_is_a_configuration_error() {
        let mut fspec = FileSpec::new("mc16", "a.root");
        fspec.ddmendpoint = "NOWHERE".into();
        let err = os_surl(&fspec, &ProtocolSpec::default(), &ctx()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueDataNotOk);
    }
}
