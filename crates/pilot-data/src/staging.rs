//! The staging engine: pick transfer backends by activity, resolve replicas
//! or protocols as each backend requires, and walk the backend cascade until
//! one succeeds.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use gridpilot_core::checksum::adler32_file;
use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::filespec::{AccessMode, FileSpec, ProtocolSpec, matches_any_schema};
use gridpilot_core::infosys::{InfoService, ddm_activity};
use gridpilot_core::job::Job;

use crate::catalog::ReplicaCatalog;
use crate::copytool::{Copytool, CopytoolRegistry, TransferContext};
use crate::paths::{deterministic_path, join_path};
use crate::resolver::{
    DIRECT_LOCALINPUT_ALLOWED_SCHEMAS, resolve_replica_default, resolve_replicas,
};

/// Backends used when the queue configuration names none.
const DEFAULT_COPYTOOLS: &[&str] = &["mv"];

/// Stage-in / stage-out orchestration for one pilot.
pub struct StagingEngine {
    registry: Arc<CopytoolRegistry>,
    catalog: Arc<dyn ReplicaCatalog>,
    info: Arc<InfoService>,
    http: reqwest::Client,
    acopytools: BTreeMap<String, Vec<String>>,
}

impl StagingEngine {
    pub fn new(
        registry: Arc<CopytoolRegistry>,
        catalog: Arc<dyn ReplicaCatalog>,
        info: Arc<InfoService>,
        http: reqwest::Client,
    ) -> Self {
        let queuedata = &info.queuedata;
        let mut acopytools = queuedata.acopytools.clone();
        if acopytools.is_empty() && !queuedata.copytools.is_empty() {
            acopytools.insert(
                "default".to_string(),
                queuedata.copytools.keys().cloned().collect(),
            );
        }
        if acopytools.get("default").is_none_or(Vec::is_empty) {
            acopytools.insert(
                "default".to_string(),
                DEFAULT_COPYTOOLS.iter().map(|s| s.to_string()).collect(),
            );
        }
        info!("configured copytools per activity: {acopytools:?}");

        Self {
            registry,
            catalog,
            info,
            http,
            acopytools,
        }
    }

    /// Stage input files in for `activity` (a priority list of labels).
    ///
    /// Files eligible for direct access are never copied; they end up with
    /// `status = remote_io` and a direct-readable `turl`.
    pub async fn stage_in(
        &self,
        files: &mut [FileSpec],
        activity: &[&str],
        workdir: &Path,
        job: Option<&Job>,
    ) -> Result<(), PilotError> {
        let activities = with_default(activity);
        self.apply_direct_access_policy(files, job);
        let (aname, copytools) = self.select_copytools(&activities)?;
        let ctx = self.transfer_context(workdir, &aname);

        let mut errors: Vec<PilotError> = Vec::new();
        for name in &copytools {
            let Some(tool) = self.registry.get(name) else {
                warn!("copytool {name} is not registered, skipped");
                errors.push(
                    PilotError::new(ErrorCode::MiddlewareImportFailure).with_kwarg("name", name),
                );
                continue;
            };

            info!("trying copytool={name} for stage-in, activity={aname}");
            match self.try_copy_in(tool.as_ref(), files, &ctx).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_recoverable() => {
                    warn!("stage-in with copytool={name} failed: {err}");
                    errors.push(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(errors.pop().unwrap_or_else(|| {
            PilotError::new(ErrorCode::StageInFailed)
                .with_kwarg("reason", format!("no usable copytool among {copytools:?}"))
        }))
    }

    /// Stage output files out for `activity`.
    pub async fn stage_out(
        &self,
        files: &mut [FileSpec],
        activity: &[&str],
        workdir: &Path,
    ) -> Result<(), PilotError> {
        let activities = with_default(activity);
        self.prepare_outputs(files, workdir, &activities)?;
        let (aname, copytools) = self.select_copytools(&activities)?;
        let ctx = self.transfer_context(workdir, &aname);

        let mut errors: Vec<PilotError> = Vec::new();
        for name in &copytools {
            let Some(tool) = self.registry.get(name) else {
                warn!("copytool {name} is not registered, skipped");
                errors.push(
                    PilotError::new(ErrorCode::MiddlewareImportFailure).with_kwarg("name", name),
                );
                continue;
            };

            info!("trying copytool={name} for stage-out, activity={aname}");
            match self.try_copy_out(tool.as_ref(), files, &activities, &ctx).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_recoverable() => {
                    warn!("stage-out with copytool={name} failed: {err}");
                    errors.push(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(errors.pop().unwrap_or_else(|| {
            PilotError::new(ErrorCode::StageOutFailed)
                .with_kwarg("reason", format!("no usable copytool among {copytools:?}"))
        }))
    }

    fn transfer_context(&self, workdir: &Path, activity: &str) -> TransferContext {
        TransferContext {
            info: self.info.clone(),
            http: self.http.clone(),
            workdir: workdir.to_path_buf(),
            activity: activity.to_string(),
            pandaqueue: self.info.queuedata.name.clone(),
        }
    }

    /// First activity with a non-empty backend list wins.
    fn select_copytools(&self, activities: &[String]) -> Result<(String, Vec<String>), PilotError> {
        for aname in activities {
            if let Some(tools) = self.acopytools.get(aname)
                && !tools.is_empty()
            {
                return Ok((aname.clone(), tools.clone()));
            }
        }
        Err(PilotError::new(ErrorCode::QueueDataNotOk).with_detail(format!(
            "no copytool for activities={activities:?}, acopytools={:?}",
            self.acopytools
        )))
    }

    /// Decide per file whether the payload may read it directly from
    /// storage, and put direct-access candidates first so they do not count
    /// against the local disk budget.
    fn apply_direct_access_policy(&self, files: &mut [FileSpec], job: Option<&Job>) {
        let queuedata = &self.info.queuedata;
        let mut allow = queuedata.direct_access_lan || queuedata.direct_access_wan;
        let wan = queuedata.direct_access_wan;

        if let Some(job) = job
            && !job.is_analysis
            && job.transfertype != "direct"
        {
            // task forbids direct access for this production job
            allow = false;
        }
        info!("direct access settings for the queue: allow={allow}, wan={wan}");

        for fspec in files.iter_mut() {
            let eligible = allow && direct_access_eligible(fspec);
            if eligible {
                if wan {
                    fspec.allowremoteinputs = true;
                }
                fspec.accessmode = AccessMode::Direct;
            } else if fspec.accessmode == AccessMode::Direct {
                fspec.accessmode = AccessMode::Unset;
            }
        }

        if allow {
            // remote-io candidates first so they are excluded from the local
            // disk budget
            files.sort_by_key(|f| !f.is_directaccess(false, DIRECT_LOCALINPUT_ALLOWED_SCHEMAS));
        }
    }

    async fn try_copy_in(
        &self,
        tool: &dyn Copytool,
        files: &mut [FileSpec],
        ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        if tool.require_replicas() {
            if files.iter().any(|f| f.replicas.is_none()) {
                resolve_replicas(files, self.catalog.as_ref(), &self.info).await?;
            }
            let allowed = tool.allowed_schemas();
            for fspec in files.iter_mut() {
                let primary = if fspec.accessmode == AccessMode::Direct {
                    DIRECT_LOCALINPUT_ALLOWED_SCHEMAS
                } else {
                    &[][..]
                };
                let resolved = match tool.resolve_replica(fspec, primary, allowed) {
                    Some(result) => result?,
                    None => resolve_replica_default(fspec, primary, allowed)?,
                };
                info!(
                    "resolved replica for lfn={}: ddmendpoint={}, pfn={}",
                    fspec.lfn, resolved.ddmendpoint, resolved.pfn
                );
                fspec.turl = resolved.pfn;
                fspec.surl = resolved.surl;
                fspec.ddmendpoint = resolved.ddmendpoint;
            }
        }

        // direct-access candidates are served by remote I/O, not copied
        let mut pending_idx: Vec<usize> = Vec::new();
        for (idx, fspec) in files.iter_mut().enumerate() {
            if fspec.accessmode == AccessMode::Direct
                && matches_any_schema(&fspec.turl, DIRECT_LOCALINPUT_ALLOWED_SCHEMAS)
            {
                info!("lfn={} will be accessed directly: turl={}", fspec.lfn, fspec.turl);
                fspec.set_remote_io();
            } else {
                pending_idx.push(idx);
            }
        }
        if pending_idx.is_empty() {
            return Ok(());
        }

        let mut pending: Vec<FileSpec> =
            pending_idx.iter().map(|&idx| files[idx].clone()).collect();
        if !tool.is_valid_for_copy_in(&pending) {
            return Err(PilotError::new(ErrorCode::StageInFailed)
                .with_kwarg("reason", format!("invalid input for copytool={}", tool.name())));
        }

        let result = tool.copy_in(&mut pending, ctx).await;
        for (&idx, updated) in pending_idx.iter().zip(pending) {
            files[idx] = updated;
        }
        result
    }

    /// Verify outputs exist locally and fill size/checksum before dispatch.
    fn prepare_outputs(
        &self,
        files: &mut [FileSpec],
        workdir: &Path,
        activities: &[String],
    ) -> Result<(), PilotError> {
        for fspec in files.iter_mut() {
            let pfn = if fspec.surl.is_empty() {
                workdir.join(&fspec.lfn)
            } else {
                Path::new(&fspec.surl).to_path_buf()
            };
            let meta = std::fs::metadata(&pfn).map_err(|_| {
                PilotError::new(ErrorCode::MissingOutputFile)
                    .with_kwarg("path", pfn.display().to_string())
            })?;
            if fspec.filesize == 0 {
                fspec.filesize = meta.len();
            }
            fspec.surl = pfn.display().to_string();
            fspec.activity = activities[0].clone();
            if !fspec.checksum.contains_key("adler32") {
                fspec
                    .checksum
                    .insert("adler32".to_string(), adler32_file(&pfn)?);
            }
        }
        Ok(())
    }

    async fn try_copy_out(
        &self,
        tool: &dyn Copytool,
        files: &mut [FileSpec],
        activities: &[String],
        ctx: &TransferContext,
    ) -> Result<(), PilotError> {
        if tool.require_protocols() {
            self.resolve_protocols(files, activities)?;
            for fspec in files.iter_mut() {
                let protocols = resolve_protocol(fspec, tool.allowed_schemas());
                let Some(protocol) = protocols.first() else {
                    return Err(PilotError::new(ErrorCode::NoStorageProtocol)
                        .with_kwarg("lfn", &fspec.lfn)
                        .with_detail(format!("allowed_schemas={:?}", tool.allowed_schemas())));
                };
                let surl = match tool.resolve_surl(fspec, protocol, ctx) {
                    Some(result) => result?,
                    None => self.default_resolve_surl(fspec, protocol)?,
                };
                info!("resolved stage-out turl for lfn={}: {surl}", fspec.lfn);
                fspec.protocol_id = protocol.id;
                fspec.turl = surl;
            }
        }

        if !tool.is_valid_for_copy_out(files) {
            return Err(PilotError::new(ErrorCode::StageOutFailed)
                .with_kwarg("reason", format!("invalid input for copytool={}", tool.name())));
        }

        tool.copy_out(files, ctx).await
    }

    /// Populate `protocols` per file from the endpoint's activity table.
    fn resolve_protocols(
        &self,
        files: &mut [FileSpec],
        activities: &[String],
    ) -> Result<(), PilotError> {
        for fspec in files.iter_mut() {
            let ddm = self.info.storage(&fspec.ddmendpoint).ok_or_else(|| {
                PilotError::new(ErrorCode::QueueDataNotOk).with_detail(format!(
                    "unknown output ddmendpoint {} for lfn={}",
                    fspec.ddmendpoint, fspec.lfn
                ))
            })?;

            let mut protocols: &[ProtocolSpec] = &[];
            for aname in activities {
                if let Some(found) = ddm.arprotocols.get(ddm_activity(aname))
                    && !found.is_empty()
                {
                    protocols = found;
                    break;
                }
            }
            fspec.protocols = protocols.to_vec();
        }
        Ok(())
    }

    /// Deterministic SURL: `endpoint + path + deterministic_path(scope, lfn)`.
    fn default_resolve_surl(
        &self,
        fspec: &FileSpec,
        protocol: &ProtocolSpec,
    ) -> Result<String, PilotError> {
        let ddm = self.info.storage(&fspec.ddmendpoint).ok_or_else(|| {
            PilotError::new(ErrorCode::QueueDataNotOk)
                .with_detail(format!("unknown ddmendpoint {}", fspec.ddmendpoint))
        })?;
        if !ddm.is_deterministic {
            return Err(PilotError::new(ErrorCode::NoStorageProtocol)
                .with_kwarg("lfn", &fspec.lfn)
                .with_detail(format!(
                    "cannot construct SURL for non-deterministic endpoint {}",
                    fspec.ddmendpoint
                )));
        }
        Ok(format!(
            "{}{}",
            protocol.endpoint,
            join_path(&protocol.path, &deterministic_path(&fspec.scope, &fspec.lfn))
        ))
    }
}

fn with_default(activity: &[&str]) -> Vec<String> {
    let mut activities: Vec<String> = activity.iter().map(|s| s.to_string()).collect();
    if !activities.iter().any(|a| a == "default") {
        activities.push("default".to_string());
    }
    activities
}

/// Whether a file may be read directly from storage at all. Log tarballs are
/// always copied; an explicit `copy` access mode wins.
fn direct_access_eligible(fspec: &FileSpec) -> bool {
    fspec.accessmode != AccessMode::Copy && !fspec.lfn.ends_with("log.tgz")
}

/// Protocol entries whose endpoint speaks one of `allowed_schemas`, in
/// schema-preference order; an empty allow-list accepts everything.
fn resolve_protocol(fspec: &FileSpec, allowed_schemas: &[&str]) -> Vec<ProtocolSpec> {
    let allowed = if allowed_schemas.is_empty() {
        &[""][..]
    } else {
        allowed_schemas
    };
    let mut protocols = Vec::new();
    for schema in allowed {
        for pdat in &fspec.protocols {
            if schema.is_empty() || pdat.endpoint.starts_with(&format!("{schema}://")) {
                protocols.push(pdat.clone());
            }
        }
    }
    protocols
}
