//! The copytool contract and the process-wide backend registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use gridpilot_core::error::PilotError;
use gridpilot_core::filespec::{FileSpec, ProtocolSpec};
use gridpilot_core::infosys::InfoService;

use crate::resolver::ResolvedReplica;

/// Everything a backend may need to carry out a transfer.
#[derive(Clone)]
pub struct TransferContext {
    pub info: Arc<InfoService>,
    pub http: reqwest::Client,
    /// Destination directory for stage-in, source directory for stage-out.
    pub workdir: PathBuf,
    /// The transfer activity the engine resolved.
    pub activity: String,
    /// Name of the panda queue (objectstore SURL layout).
    pub pandaqueue: String,
}

/// A transfer backend.
///
/// Backends mutate each file's `status`, `status_code` and `turl`. A missing
/// output file must be reported with a `MissingOutputFile` taxonomy error:
/// the engine treats that as fatal and will not try further backends. Any
/// other error is recoverable and lets the cascade continue.
#[async_trait]
pub trait Copytool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether replicas must be resolved before `copy_in`.
    fn require_replicas(&self) -> bool {
        false
    }

    /// Whether protocols must be resolved before `copy_out`.
    fn require_protocols(&self) -> bool {
        true
    }

    /// URL schemas the backend speaks, most preferred first.
    fn allowed_schemas(&self) -> &'static [&'static str];

    fn is_valid_for_copy_in(&self, _files: &[FileSpec]) -> bool {
        true
    }

    fn is_valid_for_copy_out(&self, _files: &[FileSpec]) -> bool {
        true
    }

    async fn copy_in(&self, files: &mut [FileSpec], ctx: &TransferContext)
    -> Result<(), PilotError>;

    async fn copy_out(&self, files: &mut [FileSpec], ctx: &TransferContext)
    -> Result<(), PilotError>;

    /// Backend-specific replica selection; `None` falls back to the engine
    /// default.
    fn resolve_replica(
        &self,
        _fspec: &FileSpec,
        _primary_schemas: &[&str],
        _allowed_schemas: &[&str],
    ) -> Option<Result<ResolvedReplica, PilotError>> {
        None
    }

    /// Backend-specific SURL construction; `None` falls back to the engine
    /// default (deterministic path).
    fn resolve_surl(
        &self,
        _fspec: &FileSpec,
        _protocol: &ProtocolSpec,
        _ctx: &TransferContext,
    ) -> Option<Result<String, PilotError>> {
        None
    }
}

/// Immutable name-to-backend map, loaded once at startup.
pub struct CopytoolRegistry {
    tools: HashMap<String, Arc<dyn Copytool>>,
}

impl CopytoolRegistry {
    /// Registry with the built-in backends.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.insert(Arc::new(crate::copytools::mv::MvCopytool));
        registry.insert(Arc::new(crate::copytools::http::HttpCopytool));
        registry.insert(Arc::new(crate::copytools::objectstore::ObjectstoreCopytool));
        registry
    }

    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn insert(&mut self, tool: Arc<dyn Copytool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Copytool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_knows_its_backends() {
        let registry = CopytoolRegistry::builtin();
        assert!(registry.get("mv").is_some());
        assert!(registry.get("http").is_some());
        assert!(registry.get("objectstore").is_some());
        assert!(registry.get("rucio").is_none());
    }
}
