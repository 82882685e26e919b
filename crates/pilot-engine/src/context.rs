//! Shared pilot state: configuration, collaborators, and the cooperative
//! cancellation flags every stage polls.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use gridpilot_core::config::PilotConfig;
use gridpilot_core::heartbeat::HeartbeatStore;
use gridpilot_core::infosys::InfoService;
use gridpilot_data::catalog::HttpReplicaCatalog;
use gridpilot_data::copytool::CopytoolRegistry;
use gridpilot_data::staging::StagingEngine;

use crate::communicator::Communicator;

/// A sticky boolean observed cooperatively at every polling site.
#[derive(Debug, Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the stages share, created once at startup and passed by
/// reference. Read-only apart from the flags and signal bookkeeping.
pub struct PilotContext {
    pub config: PilotConfig,
    pub info: Arc<InfoService>,
    pub communicator: Arc<Communicator>,
    pub staging: Arc<StagingEngine>,
    pub heartbeat: Arc<HeartbeatStore>,

    /// Finish in-flight work, then exit.
    pub graceful_stop: Flag,
    /// Surrender the current job, keep the process.
    pub abort_job: Flag,
    /// Set once the aborted job has been surrendered.
    pub job_aborted: Flag,

    /// Name of the first fatal signal received.
    pub signal: Mutex<Option<String>>,
    /// Epoch seconds of the first kill signal; 0 before any.
    pub kill_time: AtomicI64,
}

impl PilotContext {
    /// Wire up the default collaborators for `config` + `info`.
    pub fn new(config: PilotConfig, info: InfoService) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        let info = Arc::new(info);

        let communicator = Arc::new(Communicator::new(http.clone(), config.server_url.clone()));
        let catalog = Arc::new(HttpReplicaCatalog::new(http.clone(), config.catalog_url.clone()));
        let staging = Arc::new(StagingEngine::new(
            Arc::new(CopytoolRegistry::builtin()),
            catalog,
            info.clone(),
            http,
        ));
        let heartbeat = Arc::new(HeartbeatStore::new(config.heartbeat_file.clone()));

        Arc::new(Self {
            config,
            info,
            communicator,
            staging,
            heartbeat,
            graceful_stop: Flag::new(),
            abort_job: Flag::new(),
            job_aborted: Flag::new(),
            signal: Mutex::new(None),
            kill_time: AtomicI64::new(0),
        })
    }
}
