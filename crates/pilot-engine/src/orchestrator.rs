//! The workflow orchestrator: create the queue bundle, start the three
//! pipeline stages as supervised workers, pump their failures, and wind
//! everything down on signals.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use gridpilot_core::error::PilotError;

use crate::context::PilotContext;
use crate::queues::Queues;
use crate::signals;
use crate::stages;

const SUPERVISION_POLL: Duration = Duration::from_millis(100);

type Worker = (&'static str, Option<JoinHandle<Result<(), PilotError>>>);

/// Run the pilot until every stage has finished.
///
/// A worker's join result is its exception bucket: failures are logged at
/// warning level and recorded, and the rendezvous still completes.
pub async fn run(ctx: Arc<PilotContext>) -> Result<(), PilotError> {
    info!("setting up signal handling");
    signals::install(ctx.clone());

    info!("setting up queues and starting stage workers");
    let queues = Arc::new(Queues::default());
    let mut workers: Vec<Worker> = vec![
        (
            "job",
            Some(tokio::spawn(stages::job::control(queues.clone(), ctx.clone()))),
        ),
        (
            "data",
            Some(tokio::spawn(stages::data::control(queues.clone(), ctx.clone()))),
        ),
        (
            "monitor",
            Some(tokio::spawn(stages::monitor::control(
                queues.clone(),
                ctx.clone(),
            ))),
        ),
    ];

    let mut finished_jobs: u64 = 0;
    let mut completed_jobs: u64 = 0;
    let mut first_error: Option<PilotError> = None;

    loop {
        // bookkeeping queues converge here
        while queues.finished_jobs.try_get().is_some() {
            finished_jobs += 1;
        }
        while queues.finished_data_in.try_get().is_some() {}
        while queues.completed_jobs.try_get().is_some() {
            completed_jobs += 1;
        }
        while let Some(pandaid) = queues.completed_jobids.try_get() {
            info!("job {pandaid} completed");
        }

        for (name, slot) in workers.iter_mut() {
            let done = slot.as_ref().is_some_and(JoinHandle::is_finished);
            if !done {
                continue;
            }
            let Some(handle) = slot.take() else { continue };
            match handle.await {
                Ok(Ok(())) => info!("{name} worker has finished"),
                Ok(Err(err)) => {
                    warn!("received exception from {name} worker: {err}");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join) => warn!("{name} worker join failed: {join}"),
            }
        }

        if workers.iter().all(|(_, slot)| slot.is_none()) {
            break;
        }
        tokio::time::sleep(SUPERVISION_POLL).await;
    }

    info!(
        "all pilot workers have been joined: jobs completed={completed_jobs}, successful={finished_jobs}"
    );
    if let Some(signal) = ctx.signal.lock().unwrap_or_else(|e| e.into_inner()).as_deref() {
        info!("pilot was interrupted by {signal}");
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use gridpilot_core::config::PilotConfig;
    use gridpilot_core::infosys::InfoService;

    use super::*;

    #[tokio::test]
    async fn orchestrator_exits_once_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let config = PilotConfig {
            workdir: dir.path().to_path_buf(),
            heartbeat_file: dir.path().join("heartbeat.json"),
            server_url: "http://127.0.0.1:9".into(),
            job_fetch_backoff: 1,
            ..PilotConfig::default()
        };
        let ctx = PilotContext::new(config, InfoService::default());

        ctx.graceful_stop.set();
        let result = tokio::time::timeout(Duration::from_secs(30), run(ctx)).await;
        assert!(result.expect("orchestrator must exit after graceful_stop").is_ok());
    }
}
