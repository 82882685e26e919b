//! The data stage: stage inputs in ahead of the payload and outputs out
//! after it, via two sub-workers sharing the staging engine.

use std::sync::Arc;

use tracing::{info, warn};

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::heartbeat::HeartbeatName;
use gridpilot_core::job::Job;

use crate::context::PilotContext;
use crate::pfc::write_pool_file_catalog;
use crate::queues::{QUEUE_POLL, Queue, Queues};

pub async fn control(queues: Arc<Queues>, ctx: Arc<PilotContext>) -> Result<(), PilotError> {
    info!("data stage starting");

    let stagein = tokio::spawn(copytool_in(queues.clone(), ctx.clone()));
    let stageout = tokio::spawn(copytool_out(queues.clone(), ctx.clone()));

    let mut result = Ok(());
    for (name, handle) in [("copytool_in", stagein), ("copytool_out", stageout)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("{name} sub-worker failed: {err}");
                result = Err(err);
            }
            Err(join) => {
                warn!("{name} sub-worker panicked: {join}");
                result = Err(PilotError::new(ErrorCode::UnknownException)
                    .with_detail(format!("{name} panicked: {join}")));
            }
        }
    }

    info!("data stage has finished");
    result
}

/// Fail queued jobs that will never be processed because the pilot is
/// winding down, so the job stage can still retire them.
async fn surrender_queued(source: &Queue<Job>, sink: &Queue<Job>, code: ErrorCode) {
    while let Some(mut job) = source.try_get() {
        job.set_failed(&PilotError::new(code).with_kwarg("reason", "pilot is shutting down"));
        sink.put(job).await;
    }
}

/// Drain `data_in`, stage inputs, forward to the monitor stage.
async fn copytool_in(queues: Arc<Queues>, ctx: Arc<PilotContext>) -> Result<(), PilotError> {
    loop {
        if ctx.graceful_stop.is_set() {
            surrender_queued(&queues.data_in, &queues.failed_data_in, ErrorCode::StageInFailed)
                .await;
            return Ok(());
        }
        let Some(mut job) = queues.data_in.get(QUEUE_POLL).await else {
            continue;
        };

        ctx.heartbeat.touch(HeartbeatName::Pilot);
        info!("staging in {} input files for job {}", job.indata.len(), job.pandaid);

        let staged = if job.indata.is_empty() {
            Ok(())
        } else {
            let activity = job.indata[0].activity.clone();
            // the engine needs the job for its access policy while mutating
            // the file set, so the files travel separately
            let mut indata = std::mem::take(&mut job.indata);
            let staged = ctx
                .staging
                .stage_in(&mut indata, &[activity.as_str()], &job.workdir, Some(&job))
                .await;
            job.indata = indata;
            staged
        };

        match staged {
            Ok(()) if ctx.graceful_stop.is_set() => {
                // stop arrived mid-transfer; the monitor will not pick this up
                job.set_failed(
                    &PilotError::new(ErrorCode::StageInFailed)
                        .with_kwarg("reason", "pilot is shutting down"),
                );
                queues.failed_data_in.put(job).await;
            }
            Ok(()) => {
                let catalog = job.workdir.join("PoolFileCatalog.xml");
                if let Err(err) = write_pool_file_catalog(&job.indata, &catalog) {
                    warn!("failed to write pool file catalog for job {}: {err}", job.pandaid);
                }
                queues.finished_data_in.put(job.clone()).await;
                queues.validated_jobs.put(job).await;
            }
            Err(err) => {
                warn!("stage-in failed for job {}: {err}", job.pandaid);
                job.set_failed(&err);
                queues.failed_data_in.put(job).await;
            }
        }
    }
}

/// Drain `data_out`, stage outputs, hand the job to terminal publishing.
async fn copytool_out(queues: Arc<Queues>, ctx: Arc<PilotContext>) -> Result<(), PilotError> {
    loop {
        if ctx.graceful_stop.is_set() {
            surrender_queued(&queues.data_out, &queues.failed_data_out, ErrorCode::StageOutFailed)
                .await;
            return Ok(());
        }
        let Some(mut job) = queues.data_out.get(QUEUE_POLL).await else {
            continue;
        };

        ctx.heartbeat.touch(HeartbeatName::Pilot);
        info!("staging out {} output files for job {}", job.outdata.len(), job.pandaid);

        let staged = if job.outdata.is_empty() {
            Ok(())
        } else {
            let activity = job.outdata[0].activity.clone();
            ctx.staging
                .stage_out(&mut job.outdata, &[activity.as_str()], &job.workdir)
                .await
        };

        match staged {
            Ok(()) => {
                queues.finished_data_out.put(job).await;
            }
            Err(err) => {
                warn!("stage-out failed for job {}: {err}", job.pandaid);
                job.set_failed(&err);
                queues.failed_data_out.put(job).await;
            }
        }
    }
}
