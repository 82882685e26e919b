//! The job stage: acquire work from the server, validate it, and publish
//! terminal job states back.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::heartbeat::HeartbeatName;
use gridpilot_core::job::{Job, JobDescription, JobState};

use crate::communicator::JobRequest;
use crate::context::PilotContext;
use crate::queues::{QUEUE_POLL, Queues};

/// How long the stage waits for in-flight jobs to retire after a stop.
const WIND_DOWN_GRACE: Duration = Duration::from_secs(60);

pub async fn control(queues: Arc<Queues>, ctx: Arc<PilotContext>) -> Result<(), PilotError> {
    info!("job stage starting");
    let mut jobs_in_flight: usize = 0;
    let mut wind_down_started: Option<std::time::Instant> = None;

    loop {
        let published = publish_terminal(&queues, &ctx).await;
        jobs_in_flight = jobs_in_flight.saturating_sub(published);

        while let Some(job) = queues.jobs.try_get() {
            let checked = if ctx.graceful_stop.is_set() {
                Err(PilotError::new(ErrorCode::SetupFailure)
                    .with_detail("pilot is shutting down"))
            } else {
                validate_job(&job)
            };
            match checked {
                Ok(()) => {
                    info!("job {} validated", job.pandaid);
                    queues.data_in.put(job).await;
                }
                Err(err) => {
                    warn!("job {} failed validation: {err}", job.pandaid);
                    let mut job = job;
                    job.set_failed(&err);
                    queues.failed_jobs.put(job).await;
                }
            }
        }

        if ctx.graceful_stop.is_set() {
            if jobs_in_flight == 0 {
                break;
            }
            let started = wind_down_started.get_or_insert_with(std::time::Instant::now);
            if started.elapsed() > WIND_DOWN_GRACE {
                warn!("abandoning {jobs_in_flight} in-flight job(s) after the wind-down grace");
                break;
            }
            tokio::time::sleep(QUEUE_POLL).await;
            continue;
        }

        if jobs_in_flight == 0 {
            match acquire_job(&ctx).await {
                Some(job) => {
                    jobs_in_flight += 1;
                    queues.jobs.put(job).await;
                }
                None => {
                    cancellable_sleep(
                        Duration::from_secs(ctx.config.job_fetch_backoff),
                        &ctx,
                    )
                    .await;
                }
            }
        } else {
            tokio::time::sleep(QUEUE_POLL).await;
        }
    }

    info!("job stage has finished");
    Ok(())
}

/// Sleep that wakes early when a stop is requested.
async fn cancellable_sleep(total: Duration, ctx: &PilotContext) {
    let mut remaining = total;
    while !remaining.is_zero() {
        if ctx.graceful_stop.is_set() {
            return;
        }
        let step = remaining.min(QUEUE_POLL);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

/// Ask the server for one job and turn the description into a [`Job`].
async fn acquire_job(ctx: &PilotContext) -> Option<Job> {
    let request = JobRequest {
        site: ctx.config.pandaqueue.clone(),
        queue: ctx.config.pandaqueue.clone(),
        job_label: "managed".to_string(),
        num_jobs: 1,
    };

    let response = ctx.communicator.get_jobs(&request).await;
    if response.is_no_work() {
        info!("no jobs available, idling");
        return None;
    }
    if !response.is_ok() {
        if let Some(err) = &response.exception {
            warn!("job acquisition failed: {err}");
        }
        return None;
    }

    let descriptions = match response.content {
        Some(Value::Array(descriptions)) => descriptions,
        _ => return None,
    };
    let description: JobDescription = match serde_json::from_value(descriptions.into_iter().next()?)
    {
        Ok(description) => description,
        Err(err) => {
            warn!("unusable job description: {err}");
            return None;
        }
    };

    let workdir = ctx.config.workdir.join(format!(
        "PanDA_Pilot_{}_{}",
        description.panda_id,
        chrono::Utc::now().timestamp()
    ));
    if let Err(err) = std::fs::create_dir_all(&workdir) {
        warn!(
            "{}",
            PilotError::new(ErrorCode::Mkdir).with_kwarg("path", workdir.display().to_string())
        );
        warn!("cannot accept job {}: {err}", description.panda_id);
        return None;
    }

    // the objectstore SURL layout and payload wrappers read these
    // SAFETY: single-threaded with respect to env writers; set per job.
    unsafe {
        std::env::set_var("PANDAID", description.panda_id.to_string());
        std::env::set_var("PanDA_TaskID", description.task_id.to_string());
    }

    let job = Job::from_description(description, workdir);
    info!("acquired job {} (eventservice={})", job.pandaid, job.is_eventservice);
    Some(job)
}

fn validate_job(job: &Job) -> Result<(), PilotError> {
    if job.payload.trim().is_empty() {
        return Err(PilotError::new(ErrorCode::SetupFailure)
            .with_detail(format!("job {} has no payload command", job.pandaid)));
    }
    if !job.workdir.is_dir() {
        return Err(PilotError::new(ErrorCode::Mkdir)
            .with_kwarg("path", job.workdir.display().to_string()));
    }
    if let Ok(sw_base) = std::env::var("ATLAS_SW_BASE")
        && !sw_base.is_empty()
        && !std::path::Path::new(&sw_base).is_dir()
    {
        return Err(PilotError::new(ErrorCode::NoSoftwareDir).with_kwarg("path", sw_base));
    }
    Ok(())
}

/// Drain the stage-completion queues, decide the final states, report them
/// to the server, and hand the jobs over to the completed queues. Returns
/// the number of jobs retired.
async fn publish_terminal(queues: &Queues, ctx: &PilotContext) -> usize {
    let mut terminal: Vec<Job> = Vec::new();
    loop {
        let job = queues
            .finished_data_out
            .try_get()
            .or_else(|| queues.failed_data_in.try_get())
            .or_else(|| queues.failed_data_out.try_get())
            .or_else(|| queues.failed_jobs.try_get());
        let Some(mut job) = job else { break };

        let success = job.piloterrorcode == 0 && job.exitcode.unwrap_or(0) == 0;
        job.state = if success {
            JobState::Finished
        } else {
            JobState::Failed
        };
        info!(
            "publishing terminal state for job {}: {:?} (exit={:?}, piloterror={})",
            job.pandaid, job.state, job.exitcode, job.piloterrorcode
        );
        terminal.push(job);
    }

    if terminal.is_empty() {
        return 0;
    }

    let reports: Vec<serde_json::Value> = terminal.iter().map(Job::state_report).collect();
    let response = if reports.len() > 1 {
        ctx.communicator.update_jobs_bulk(&reports).await
    } else {
        ctx.communicator.update_jobs(&reports).await
    };
    if response.is_ok() {
        ctx.heartbeat.touch(HeartbeatName::Server);
    } else if let Some(err) = &response.exception {
        warn!("failed to publish terminal job states: {err}");
    }

    let retired = terminal.len();
    for job in terminal {
        let pandaid = job.pandaid;
        if job.state == JobState::Finished {
            queues.finished_jobs.put(job.clone()).await;
        }
        queues.completed_jobs.put(job).await;
        queues.completed_jobids.put(pandaid).await;
    }
    retired
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn empty_payload_fails_validation() {
        let job = Job {
            pandaid: 7,
            payload: "  ".into(),
            workdir: PathBuf::from("/tmp"),
            ..Job::default()
        };
        let err = validate_job(&job).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SetupFailure);
    }

    #[test]
    fn missing_workdir_fails_validation() {
        let job = Job {
            pandaid: 7,
            payload: "true".into(),
            workdir: PathBuf::from("/definitely/not/here"),
            ..Job::default()
        };
        let err = validate_job(&job).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Mkdir);
    }

    #[test]
    fn valid_job_passes() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job {
            pandaid: 7,
            payload: "true".into(),
            workdir: dir.path().to_path_buf(),
            ..Job::default()
        };
        assert!(validate_job(&job).is_ok());
    }
}
