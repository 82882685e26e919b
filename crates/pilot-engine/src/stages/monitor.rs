//! The monitor stage: run and supervise the payload of each validated job,
//! watching liveness, suspension and the cancellation flags.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::heartbeat::{HeartbeatName, SUSPENSION_LIMIT_SECS};
use gridpilot_core::job::{Job, JobState};

use crate::context::PilotContext;
use crate::eventservice::EventServiceExecutor;
use crate::queues::{QUEUE_POLL, Queues};

const PAYLOAD_HEARTBEAT: Duration = Duration::from_secs(60);

pub async fn control(queues: Arc<Queues>, ctx: Arc<PilotContext>) -> Result<(), PilotError> {
    info!("monitor stage starting");

    loop {
        if ctx.graceful_stop.is_set() {
            // retire anything still queued for execution
            while let Some(mut job) = queues
                .validated_jobs
                .try_get()
                .or_else(|| queues.monitored_payloads.try_get())
            {
                job.set_failed(
                    &PilotError::new(ErrorCode::PayloadExecutionFailure)
                        .with_kwarg("exit_code", "not started, pilot is shutting down"),
                );
                queues.failed_jobs.put(job).await;
            }
            break;
        }

        if let Some(job) = queues.validated_jobs.get(QUEUE_POLL).await {
            queues.monitored_payloads.put(job).await;
        }

        if let Some(mut job) = queues.monitored_payloads.try_get() {
            execute_payload(&mut job, &ctx).await;
            if ctx.graceful_stop.is_set() {
                // the data stage is winding down too; retire directly
                queues.failed_jobs.put(job).await;
            } else {
                queues.data_out.put(job).await;
            }
        }
    }

    info!("monitor stage has finished");
    Ok(())
}

async fn execute_payload(job: &mut Job, ctx: &PilotContext) {
    ctx.heartbeat.touch(HeartbeatName::Pilot);
    job.state = JobState::Running;
    let response = ctx.communicator.update_jobs(&[job.state_report()]).await;
    if !response.is_ok() {
        warn!("could not report job {} as running", job.pandaid);
    }

    let mut extra_env = crate::credentials::payload_env(ctx, job).await;
    if let Some(dataset) = job.indata.iter().map(|f| &f.dataset).find(|d| !d.is_empty()) {
        extra_env.push(("INDS".to_string(), dataset.clone()));
    }

    if job.is_eventservice {
        let gap = Duration::from_secs(ctx.info.queuedata.es_stageout_gap);
        let executor = EventServiceExecutor::new(
            ctx.communicator.clone(),
            gap,
            ctx.graceful_stop.clone(),
        );
        match executor.run(job, &extra_env).await {
            Ok(exit_code) => {
                job.exitcode = exit_code;
                if exit_code != Some(0) {
                    job.set_failed(
                        &PilotError::new(ErrorCode::PayloadExecutionFailure)
                            .with_kwarg("exit_code", format!("{exit_code:?}")),
                    );
                }
            }
            Err(err) => {
                warn!("event service execution failed for job {}: {err}", job.pandaid);
                job.set_failed(&err);
            }
        }
        return;
    }

    run_plain_payload(job, ctx, &extra_env).await;
}

async fn run_plain_payload(job: &mut Job, ctx: &PilotContext, extra_env: &[(String, String)]) {
    let stdout = match std::fs::File::create(job.workdir.join("payload.stdout")) {
        Ok(f) => f,
        Err(err) => {
            job.set_failed(
                &PilotError::new(ErrorCode::LogFileCreationFailure).with_detail(err.to_string()),
            );
            return;
        }
    };
    let stderr = match std::fs::File::create(job.workdir.join("payload.stderr")) {
        Ok(f) => f,
        Err(err) => {
            job.set_failed(
                &PilotError::new(ErrorCode::LogFileCreationFailure).with_detail(err.to_string()),
            );
            return;
        }
    };

    let mut child = match tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&job.payload)
        .current_dir(&job.workdir)
        .envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!("failed to start payload for job {}: {err}", job.pandaid);
            job.set_failed(&PilotError::new(ErrorCode::SetupFailure).with_detail(err.to_string()));
            return;
        }
    };
    info!("payload started for job {}: pid={:?}", job.pandaid, child.id());

    let mut heartbeat_tick = tokio::time::interval(PAYLOAD_HEARTBEAT);
    heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut poll_tick = tokio::time::interval(QUEUE_POLL);
    poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let exit_code: Option<i32> = loop {
        if ctx.graceful_stop.is_set() || ctx.abort_job.is_set() {
            warn!("killing payload of job {} on request", job.pandaid);
            if let Err(err) = child.kill().await {
                warn!("failed to kill payload: {err}");
            }
            let code = child.wait().await.ok().and_then(|s| s.code());
            if ctx.abort_job.is_set() {
                ctx.job_aborted.set();
            }
            job.set_failed(
                &PilotError::new(ErrorCode::PayloadExecutionFailure)
                    .with_kwarg("exit_code", "killed"),
            );
            break code;
        }

        tokio::select! {
            status = child.wait() => {
                break status.ok().and_then(|s| s.code());
            }
            _ = heartbeat_tick.tick() => {
                ctx.heartbeat.touch(HeartbeatName::Pilot);
                if ctx.heartbeat.is_suspended(SUSPENSION_LIMIT_SECS) {
                    warn!("heartbeat gap detected, the host was likely suspended");
                }
                info!("payload of job {} is running", job.pandaid);
            }
            _ = poll_tick.tick() => {}
        }
    };

    job.exitcode = exit_code;
    info!("payload of job {} ended: exit={exit_code:?}", job.pandaid);
    if exit_code != Some(0) && job.piloterrorcode == 0 {
        job.set_failed(
            &PilotError::new(ErrorCode::PayloadExecutionFailure)
                .with_kwarg("exit_code", format!("{exit_code:?}")),
        );
    }
}

#[cfg(test)]
mod tests {
    use gridpilot_core::config::PilotConfig;
    use gridpilot_core::infosys::InfoService;

    use super::*;

    fn test_ctx(dir: &std::path::Path) -> Arc<PilotContext> {
        let config = PilotConfig {
            heartbeat_file: dir.join("heartbeat.json"),
            workdir: dir.to_path_buf(),
            server_url: "http://127.0.0.1:9".into(),
            ..PilotConfig::default()
        };
        PilotContext::new(config, InfoService::default())
    }

    fn test_job(dir: &std::path::Path, payload: &str) -> Job {
        Job {
            pandaid: 42,
            payload: payload.into(),
            workdir: dir.to_path_buf(),
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn successful_payload_leaves_job_clean() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let mut job = test_job(dir.path(), "echo done");

        run_plain_payload(&mut job, &ctx, &[]).await;

        assert_eq!(job.exitcode, Some(0));
        assert_eq!(job.piloterrorcode, 0);
        let stdout = std::fs::read_to_string(dir.path().join("payload.stdout")).unwrap();
        assert_eq!(stdout.trim(), "done");
    }

    #[tokio::test]
    async fn failing_payload_sets_the_taxonomy_code() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let mut job = test_job(dir.path(), "exit 3");

        run_plain_payload(&mut job, &ctx, &[]).await;

        assert_eq!(job.exitcode, Some(3));
        assert_eq!(
            job.piloterrorcode,
            ErrorCode::PayloadExecutionFailure.value()
        );
        assert_eq!(job.state, JobState::Failed);
    }

    #[tokio::test]
    async fn graceful_stop_kills_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let mut job = test_job(dir.path(), "sleep 30");

        ctx.graceful_stop.set();
        let started = std::time::Instant::now();
        run_plain_payload(&mut job, &ctx, &[]).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(job.state, JobState::Failed);
    }
}
