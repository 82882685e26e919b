//! Supervision of one event-service payload.
//!
//! Spawns the payload, exchanges event ranges over the message socket,
//! buffers finished ranges, and posts them to the server in batches.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gridpilot_core::checksum::adler32_file;
use gridpilot_core::error::{ErrorCode, PilotError};
use gridpilot_core::job::Job;

use crate::communicator::{Communicator, EventRequest};
use crate::context::Flag;

use super::messages::MessageServer;

/// Lifecycle of the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsState {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
}

/// One event-range report from the payload.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeUpdate {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub wall: f64,
    #[serde(default)]
    pub message: String,
}

/// Classified payload message.
#[derive(Debug)]
enum PayloadMessage {
    Finished(RangeUpdate),
    Failed(RangeUpdate),
    RangeRequest { count: u32 },
    Other(String),
}

fn default_range_count() -> u32 {
    std::env::var("ATHENA_PROC_NUMBER")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

fn classify(line: &str) -> PayloadMessage {
    if let Ok(update) = serde_json::from_str::<RangeUpdate>(line) {
        return match update.status.as_str() {
            "failed" | "fatal" => PayloadMessage::Failed(update),
            _ => PayloadMessage::Finished(update),
        };
    }
    if line.to_ascii_lowercase().contains("ready for events") {
        return PayloadMessage::RangeRequest {
            count: default_range_count(),
        };
    }
    PayloadMessage::Other(line.to_string())
}

/// A finished range plus the local metadata attached at upload time.
#[derive(Debug, Clone)]
struct FinishedRange {
    update: RangeUpdate,
    fsize: u64,
    adler32: String,
}

/// The `esOutput` batch for one `updateEventRanges` call.
fn build_finished_batch(ranges: &[FinishedRange]) -> Value {
    let event_ranges: Vec<Value> = ranges
        .iter()
        .map(|r| {
            serde_json::json!({
                "eventRangeID": r.update.id,
                "eventStatus": "finished",
                "pfn": r.update.output,
                "fsize": r.fsize,
                "adler32": r.adler32,
            })
        })
        .collect();
    let status = serde_json::json!({
        "esOutput": {"numEvents": event_ranges.len()},
        "eventRanges": event_ranges,
    });
    serde_json::json!({
        "version": 1,
        "eventRanges": serde_json::to_string(&vec![status]).unwrap_or_default(),
    })
}

/// Immediate report for failed / fatal ranges.
fn build_failed_batch(updates: &[RangeUpdate]) -> Value {
    let event_ranges: Vec<Value> = updates
        .iter()
        .map(|u| {
            let status = if u.status == "fatal" { "fatal" } else { "failed" };
            serde_json::json!({
                "errorCode": ErrorCode::UnknownPayloadFailure.value(),
                "eventRangeID": u.id,
                "eventStatus": status,
            })
        })
        .collect();
    serde_json::json!({
        "version": 0,
        "eventRanges": serde_json::to_string(&event_ranges).unwrap_or_default(),
    })
}

pub struct EventServiceExecutor {
    communicator: Arc<Communicator>,
    /// Minimum gap between output batches.
    stageout_gap: Duration,
    graceful_stop: Flag,
    state: Mutex<EsState>,
}

const FLUSH_POLL: Duration = Duration::from_secs(5);
const STOP_POLL: Duration = Duration::from_millis(500);
const RUNNING_HEARTBEAT: Duration = Duration::from_secs(60);

impl EventServiceExecutor {
    pub fn new(communicator: Arc<Communicator>, stageout_gap: Duration, graceful_stop: Flag) -> Self {
        Self {
            communicator,
            stageout_gap,
            graceful_stop,
            state: Mutex::new(EsState::Idle),
        }
    }

    pub fn state(&self) -> EsState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: EsState) {
        info!("event service state: {state:?}");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Run the payload to completion (or cooperative stop); returns its exit
    /// code when it exited by itself. `extra_env` is added to the payload
    /// environment (objectstore credentials).
    pub async fn run(
        &self,
        job: &mut Job,
        extra_env: &[(String, String)],
    ) -> Result<Option<i32>, PilotError> {
        self.set_state(EsState::Starting);

        let server = MessageServer::bind(&job.workdir, None)?;
        let socket_path = server.path().to_path_buf();

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<String>(1000);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(100);
        let socket_stop = Flag::new();
        let socket_task = tokio::spawn(server.run(inbound_tx, outbound_rx, socket_stop.clone()));

        let mut child = match self.spawn_payload(job, &socket_path, extra_env) {
            Ok(child) => child,
            Err(err) => {
                socket_stop.set();
                let _ = socket_task.await;
                self.set_state(EsState::Stopped);
                return Err(err);
            }
        };
        self.set_state(EsState::Running);

        let mut queued_out: Vec<FinishedRange> = Vec::new();
        let mut last_flush: Option<Instant> = None;
        let mut exit_code: Option<i32> = None;

        let mut flush_tick = tokio::time::interval(FLUSH_POLL);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stop_tick = tokio::time::interval(STOP_POLL);
        stop_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut heartbeat_tick = tokio::time::interval(RUNNING_HEARTBEAT);
        heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.graceful_stop.is_set() {
                info!("stop requested, ending event service payload");
                break;
            }

            tokio::select! {
                status = child.wait() => {
                    exit_code = status.ok().and_then(|s| s.code());
                    info!("event service payload exited: code={exit_code:?}");
                    break;
                }
                msg = inbound_rx.recv() => {
                    match msg {
                        Some(line) => {
                            self.handle_message(&line, job, &outbound_tx, &mut queued_out).await;
                        }
                        None => break,
                    }
                }
                _ = flush_tick.tick() => {
                    self.stageout_es(&mut queued_out, &mut last_flush, false, job).await;
                }
                _ = heartbeat_tick.tick() => {
                    info!(
                        "event service running: pandaid={}, nevents={}, queued={}",
                        job.pandaid, job.nevents, queued_out.len()
                    );
                }
                _ = stop_tick.tick() => {}
            }
        }

        self.set_state(EsState::Draining);

        // wait for the payload to become non-alive before draining
        if exit_code.is_none() {
            if let Err(err) = child.kill().await {
                warn!("failed to kill event service payload: {err}");
            }
            if let Ok(status) = child.wait().await {
                exit_code = status.code();
            }
        }

        // let the receiver push its last buffered frames, then drain them
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(line) = inbound_rx.try_recv() {
            self.handle_message(&line, job, &outbound_tx, &mut queued_out).await;
        }
        self.stageout_es(&mut queued_out, &mut last_flush, true, job).await;

        socket_stop.set();
        let _ = socket_task.await;
        self.set_state(EsState::Stopped);

        Ok(exit_code)
    }

    fn spawn_payload(
        &self,
        job: &Job,
        socket_path: &std::path::Path,
        extra_env: &[(String, String)],
    ) -> Result<tokio::process::Child, PilotError> {
        let stdout = std::fs::File::create(job.workdir.join("payload.stdout")).map_err(|err| {
            PilotError::new(ErrorCode::LogFileCreationFailure).with_detail(err.to_string())
        })?;
        let stderr = std::fs::File::create(job.workdir.join("payload.stderr")).map_err(|err| {
            PilotError::new(ErrorCode::LogFileCreationFailure).with_detail(err.to_string())
        })?;

        let child = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&job.payload)
            .current_dir(&job.workdir)
            .env("PILOT_EVENTRANGES_SOCKET", socket_path)
            .envs(extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|err| {
                PilotError::new(ErrorCode::SetupFailure)
                    .with_detail(format!("spawn event service payload: {err}"))
            })?;
        info!("event service payload started: pid={:?}", child.id());
        Ok(child)
    }

    async fn handle_message(
        &self,
        line: &str,
        job: &mut Job,
        outbound: &mpsc::Sender<String>,
        queued_out: &mut Vec<FinishedRange>,
    ) {
        match classify(line) {
            PayloadMessage::Finished(update) => {
                debug!("finished event range: {}", update.id);
                let (fsize, adler32) = stat_output(&update.output);
                queued_out.push(FinishedRange {
                    update,
                    fsize,
                    adler32,
                });
            }
            PayloadMessage::Failed(update) => {
                warn!("failed event range {}: {}", update.id, update.message);
                let response = self
                    .communicator
                    .update_events(build_failed_batch(std::slice::from_ref(&update)))
                    .await;
                if !response.is_ok() {
                    warn!("failed to report failed event range {}", update.id);
                }
            }
            PayloadMessage::RangeRequest { count } => {
                let request = EventRequest {
                    pandaid: job.pandaid,
                    jobsetid: job.jobsetid,
                    taskid: job.taskid,
                    num_ranges: count,
                };
                let response = self.communicator.get_events(&request).await;
                let reply = match response.content {
                    Some(Value::Array(ranges)) if !ranges.is_empty() => {
                        serde_json::to_string(&ranges).unwrap_or_else(|_| "No more events".into())
                    }
                    _ => "No more events".to_string(),
                };
                if outbound.send(reply).await.is_err() {
                    warn!("payload socket closed before event ranges could be sent");
                }
            }
            PayloadMessage::Other(text) => {
                debug!("unhandled payload message: {text}");
            }
        }
    }

    /// Drain buffered finished ranges into one batch when the configured
    /// gap elapsed (or unconditionally on the final flush).
    async fn stageout_es(
        &self,
        queued_out: &mut Vec<FinishedRange>,
        last_flush: &mut Option<Instant>,
        force: bool,
        job: &mut Job,
    ) {
        if queued_out.is_empty() {
            return;
        }
        let due = force || last_flush.is_none_or(|t| t.elapsed() >= self.stageout_gap);
        if !due {
            return;
        }

        let batch = std::mem::take(queued_out);
        let count = batch.len();
        let response = self.communicator.update_events(build_finished_batch(&batch)).await;
        if response.is_ok() {
            job.nevents += count as u64;
            *last_flush = Some(Instant::now());
            info!("reported {count} finished event ranges");
        } else {
            warn!("failed to report {count} finished event ranges, re-queueing");
            queued_out.extend(batch);
        }
    }
}

fn stat_output(path: &str) -> (u64, String) {
    if path.is_empty() {
        return (0, String::new());
    }
    let p = std::path::Path::new(path);
    let fsize = std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
    let adler32 = adler32_file(p).unwrap_or_default();
    (fsize, adler32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(id: &str) -> FinishedRange {
        FinishedRange {
            update: RangeUpdate {
                id: id.to_string(),
                status: "finished".into(),
                output: format!("/work/{id}.out"),
                cpu: 1.0,
                wall: 2.0,
                message: String::new(),
            },
            fsize: 10,
            adler32: "0000000a".into(),
        }
    }

    #[test]
    fn classification_follows_the_range_protocol() {
        assert!(matches!(
            classify(r#"{"id":"1-1","status":"finished","output":"/w/o"}"#),
            PayloadMessage::Finished(u) if u.id == "1-1"
        ));
        assert!(matches!(
            classify(r#"{"id":"1-2","status":"failed","message":"boom"}"#),
            PayloadMessage::Failed(_)
        ));
        assert!(matches!(
            classify(r#"{"id":"1-3","status":"fatal","message":"boom"}"#),
            PayloadMessage::Failed(_)
        ));
        assert!(matches!(
            classify("Ready for events"),
            PayloadMessage::RangeRequest { .. }
        ));
        assert!(matches!(classify("hello"), PayloadMessage::Other(_)));
    }

    #[test]
    fn finished_batch_reports_every_buffered_id_once() {
        let batch = build_finished_batch(&[finished("1-1"), finished("1-2"), finished("1-3")]);
        assert_eq!(batch["version"], 1);

        let inner: Vec<Value> =
            serde_json::from_str(batch["eventRanges"].as_str().unwrap()).unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0]["esOutput"]["numEvents"], 3);

        let ids: Vec<&str> = inner[0]["eventRanges"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["eventRangeID"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["1-1", "1-2", "1-3"]);
        for range in inner[0]["eventRanges"].as_array().unwrap() {
            assert_eq!(range["eventStatus"], "finished");
            assert_eq!(range["fsize"], 10);
            assert_eq!(range["adler32"], "0000000a");
        }
    }

    #[test]
    fn failed_batch_carries_the_payload_failure_code() {
        let update = RangeUpdate {
            id: "9-1".into(),
            status: "fatal".into(),
            output: String::new(),
            cpu: 0.0,
            wall: 0.0,
            message: "segfault".into(),
        };
        let batch = build_failed_batch(&[update]);
        assert_eq!(batch["version"], 0);
        let ranges: Vec<Value> = serde_json::from_str(batch["eventRanges"].as_str().unwrap()).unwrap();
        assert_eq!(ranges[0]["eventRangeID"], "9-1");
        assert_eq!(ranges[0]["eventStatus"], "fatal");
        assert_eq!(
            ranges[0]["errorCode"],
            ErrorCode::UnknownPayloadFailure.value()
        );
    }

    #[tokio::test]
    async fn executor_runs_a_trivial_payload_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let communicator = Arc::new(Communicator::new(
            reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
            "http://127.0.0.1:9",
        ));
        let executor =
            EventServiceExecutor::new(communicator, Duration::from_secs(600), Flag::new());
        assert_eq!(executor.state(), EsState::Idle);

        let mut job = Job {
            pandaid: 1,
            payload: "true".into(),
            workdir: dir.path().to_path_buf(),
            is_eventservice: true,
            ..Job::default()
        };

        let exit_code = executor.run(&mut job, &[]).await.unwrap();
        assert_eq!(exit_code, Some(0));
        assert_eq!(executor.state(), EsState::Stopped);
        assert!(dir.path().join("payload.stdout").is_file());
    }
}
