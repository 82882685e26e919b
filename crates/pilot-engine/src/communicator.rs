//! Typed requests against the workload-management server.
//!
//! Each operation kind holds its own mutex so at most one request of that
//! kind is outstanding per process. Every response is normalised into a
//! [`ServerResponse`]; communication trouble never panics the pilot.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use gridpilot_core::error::{ErrorCode, PilotError};

/// `StatusCode` of the distinguished "no work available" reply.
pub const NO_WORK_STATUS: i64 = 20;

/// Normalised server reply.
#[derive(Debug)]
pub struct ServerResponse {
    /// 0 on success; the server `StatusCode` otherwise.
    pub status: i64,
    pub content: Option<Value>,
    pub exception: Option<PilotError>,
}

impl ServerResponse {
    fn ok(content: Value) -> Self {
        Self {
            status: 0,
            content: Some(content),
            exception: None,
        }
    }

    fn failed(status: i64, exception: PilotError) -> Self {
        Self {
            status,
            content: None,
            exception: Some(exception),
        }
    }

    fn no_work() -> Self {
        Self {
            status: NO_WORK_STATUS,
            content: None,
            exception: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }

    /// The server had nothing to hand out; not a failure.
    pub fn is_no_work(&self) -> bool {
        self.status == NO_WORK_STATUS
    }
}

/// Parameters of a `getJob` call.
#[derive(Debug, Clone, Serialize)]
pub struct JobRequest {
    #[serde(rename = "siteName")]
    pub site: String,
    #[serde(rename = "computingElement")]
    pub queue: String,
    #[serde(rename = "prodSourceLabel")]
    pub job_label: String,
    #[serde(skip)]
    pub num_jobs: usize,
}

/// Parameters of a `getEventRanges` call.
#[derive(Debug, Clone, Serialize)]
pub struct EventRequest {
    #[serde(rename = "pandaID")]
    pub pandaid: i64,
    #[serde(rename = "jobsetID")]
    pub jobsetid: i64,
    #[serde(rename = "taskID")]
    pub taskid: i64,
    #[serde(rename = "nRanges")]
    pub num_ranges: u32,
}

pub struct Communicator {
    http: reqwest::Client,
    base: String,
    get_jobs_lock: Mutex<()>,
    get_events_lock: Mutex<()>,
    update_events_lock: Mutex<()>,
    update_jobs_lock: Mutex<()>,
}

/// The envelope `StatusCode`, tolerating both number and string encodings.
fn status_code(envelope: &Value) -> i64 {
    match envelope.get("StatusCode") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(-1),
        Some(Value::String(s)) => s.parse().unwrap_or(-1),
        _ => -1,
    }
}

fn error_dialog(envelope: &Value) -> &str {
    envelope
        .get("errorDialog")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

impl Communicator {
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into(),
            get_jobs_lock: Mutex::new(()),
            get_events_lock: Mutex::new(()),
            update_events_lock: Mutex::new(()),
            update_jobs_lock: Mutex::new(()),
        }
    }

    fn url(&self, operation: &str) -> String {
        let base = std::env::var("PANDA_SERVER_URL").unwrap_or_else(|_| self.base.clone());
        format!("{}/server/panda/{operation}", base.trim_end_matches('/'))
    }

    async fn request(&self, operation: &str, data: Value) -> Result<Value, PilotError> {
        let url = self.url(operation);
        let response = self.http.post(&url).json(&data).send().await.map_err(|err| {
            PilotError::new(ErrorCode::CommunicationFailure)
                .with_kwarg("reason", format!("{operation}: {err}"))
        })?;
        if !response.status().is_success() {
            return Err(PilotError::new(ErrorCode::CommunicationFailure)
                .with_kwarg("reason", format!("{operation}: http {}", response.status())));
        }
        response.json().await.map_err(|err| {
            PilotError::new(ErrorCode::CommunicationFailure)
                .with_kwarg("reason", format!("{operation} body: {err}"))
        })
    }

    /// Fetch up to `req.num_jobs` job definitions.
    pub async fn get_jobs(&self, req: &JobRequest) -> ServerResponse {
        let _guard = self.get_jobs_lock.lock().await;

        let data = match serde_json::to_value(req) {
            Ok(data) => data,
            Err(err) => {
                return ServerResponse::failed(
                    -1,
                    PilotError::new(ErrorCode::ConversionFailure)
                        .with_kwarg("reason", err.to_string()),
                );
            }
        };

        let mut jobs: Vec<Value> = Vec::new();
        let mut failure: Option<ServerResponse> = None;

        for _ in 0..req.num_jobs.max(1) {
            info!("requesting a job from the server");
            let envelope = match self.request("getJob", data.clone()).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!("getJob failed: {err}");
                    failure = Some(ServerResponse::failed(-1, err));
                    break;
                }
            };

            let code = status_code(&envelope);
            if code == NO_WORK_STATUS && error_dialog(&envelope).contains("no jobs in PanDA") {
                info!("server reports no jobs available");
                failure = Some(ServerResponse::no_work());
            } else if code != 0 {
                failure = Some(ServerResponse::failed(
                    code,
                    PilotError::new(ErrorCode::CommunicationFailure)
                        .with_kwarg("reason", format!("getJob returned StatusCode={code}")),
                ));
                break;
            } else {
                jobs.push(envelope);
            }
        }

        if !jobs.is_empty() {
            ServerResponse::ok(Value::Array(jobs))
        } else {
            failure.unwrap_or_else(|| {
                ServerResponse::failed(
                    -1,
                    PilotError::new(ErrorCode::UnknownException).with_detail("failed to get jobs"),
                )
            })
        }
    }

    /// Download new event ranges for an event-service job.
    pub async fn get_events(&self, req: &EventRequest) -> ServerResponse {
        let _guard = self.get_events_lock.lock().await;

        let mut req = req.clone();
        if req.num_ranges == 0 {
            req.num_ranges = 1;
        }
        let data = match serde_json::to_value(&req) {
            Ok(data) => data,
            Err(err) => {
                return ServerResponse::failed(
                    -1,
                    PilotError::new(ErrorCode::ConversionFailure)
                        .with_kwarg("reason", err.to_string()),
                );
            }
        };

        info!("downloading new event ranges: pandaid={}", req.pandaid);
        match self.request("getEventRanges", data).await {
            Ok(envelope) => {
                let code = status_code(&envelope);
                if code == 0 {
                    let ranges = envelope.get("eventRanges").cloned().unwrap_or(Value::Null);
                    ServerResponse::ok(ranges)
                } else {
                    ServerResponse::failed(
                        code,
                        PilotError::new(ErrorCode::CommunicationFailure).with_kwarg(
                            "reason",
                            format!("getEventRanges returned StatusCode={code}"),
                        ),
                    )
                }
            }
            Err(err) => {
                warn!("getEventRanges failed: {err}");
                ServerResponse::failed(-1, err)
            }
        }
    }

    /// Report a batch of event-range updates.
    pub async fn update_events(&self, update: Value) -> ServerResponse {
        let _guard = self.update_events_lock.lock().await;

        info!("updating event ranges");
        match self.request("updateEventRanges", update).await {
            Ok(envelope) => ServerResponse::ok(envelope),
            Err(err) => {
                warn!("updateEventRanges failed: {err}");
                ServerResponse::failed(-1, err)
            }
        }
    }

    /// Report one job-state document.
    pub async fn update_job(&self, job: &Value) -> Result<Value, PilotError> {
        let job_id = job.get("jobId").cloned().unwrap_or(Value::Null);
        info!("updating job: {}", job_id);
        self.request("updateJob", job.clone()).await
    }

    /// Report job states sequentially, collecting per-item results.
    pub async fn update_jobs(&self, jobs: &[Value]) -> ServerResponse {
        let _guard = self.update_jobs_lock.lock().await;

        let mut results: Vec<Value> = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.update_job(job).await {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!("updateJob failed: {err}");
                    results.push(Value::Null);
                }
            }
        }
        ServerResponse::ok(Value::Array(results))
    }

    /// Report several job states in a single request.
    pub async fn update_jobs_bulk(&self, jobs: &[Value]) -> ServerResponse {
        let _guard = self.update_jobs_lock.lock().await;

        let data = serde_json::json!({
            "jobList": serde_json::to_string(jobs).unwrap_or_default(),
        });
        info!("updating {} jobs in bulk", jobs.len());
        match self.request("updateJobsInBulk", data).await {
            Ok(envelope) => ServerResponse::ok(envelope),
            Err(err) => {
                warn!("updateJobsInBulk failed: {err}");
                ServerResponse::failed(-1, err)
            }
        }
    }

    /// Fetch an objectstore credential pair.
    pub async fn get_key_pair(&self, public_key: &str, private_key: &str) -> ServerResponse {
        let data = serde_json::json!({
            "publicKeyName": public_key,
            "privateKeyName": private_key,
        });
        match self.request("getKeyPair", data).await {
            Ok(envelope) => {
                let code = status_code(&envelope);
                if code == 0 {
                    ServerResponse::ok(envelope)
                } else {
                    ServerResponse::failed(
                        code,
                        PilotError::new(ErrorCode::CommunicationFailure)
                            .with_kwarg("reason", format!("getKeyPair returned StatusCode={code}")),
                    )
                }
            }
            Err(err) => ServerResponse::failed(-1, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_tolerates_string_and_number() {
        assert_eq!(status_code(&serde_json::json!({"StatusCode": 0})), 0);
        assert_eq!(status_code(&serde_json::json!({"StatusCode": "0"})), 0);
        assert_eq!(status_code(&serde_json::json!({"StatusCode": "20"})), 20);
        assert_eq!(status_code(&serde_json::json!({})), -1);
    }

    #[test]
    fn no_work_is_not_a_failure() {
        let response = ServerResponse::no_work();
        assert!(response.is_no_work());
        assert!(!response.is_ok());
        assert!(response.exception.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_yields_a_failure_envelope() {
        let communicator = Communicator::new(
            reqwest::Client::builder()
                .timeout(std::time::Duration::from_millis(200))
                .build()
                .unwrap(),
            "http://127.0.0.1:9", // discard port, nothing listens
        );
        let response = communicator
            .get_jobs(&JobRequest {
                site: "SITE".into(),
                queue: "SITE_QUEUE".into(),
                job_label: "managed".into(),
                num_jobs: 1,
            })
            .await;
        assert!(!response.is_ok());
        assert!(!response.is_no_work());
        let err = response.exception.expect("failure carries the taxonomy error");
        assert_eq!(err.code(), ErrorCode::CommunicationFailure);
    }
}
