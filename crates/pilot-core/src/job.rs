//! The job aggregate: payload command, input and output file sets, and the
//! bookkeeping the stages update as the job moves between queues.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::filespec::{AccessMode, FileSpec};

/// One file entry inside a job description from the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescription {
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub lfn: String,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub ddm_endpoint: String,
    #[serde(default)]
    pub dataset: String,
    #[serde(default)]
    pub filesize: u64,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub accessmode: AccessMode,
}

/// The job description as served by `getJob`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescription {
    #[serde(rename = "PandaID")]
    pub panda_id: i64,
    #[serde(default, rename = "taskID")]
    pub task_id: i64,
    #[serde(default, rename = "jobsetID")]
    pub jobset_id: i64,
    /// Payload command, already fully formed by the server.
    #[serde(default)]
    pub transformation: String,
    #[serde(default)]
    pub job_pars: String,
    #[serde(default)]
    pub in_files: Vec<FileDescription>,
    #[serde(default)]
    pub out_files: Vec<FileDescription>,
    #[serde(default)]
    pub prod_source_label: String,
    #[serde(default)]
    pub transfer_type: String,
    #[serde(default)]
    pub event_service: bool,
}

/// Job lifecycle states reported to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Starting,
    Running,
    Finished,
    Failed,
}

/// A job owned by exactly one stage at a time; the owning stage is the only
/// mutator until the job lands on a terminal queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Job {
    pub pandaid: i64,
    pub taskid: i64,
    pub jobsetid: i64,
    /// Full payload command line, run through the shell in `workdir`.
    pub payload: String,
    pub workdir: PathBuf,
    pub indata: Vec<FileSpec>,
    pub outdata: Vec<FileSpec>,
    /// Events processed so far (event-service jobs).
    pub nevents: u64,
    pub accessmode: AccessMode,
    pub transfertype: String,
    pub is_analysis: bool,
    pub is_eventservice: bool,
    pub state: JobState,
    pub exitcode: Option<i32>,
    /// Taxonomy code of the failure that terminated the job, if any.
    pub piloterrorcode: i32,
    pub piloterrordiag: String,
}

impl Job {
    /// Build a job from a server description; file specs inherit scope,
    /// endpoint, dataset and checksum hints.
    pub fn from_description(desc: JobDescription, workdir: PathBuf) -> Self {
        let is_analysis = desc.prod_source_label.starts_with("user")
            || desc.prod_source_label.starts_with("panda");

        let to_spec = |fd: &FileDescription, activity: &str| -> FileSpec {
            let mut fspec = FileSpec::new(&fd.scope, &fd.lfn);
            fspec.guid = fd.guid.clone();
            fspec.ddmendpoint = fd.ddm_endpoint.clone();
            fspec.dataset = fd.dataset.clone();
            fspec.filesize = fd.filesize;
            fspec.accessmode = fd.accessmode;
            fspec.activity = activity.to_string();
            fspec.workdir = Some(workdir.clone());
            if let Some(checksum) = &fd.checksum {
                // server sends "ad:<hex>" or "md5:<hex>"
                match checksum.split_once(':') {
                    Some(("ad", hex)) => {
                        fspec.checksum.insert("adler32".into(), hex.to_string());
                    }
                    Some(("md5", hex)) => {
                        fspec.checksum.insert("md5".into(), hex.to_string());
                    }
                    _ => {
                        fspec.checksum.insert("adler32".into(), checksum.clone());
                    }
                }
            }
            fspec
        };

        let indata = desc.in_files.iter().map(|fd| to_spec(fd, "pr")).collect();
        let outdata = desc.out_files.iter().map(|fd| to_spec(fd, "pw")).collect();

        let mut payload = desc.transformation.clone();
        if !desc.job_pars.is_empty() {
            payload.push(' ');
            payload.push_str(&desc.job_pars);
        }

        Self {
            pandaid: desc.panda_id,
            taskid: desc.task_id,
            jobsetid: desc.jobset_id,
            payload,
            workdir,
            indata,
            outdata,
            accessmode: AccessMode::Unset,
            transfertype: desc.transfer_type,
            is_analysis,
            is_eventservice: desc.event_service,
            ..Self::default()
        }
    }

    /// The job-state document for `updateJob`.
    pub fn state_report(&self) -> serde_json::Value {
        serde_json::json!({
            "jobId": self.pandaid,
            "state": self.state,
            "exitCode": self.exitcode,
            "pilotErrorCode": self.piloterrorcode,
            "pilotErrorDiag": self.piloterrordiag,
            "nEvents": self.nevents,
        })
    }

    /// Mark the job failed; the first recorded failure wins.
    pub fn set_failed(&mut self, error: &crate::error::PilotError) {
        self.state = JobState::Failed;
        if self.piloterrorcode == 0 {
            self.piloterrorcode = error.code().value();
            self.piloterrordiag = error.to_string();
        }
    }
}
