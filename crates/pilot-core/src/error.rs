//! The pilot error taxonomy.
//!
//! Every component reports failure with a [`PilotError`]: a numeric code
//! that is a stable wire contract with the workload-management server, a
//! templated message, keyword context and an optional detail tail. The
//! "kind" of an error is its code, not a separate type.

use std::collections::BTreeMap;
use std::fmt;

/// Numeric error kinds understood by the server.
///
/// The discriminants are wire values and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    UnknownException = 1300,
    NoLocalSpace = 1301,
    SizeTooLarge = 1302,
    StageInFailed = 1303,
    StageOutFailed = 1304,
    SetupFailure = 1305,
    PayloadExecutionFailure = 1306,
    MessageHandlingFailure = 1307,
    CommunicationFailure = 1308,
    FileHandlingFailure = 1309,
    NoSuchFile = 1310,
    ConversionFailure = 1311,
    Mkdir = 1312,
    NoProxy = 1313,
    NoVomsProxy = 1314,
    TrfDownloadFailure = 1315,
    NotDefined = 1316,
    NotSameLength = 1317,
    EsRecoverable = 1318,
    EsFatal = 1319,
    ExecutedCloneJob = 1320,
    EsNoEvents = 1321,
    ExceededMaxWaitTime = 1322,
    BadXml = 1323,
    NoSoftwareDir = 1324,
    LogFileCreationFailure = 1325,
    QueueData = 1326,
    QueueDataNotOk = 1327,
    NoReplicas = 1328,
    MiddlewareImportFailure = 1329,
    JobAlreadyRunning = 1330,
    ReplicaNotFound = 1331,
    NoStorageProtocol = 1332,
    MissingOutputFile = 1333,
    StageInTimeout = 1334,
    StageOutTimeout = 1335,
    ChmodTrf = 1336,
    UnknownPayloadFailure = 1337,
}

impl ErrorCode {
    /// The numeric wire value.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Message template for this kind. `{key}` placeholders are filled from
    /// the error's keyword context when rendered.
    pub fn message(self) -> &'static str {
        use ErrorCode::*;
        match self {
            UnknownException => "unknown exception occurred",
            NoLocalSpace => "not enough local space on worker node",
            SizeTooLarge => "total file size too large: {size}",
            StageInFailed => "failed to stage-in file: {reason}",
            StageOutFailed => "failed to stage-out file: {reason}",
            SetupFailure => "payload setup failed",
            PayloadExecutionFailure => "payload execution failed: exit code {exit_code}",
            MessageHandlingFailure => "failed to handle payload message: {reason}",
            CommunicationFailure => "server communication failed: {reason}",
            FileHandlingFailure => "file handling failed: {reason}",
            NoSuchFile => "no such file or directory: {path}",
            ConversionFailure => "failed to convert data: {reason}",
            Mkdir => "failed to create directory: {path}",
            NoProxy => "grid proxy not valid",
            NoVomsProxy => "voms proxy not valid",
            TrfDownloadFailure => "transform download failed: {reason}",
            NotDefined => "error code not defined",
            NotSameLength => "data structures have different lengths",
            EsRecoverable => "recoverable event service error: {reason}",
            EsFatal => "fatal event service error: {reason}",
            ExecutedCloneJob => "already executed clone job",
            EsNoEvents => "no event ranges left to process",
            ExceededMaxWaitTime => "exceeded maximum waiting time",
            BadXml => "badly formed xml",
            NoSoftwareDir => "software directory does not exist: {path}",
            LogFileCreationFailure => "failed to create log file",
            QueueData => "queue configuration could not be downloaded",
            QueueDataNotOk => "queue configuration is corrupt",
            NoReplicas => "no replicas found in catalog for {lfn}",
            MiddlewareImportFailure => "failed to load middleware module: {name}",
            JobAlreadyRunning => "job is already running elsewhere",
            ReplicaNotFound => "no suitable replica found for {lfn}",
            NoStorageProtocol => "no storage protocol resolved for {lfn}",
            MissingOutputFile => "output file does not exist: {path}",
            StageInTimeout => "stage-in timed out: {reason}",
            StageOutTimeout => "stage-out timed out: {reason}",
            ChmodTrf => "failed to chmod transform",
            UnknownPayloadFailure => "payload failed for an unknown reason",
        }
    }

    /// Reverse lookup for codes received over the wire.
    pub fn from_value(value: i32) -> Option<Self> {
        use ErrorCode::*;
        const ALL: [ErrorCode; 38] = [
            UnknownException,
            NoLocalSpace,
            SizeTooLarge,
            StageInFailed,
            StageOutFailed,
            SetupFailure,
            PayloadExecutionFailure,
            MessageHandlingFailure,
            CommunicationFailure,
            FileHandlingFailure,
            NoSuchFile,
            ConversionFailure,
            Mkdir,
            NoProxy,
            NoVomsProxy,
            TrfDownloadFailure,
            NotDefined,
            NotSameLength,
            EsRecoverable,
            EsFatal,
            ExecutedCloneJob,
            EsNoEvents,
            ExceededMaxWaitTime,
            BadXml,
            NoSoftwareDir,
            LogFileCreationFailure,
            QueueData,
            QueueDataNotOk,
            NoReplicas,
            MiddlewareImportFailure,
            JobAlreadyRunning,
            ReplicaNotFound,
            NoStorageProtocol,
            MissingOutputFile,
            StageInTimeout,
            StageOutTimeout,
            ChmodTrf,
            UnknownPayloadFailure,
        ];
        ALL.into_iter().find(|c| c.value() == value)
    }
}

/// A pilot failure: taxonomy code plus rendered context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", self.render())]
pub struct PilotError {
    code: ErrorCode,
    kwargs: BTreeMap<String, String>,
    args: Vec<String>,
    stack: Option<String>,
}

impl PilotError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            kwargs: BTreeMap::new(),
            args: Vec::new(),
            stack: None,
        }
    }

    /// Attach a `{key}` substitution for the message template.
    pub fn with_kwarg(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.kwargs.insert(key.to_string(), value.to_string());
        self
    }

    /// Append a free-form detail line.
    pub fn with_detail(mut self, detail: impl fmt::Display) -> Self {
        self.args.push(detail.to_string());
        self
    }

    /// Record the capture site, shown by [`PilotError::detail`].
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn last_detail(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }

    /// A `MissingOutputFile` error aborts a staging cascade; everything else
    /// lets the engine try the next backend.
    pub fn is_recoverable(&self) -> bool {
        self.code != ErrorCode::MissingOutputFile
    }

    fn rendered_message(&self) -> String {
        let mut message = self.code.message().to_string();
        for (key, value) in &self.kwargs {
            message = message.replace(&format!("{{{key}}}"), value);
        }
        message
    }

    fn render(&self) -> String {
        let mut out = format!(
            "error code: {}, message: {}",
            self.code.value(),
            self.rendered_message()
        );
        if !self.args.is_empty() {
            out.push_str("\ndetails: ");
            out.push_str(&self.args.join("\n"));
        }
        out
    }

    /// The error string plus the capture stack, for diagnostic logs.
    pub fn detail(&self) -> String {
        match &self.stack {
            Some(stack) => format!("{self}\nstacktrace: {stack}"),
            None => self.to_string(),
        }
    }
}

/// Map an OS-level timeout during a transfer onto the taxonomy.
pub fn timeout_code(is_stagein: bool) -> ErrorCode {
    if is_stagein {
        ErrorCode::StageInTimeout
    } else {
        ErrorCode::StageOutTimeout
    }
}
