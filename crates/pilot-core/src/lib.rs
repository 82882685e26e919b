//! Core types for the gridpilot workload agent: the error taxonomy shared
//! with the server, the file/job data model, site configuration, and the
//! on-disk heartbeat store.

pub mod checksum;
pub mod config;
pub mod error;
pub mod filespec;
pub mod heartbeat;
pub mod infosys;
pub mod job;

pub use config::PilotConfig;
pub use error::{ErrorCode, PilotError};
pub use filespec::{AccessMode, FileSpec, FileStatus, ProtocolSpec};
pub use heartbeat::HeartbeatStore;
pub use infosys::{InfoService, QueueData, StorageData};
pub use job::Job;
