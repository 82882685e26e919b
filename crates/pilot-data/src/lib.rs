//! Data movement for the gridpilot agent: replica resolution, transfer
//! backend ("copytool") selection, and the stage-in/stage-out engine.

pub mod catalog;
pub mod copytool;
pub mod copytools;
pub mod paths;
pub mod resolver;
pub mod staging;

pub use catalog::{ClientLocation, Did, HttpReplicaCatalog, ReplicaCatalog, ReplicaRecord};
pub use copytool::{Copytool, CopytoolRegistry, TransferContext};
pub use resolver::{ResolvedReplica, get_preferred_replica, resolve_replicas};
pub use staging::StagingEngine;
