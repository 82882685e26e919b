//! The gridpilot workflow engine: server communication, the event-service
//! executor, and the three-stage job/data/monitor pipeline with its queue
//! bundle and cooperative shutdown.

pub mod communicator;
pub mod context;
pub mod credentials;
pub mod eventservice;
pub mod orchestrator;
pub mod pfc;
pub mod queues;
pub mod signals;
pub mod stages;

pub use communicator::{Communicator, JobRequest, ServerResponse};
pub use context::{Flag, PilotContext};
pub use orchestrator::run;
pub use queues::Queues;
