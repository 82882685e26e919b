//! Event-service execution: payload IPC, event-range bookkeeping, and the
//! batched upload of finished ranges.

pub mod executor;
pub mod messages;

pub use executor::{EsState, EventServiceExecutor};
pub use messages::MessageServer;
