pub mod command;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod event;
pub mod snapshot;
pub mod state;

pub use command::{EngineCommand, EngineNotification};
pub use engine::{EngineHandle, ReconciliationEngine};
pub use event::EngineEvent;
pub use snapshot::{EngineStats, Snapshot, SubmissionEntry};
pub use state::{Effects, ReconciliationState};
