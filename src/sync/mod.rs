//! Phased sync pipeline: orchestration, phase accounting and the item sink
//! seam downstream consumers implement.

pub mod orchestrator;
pub mod phases;
pub mod sink;

pub use orchestrator::{ControlAction, ControlOutcome, StartedSync, SyncOrchestrator};
pub use phases::{JobPhases, PhaseState, SyncPhaseName, collections_for};
pub use sink::{ItemSink, TracingSink};
