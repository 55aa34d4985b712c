pub mod orchestrator;

pub use orchestrator::{
    restore_target, AggregateStatus, DataOrchestrator, EntityKind, RefreshOutcome,
};
