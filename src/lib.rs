pub mod agents;
pub mod benchmark;
pub mod catalog;
pub mod context;
pub mod error;
pub mod listener;
pub mod observability;
pub mod pipeline;
pub mod runner;
pub mod stage;
pub mod validation;

pub use catalog::Catalog;
pub use context::RunContext;
pub use error::{PipelineError, StageFailure};
pub use listener::{Callbacks, PipelineListener};
pub use observability::MetricsCollector;
pub use pipeline::{
    PipelineConfig, PipelineOrchestrator, PipelineResult, PipelineState, StageRegistry,
};
pub use runner::StageRunner;
pub use stage::{StageDefinition, StageDescriptor, StageId, StageOutcome};
