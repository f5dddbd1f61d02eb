use std::any::Any;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stage::StageId;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("A run is already in flight on this orchestrator")]
    AlreadyRunning,

    #[error("Run was cancelled by reset")]
    Cancelled,

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// A stage's work function signalled failure. Carried as a value inside
/// `StageOutcome` and `PipelineResult`, never raised out of `run()`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Stage {stage_id} failed: {message}")]
pub struct StageFailure {
    pub stage_id: StageId,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage_id: StageId, message: impl Into<String>) -> Self {
        Self {
            stage_id,
            message: message.into(),
        }
    }
}

/// A registered listener panicked while handling a pipeline event.
#[derive(Debug, Clone, Error)]
#[error("Listener #{index} panicked in {hook}: {message}")]
pub struct ListenerError {
    pub hook: &'static str,
    pub index: usize,
    pub message: String,
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
