//! Renderer-facing callback interface.
//!
//! Listeners are notified in registration order. A listener that panics is
//! logged and skipped; the remaining listeners and the run carry on.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::error::{ListenerError, StageFailure, panic_message};
use crate::pipeline::PipelineResult;
use crate::stage::{StageDescriptor, StageOutcome};

pub trait PipelineListener: Send + Sync {
    fn on_step_start(&self, _stage: &StageDescriptor) {}

    fn on_step_progress(&self, _stage: &StageDescriptor, _percent: u8) {}

    fn on_step_complete(&self, _stage: &StageDescriptor, _outcome: &StageOutcome) {}

    fn on_failure(&self, _stage: &StageDescriptor, _error: &StageFailure) {}

    fn on_all_complete(&self, _result: &PipelineResult) {}
}

type StageHook = Box<dyn Fn(&StageDescriptor) + Send + Sync>;
type ProgressHook = Box<dyn Fn(&StageDescriptor, u8) + Send + Sync>;
type CompleteHook = Box<dyn Fn(&StageDescriptor, &StageOutcome) + Send + Sync>;
type FailureHook = Box<dyn Fn(&StageDescriptor, &StageFailure) + Send + Sync>;
type ResultHook = Box<dyn Fn(&PipelineResult) + Send + Sync>;

/// Closure-based listener; every hook is optional.
///
/// ```
/// use agent_relay::listener::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on_step_start(|stage| println!("{} started", stage.name))
///     .on_all_complete(|result| println!("done in {}ms", result.total_elapsed_ms));
/// ```
#[derive(Default)]
pub struct Callbacks {
    step_start: Option<StageHook>,
    step_progress: Option<ProgressHook>,
    step_complete: Option<CompleteHook>,
    failure: Option<FailureHook>,
    all_complete: Option<ResultHook>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_step_start", &self.step_start.is_some())
            .field("on_step_progress", &self.step_progress.is_some())
            .field("on_step_complete", &self.step_complete.is_some())
            .field("on_failure", &self.failure.is_some())
            .field("on_all_complete", &self.all_complete.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_step_start(
        mut self,
        hook: impl Fn(&StageDescriptor) + Send + Sync + 'static,
    ) -> Self {
        self.step_start = Some(Box::new(hook));
        self
    }

    pub fn on_step_progress(
        mut self,
        hook: impl Fn(&StageDescriptor, u8) + Send + Sync + 'static,
    ) -> Self {
        self.step_progress = Some(Box::new(hook));
        self
    }

    pub fn on_step_complete(
        mut self,
        hook: impl Fn(&StageDescriptor, &StageOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.step_complete = Some(Box::new(hook));
        self
    }

    pub fn on_failure(
        mut self,
        hook: impl Fn(&StageDescriptor, &StageFailure) + Send + Sync + 'static,
    ) -> Self {
        self.failure = Some(Box::new(hook));
        self
    }

    pub fn on_all_complete(
        mut self,
        hook: impl Fn(&PipelineResult) + Send + Sync + 'static,
    ) -> Self {
        self.all_complete = Some(Box::new(hook));
        self
    }
}

impl PipelineListener for Callbacks {
    fn on_step_start(&self, stage: &StageDescriptor) {
        if let Some(hook) = &self.step_start {
            hook(stage);
        }
    }

    fn on_step_progress(&self, stage: &StageDescriptor, percent: u8) {
        if let Some(hook) = &self.step_progress {
            hook(stage, percent);
        }
    }

    fn on_step_complete(&self, stage: &StageDescriptor, outcome: &StageOutcome) {
        if let Some(hook) = &self.step_complete {
            hook(stage, outcome);
        }
    }

    fn on_failure(&self, stage: &StageDescriptor, error: &StageFailure) {
        if let Some(hook) = &self.failure {
            hook(stage, error);
        }
    }

    fn on_all_complete(&self, result: &PipelineResult) {
        if let Some(hook) = &self.all_complete {
            hook(result);
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct ListenerSet {
    listeners: Vec<Arc<dyn PipelineListener>>,
}

impl ListenerSet {
    pub(crate) fn push(&mut self, listener: Arc<dyn PipelineListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn step_start(&self, stage: &StageDescriptor) {
        self.notify("on_step_start", |l| l.on_step_start(stage));
    }

    pub(crate) fn step_progress(&self, stage: &StageDescriptor, percent: u8) {
        self.notify("on_step_progress", |l| l.on_step_progress(stage, percent));
    }

    pub(crate) fn step_complete(&self, stage: &StageDescriptor, outcome: &StageOutcome) {
        self.notify("on_step_complete", |l| l.on_step_complete(stage, outcome));
    }

    pub(crate) fn failure(&self, stage: &StageDescriptor, error: &StageFailure) {
        self.notify("on_failure", |l| l.on_failure(stage, error));
    }

    pub(crate) fn all_complete(&self, result: &PipelineResult) {
        self.notify("on_all_complete", |l| l.on_all_complete(result));
    }

    fn notify(&self, hook: &'static str, call: impl Fn(&dyn PipelineListener)) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| call(listener.as_ref())));
            if let Err(payload) = delivered {
                let err = ListenerError {
                    hook,
                    index,
                    message: panic_message(payload),
                };
                warn!(error = %err, "Listener failed; continuing");
            }
        }
    }
}
