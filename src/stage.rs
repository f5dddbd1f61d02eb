//! Stage definitions: the static descriptor of a pipeline step plus the work
//! function that produces its payload.

use std::fmt;
use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;
use crate::error::StageFailure;

/// Ordinal identifier of a stage within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StageId {
    fn from(value: u32) -> Self {
        StageId(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: StageId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nominal_duration_ms: u64,
}

impl StageDescriptor {
    pub fn new(id: impl Into<StageId>, name: impl Into<String>, nominal_duration_ms: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            nominal_duration_ms,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn nominal_duration(&self) -> Duration {
        Duration::from_millis(self.nominal_duration_ms)
    }
}

pub type StageFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'static>>;

/// Work performed by one stage.
///
/// Implementations read earlier payloads from the `RunContext` and must not
/// mutate state outside their own output. The returned future owns everything
/// it needs, so clone what is required out of the context before building it.
pub trait StageWork: Send + Sync {
    fn run(&self, ctx: &RunContext) -> StageFuture;
}

struct SyncWork<F>(F);

impl<F> StageWork for SyncWork<F>
where
    F: Fn(&RunContext) -> Result<Value> + Send + Sync,
{
    fn run(&self, ctx: &RunContext) -> StageFuture {
        Box::pin(future::ready((self.0)(ctx)))
    }
}

struct AsyncWork<F>(F);

impl<F, Fut> StageWork for AsyncWork<F>
where
    F: Fn(RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn run(&self, ctx: &RunContext) -> StageFuture {
        Box::pin((self.0)(ctx.clone()))
    }
}

/// Wrap a synchronous closure as stage work.
pub fn work_fn<F>(f: F) -> Arc<dyn StageWork>
where
    F: Fn(&RunContext) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(SyncWork(f))
}

/// Wrap an asynchronous closure as stage work. The closure receives an owned
/// copy of the context.
pub fn async_work_fn<F, Fut>(f: F) -> Arc<dyn StageWork>
where
    F: Fn(RunContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(AsyncWork(f))
}

#[derive(Clone)]
pub struct StageDefinition {
    descriptor: StageDescriptor,
    work: Arc<dyn StageWork>,
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl StageDefinition {
    pub fn new(descriptor: StageDescriptor, work: Arc<dyn StageWork>) -> Self {
        Self { descriptor, work }
    }

    pub fn from_fn<F>(
        id: impl Into<StageId>,
        name: impl Into<String>,
        nominal_duration_ms: u64,
        f: F,
    ) -> Self
    where
        F: Fn(&RunContext) -> Result<Value> + Send + Sync + 'static,
    {
        Self::new(
            StageDescriptor::new(id, name, nominal_duration_ms),
            work_fn(f),
        )
    }

    pub fn from_async<F, Fut>(
        id: impl Into<StageId>,
        name: impl Into<String>,
        nominal_duration_ms: u64,
        f: F,
    ) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(
            StageDescriptor::new(id, name, nominal_duration_ms),
            async_work_fn(f),
        )
    }

    pub fn descriptor(&self) -> &StageDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> StageId {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn nominal_duration(&self) -> Duration {
        self.descriptor.nominal_duration()
    }

    pub(crate) fn work(&self) -> &dyn StageWork {
        self.work.as_ref()
    }
}

/// Result of one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage_id: StageId,
    pub success: bool,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
    pub elapsed_ms: u64,
}

impl StageOutcome {
    pub fn succeeded(stage_id: StageId, data: Value, elapsed_ms: u64) -> Self {
        Self {
            stage_id,
            success: true,
            data,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(failure: StageFailure, elapsed_ms: u64) -> Self {
        Self {
            stage_id: failure.stage_id,
            success: false,
            data: Value::Null,
            error: Some(failure),
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stage_id_serializes_as_bare_number() {
        let descriptor = StageDescriptor::new(4, "Comparison Agent", 1000);
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["id"], json!(4));
        assert_eq!(value["nominal_duration_ms"], json!(1000));
    }

    #[test]
    fn failed_outcome_carries_null_payload() {
        let outcome = StageOutcome::failed(StageFailure::new(StageId(2), "graph offline"), 12);
        assert!(!outcome.success);
        assert_eq!(outcome.stage_id, StageId(2));
        assert_eq!(outcome.data, Value::Null);
        assert_eq!(outcome.error.unwrap().message, "graph offline");
    }

    #[tokio::test]
    async fn sync_work_reads_context_input() {
        let stage = StageDefinition::from_fn(1, "echo", 0, |ctx| Ok(ctx.input().clone()));
        let ctx = RunContext::new(json!({"query": "running shoes"}));
        let value = stage.work().run(&ctx).await.unwrap();
        assert_eq!(value["query"], "running shoes");
    }
}
