use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::stage::StageId;

/// Per-run state folded forward from stage to stage: the original input plus
/// every completed stage's payload, in completion order.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    input: Value,
    outputs: Vec<(StageId, Value)>,
}

impl RunContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            outputs: Vec::new(),
        }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.input.clone()).context("Run input has an unexpected shape")
    }

    pub fn output(&self, stage: StageId) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|(id, _)| *id == stage)
            .map(|(_, value)| value)
    }

    /// Payload of the most recently completed stage.
    pub fn latest(&self) -> Option<(StageId, &Value)> {
        self.outputs.last().map(|(id, value)| (*id, value))
    }

    /// Decode the payload of `stage`, or of the latest stage when `stage` is
    /// `None`.
    pub fn upstream_as<T: DeserializeOwned>(&self, stage: Option<StageId>) -> Result<T> {
        let (id, value) = match stage {
            Some(id) => (
                id,
                self.output(id)
                    .ok_or_else(|| anyhow!("Missing output of stage {id}"))?,
            ),
            None => self
                .latest()
                .ok_or_else(|| anyhow!("No upstream stage has completed"))?,
        };
        serde_json::from_value(value.clone())
            .with_context(|| format!("Output of stage {id} has an unexpected shape"))
    }

    pub fn completed_stages(&self) -> impl Iterator<Item = StageId> + '_ {
        self.outputs.iter().map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub(crate) fn record(&mut self, stage: StageId, data: Value) {
        self.outputs.push((stage, data));
    }
}
