use std::collections::HashSet;

use serde::Serialize;

use crate::agents::value_as_u32;
use crate::catalog::{Catalog, StageSpec};
use crate::pipeline::StageRegistry;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_catalog(catalog: &Catalog, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if catalog.version != 1 {
        report
            .errors
            .push(format!("Unsupported catalog version: {}", catalog.version));
    }

    if catalog.stages.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    if catalog.query.trim().is_empty() {
        report.warnings.push("Catalog query is empty".into());
    }

    if !(catalog.customer.budget.is_finite() && catalog.customer.budget > 0.0) {
        report.errors.push(format!(
            "Customer budget must be positive, got {}",
            catalog.customer.budget
        ));
    }

    if catalog.products.is_empty() {
        report
            .warnings
            .push("Catalog has no products; the graph agent will find nothing".into());
    }

    let mut seen = HashSet::new();
    for (idx, stage) in catalog.stages.iter().enumerate() {
        if !seen.insert(stage.id) {
            report.errors.push(format!("Duplicate stage id {}", stage.id));
        }
        report.merge(validate_stage_order(idx, stage, &catalog.stages));
        report.merge(validate_stage(stage, catalog, registry));
    }

    report
}

fn validate_stage(
    stage: &StageSpec,
    catalog: &Catalog,
    registry: &StageRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();

    if stage.name.trim().is_empty() {
        report
            .errors
            .push(format!("Stage {} has an empty name", stage.id));
    }
    if stage.duration_ms == 0 {
        report.warnings.push(format!(
            "Stage {} ('{}') has a zero duration and will report no intermediate progress",
            stage.id, stage.name
        ));
    }

    let params = stage.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(&stage.agent, params, catalog) {
        report.errors.push(format!(
            "{:#}",
            err.context(format!("Failed to instantiate stage {} ('{}')", stage.id, stage.name))
        ));
    }

    report
}

/// A `source` parameter must point at a stage that runs earlier.
///
/// The value is read the way the agents read it. A value they cannot parse is
/// reported by the instantiation check instead.
fn validate_stage_order(idx: usize, stage: &StageSpec, pipeline: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let source = stage
        .params
        .as_ref()
        .and_then(|params| params.get("source"))
        .and_then(|value| value_as_u32("source", value).ok());
    if let Some(source) = source {
        let earlier = pipeline[..idx].iter().any(|prev| prev.id.0 == source);
        if !earlier {
            report.errors.push(format!(
                "Stage {} reads from stage {source}, which does not run before it",
                stage.id
            ));
        }
    }
    if idx == 0 && needs_upstream(&stage.agent) {
        report.errors.push(format!(
            "Stage {} ('{}') needs an upstream stage and cannot run first",
            stage.id, stage.agent
        ));
    }
    report
}

fn needs_upstream(agent: &str) -> bool {
    matches!(
        agent,
        "knowledge_graph" | "inventory" | "comparison" | "orchestrator"
    )
}
