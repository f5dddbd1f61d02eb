use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::pipeline::StageParameters;
use crate::stage::{StageDescriptor, StageId};

const BUILTIN_CATALOG: &str = include_str!("../catalog/default.yaml");

/// Static stage list plus the fixture data the demo agents read.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Catalog {
    pub version: u32,
    pub query: String,
    pub customer: CustomerProfile,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub products: Vec<Product>,
    #[serde(default)]
    pub complementary: Vec<ComplementaryProduct>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse catalog YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_CATALOG).context("Built-in catalog is malformed")
    }

    /// Load `path` when given, otherwise fall back to the built-in catalog.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    /// The run input handed to the first stage: the query and the customer.
    pub fn initial_input(&self) -> Value {
        json!({
            "query": self.query,
            "customer": self.customer,
        })
    }

    pub fn descriptors(&self) -> Vec<StageDescriptor> {
        self.stages.iter().map(StageSpec::descriptor).collect()
    }

    /// Divide every nominal duration by `factor` (a factor of 10 runs ten
    /// times faster).
    pub fn scale_durations(&mut self, factor: f64) -> Result<()> {
        if !(factor.is_finite() && factor > 0.0) {
            bail!("Speed factor must be a positive number, got {factor}");
        }
        for stage in &mut self.stages {
            stage.duration_ms = (stage.duration_ms as f64 / factor).round() as u64;
        }
        Ok(())
    }

    /// Configure stage `id` to fail with `message` on every run.
    pub fn inject_failure(&mut self, id: StageId, message: impl Into<String>) -> Result<()> {
        let Some(stage) = self.stages.iter_mut().find(|stage| stage.id == id) else {
            bail!("Catalog has no stage with id {id}");
        };
        stage
            .params
            .get_or_insert_with(StageParameters::new)
            .insert("fail".to_string(), Value::String(message.into()));
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageSpec {
    pub id: StageId,
    pub agent: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub params: Option<StageParameters>,
}

impl StageSpec {
    pub fn descriptor(&self) -> StageDescriptor {
        StageDescriptor {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            nominal_duration_ms: self.duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CustomerProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    pub budget: f64,
    pub size: u32,
    #[serde(default)]
    pub preferences: Preferences,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Preferences {
    #[serde(default)]
    pub brands: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub past_purchases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Product {
    pub id: u32,
    pub name: String,
    pub brand: String,
    pub price: f64,
    pub rating: f64,
    #[serde(default)]
    pub reviews: u32,
    #[serde(default)]
    pub features: Vec<ProductFeature>,
    pub stock: u32,
    #[serde(default)]
    pub stores: Vec<StoreStock>,
    pub match_score: u32,
    pub category: String,
    #[serde(default)]
    pub season: Option<String>,
    /// Sizes carried; empty means every size.
    #[serde(default)]
    pub sizes: Vec<u32>,
    #[serde(default)]
    pub use_cases: Vec<String>,
}

impl Product {
    pub fn feature(&self, name: &str) -> Option<&str> {
        self.features
            .iter()
            .find(|feature| feature.name.eq_ignore_ascii_case(name))
            .map(|feature| feature.value.as_str())
    }

    pub fn fits(&self, size: u32) -> bool {
        self.sizes.is_empty() || self.sizes.contains(&size)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProductFeature {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StoreStock {
    pub name: String,
    pub distance_km: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ComplementaryProduct {
    pub id: u32,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub description: Option<String>,
    pub purchase_frequency: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_five_agents() {
        let catalog = Catalog::builtin().unwrap();
        assert_eq!(catalog.version, 1);
        let durations: Vec<u64> = catalog.stages.iter().map(|s| s.duration_ms).collect();
        assert_eq!(durations, vec![1000, 1500, 1200, 1000, 800]);
        let ids: Vec<u32> = catalog.stages.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(catalog.products.len(), 3);
        assert_eq!(catalog.customer.size, 9);
    }

    #[test]
    fn initial_input_carries_query_and_customer() {
        let catalog = Catalog::builtin().unwrap();
        let input = catalog.initial_input();
        assert_eq!(input["query"], Value::String(catalog.query.clone()));
        assert_eq!(input["customer"]["name"], "Sarah Johnson");
    }

    #[test]
    fn scale_and_inject_failure() {
        let mut catalog = Catalog::builtin().unwrap();
        catalog.scale_durations(100.0).unwrap();
        assert_eq!(catalog.stages[1].duration_ms, 15);
        assert!(catalog.scale_durations(0.0).is_err());

        catalog.inject_failure(StageId(3), "inventory offline").unwrap();
        let params = catalog.stages[2].params.as_ref().unwrap();
        assert_eq!(params["fail"], "inventory offline");
        assert!(catalog.inject_failure(StageId(9), "nope").is_err());
    }

    #[test]
    fn product_feature_lookup_ignores_case() {
        let catalog = Catalog::builtin().unwrap();
        let nike = &catalog.products[0];
        assert_eq!(nike.feature("waterproof"), Some("90%"));
        assert!(nike.fits(9));
    }
}
