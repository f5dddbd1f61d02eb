//! The five demo agents of the product-recommendation pipeline.
//!
//! Every agent is a pure function of the run context and its catalog
//! fixtures. Payloads have a fixed shape per agent; downstream agents decode
//! the payload of the stage before them (or of `params.source`).

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{Catalog, ComplementaryProduct, CustomerProfile, Product};
use crate::context::RunContext;
use crate::pipeline::{StageParameters, StageRegistry};
use crate::stage::{StageId, StageWork, work_fn};

/// A registry holding the five demo agents.
pub fn default_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    register_defaults(&mut registry);
    registry
}

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("product_discovery", |params, _catalog| {
        Ok(into_work(ProductDiscovery::from_params(params)?))
    });
    registry.register("knowledge_graph", |params, catalog| {
        Ok(into_work(KnowledgeGraph::from_params(params, catalog)?))
    });
    registry.register("inventory", |params, _catalog| {
        Ok(into_work(Inventory::from_params(params)?))
    });
    registry.register("comparison", |params, _catalog| {
        Ok(into_work(Comparison::from_params(params)?))
    });
    registry.register("orchestrator", |params, catalog| {
        Ok(into_work(ExperienceOrchestrator::from_params(params, catalog)?))
    });
}

trait Agent: Send + Sync + 'static {
    fn process(&self, ctx: &RunContext) -> Result<Value>;
}

fn into_work<A: Agent>(agent: A) -> Arc<dyn StageWork> {
    work_fn(move |ctx| agent.process(ctx))
}

/// The run input produced by `Catalog::initial_input`.
#[derive(Debug, Clone, Deserialize)]
struct RunInput {
    query: String,
    customer: CustomerProfile,
}

/// Parameters every agent understands.
#[derive(Debug, Clone, Default)]
struct Common {
    fail: Option<String>,
    source: Option<StageId>,
}

impl Common {
    fn take(params: &mut StageParameters) -> Result<Self> {
        Ok(Self {
            fail: take_string(params, "fail"),
            source: take_u32(params, "source")?.map(StageId),
        })
    }

    fn check(&self) -> Result<()> {
        if let Some(message) = &self.fail {
            bail!("{message}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryOutput {
    pub category: String,
    pub features: FeatureRequest,
    pub constraints: Constraints,
    pub season: Option<String>,
    pub use_case: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRequest {
    pub waterproof: bool,
    pub cushioning: Option<String>,
    pub breathable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub max_price: f64,
    pub size: u32,
}

struct ProductDiscovery {
    common: Common,
    category: String,
    confidence: f64,
}

impl ProductDiscovery {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let common = Common::take(&mut params)?;
        let category = take_string(&mut params, "category").unwrap_or_else(|| "running_shoes".into());
        let confidence = take_f64(&mut params, "confidence")?.unwrap_or(0.95);
        reject_unknown("product_discovery", &params)?;
        Ok(Self {
            common,
            category,
            confidence,
        })
    }
}

impl Agent for ProductDiscovery {
    fn process(&self, ctx: &RunContext) -> Result<Value> {
        self.common.check()?;
        let input: RunInput = ctx.input_as()?;
        let query = input.query.to_lowercase();
        let mentions = |words: &[&str]| words.iter().any(|word| query.contains(word));

        let season = if mentions(&["monsoon", "rain"]) {
            Some("monsoon".to_string())
        } else if mentions(&["summer"]) {
            Some("summer".to_string())
        } else if mentions(&["winter", "snow"]) {
            Some("winter".to_string())
        } else {
            None
        };

        let output = DiscoveryOutput {
            category: self.category.clone(),
            features: FeatureRequest {
                waterproof: mentions(&["waterproof", "monsoon", "rain", "wet"]),
                cushioning: mentions(&["cushion"]).then(|| "high".to_string()),
                breathable: mentions(&["breathable", "summer"]),
            },
            constraints: Constraints {
                max_price: parse_price(&query).unwrap_or(input.customer.budget),
                size: parse_size(&query).unwrap_or(input.customer.size),
            },
            season,
            use_case: if mentions(&["running", "run "]) {
                "outdoor_running".to_string()
            } else {
                "general".to_string()
            },
            confidence: self.confidence,
        };
        Ok(serde_json::to_value(output)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQueryOutput {
    pub cypher: String,
    pub products: Vec<Product>,
    pub candidates_considered: usize,
    pub hops: u32,
}

struct KnowledgeGraph {
    common: Common,
    products: Vec<Product>,
    hops: u32,
    limit: usize,
}

impl KnowledgeGraph {
    fn from_params(mut params: StageParameters, catalog: &Catalog) -> Result<Self> {
        let common = Common::take(&mut params)?;
        let hops = take_u32(&mut params, "hops")?.unwrap_or(5);
        let limit = take_u32(&mut params, "limit")?.unwrap_or(10) as usize;
        reject_unknown("knowledge_graph", &params)?;
        Ok(Self {
            common,
            products: catalog.products.clone(),
            hops,
            limit,
        })
    }
}

impl Agent for KnowledgeGraph {
    fn process(&self, ctx: &RunContext) -> Result<Value> {
        self.common.check()?;
        let request: DiscoveryOutput = ctx.upstream_as(self.common.source)?;

        let mut matches: Vec<Product> = self
            .products
            .iter()
            .filter(|p| p.category == request.category)
            .filter(|p| p.price <= request.constraints.max_price)
            .filter(|p| p.fits(request.constraints.size))
            .filter(|p| match (&request.season, &p.season) {
                (Some(wanted), Some(season)) => season == wanted || season == "all_weather",
                _ => true,
            })
            .cloned()
            .collect();
        if matches.is_empty() {
            bail!(
                "No products in '{}' under ${:.0} for size {}",
                request.category,
                request.constraints.max_price,
                request.constraints.size
            );
        }
        matches.sort_by(|a, b| {
            b.match_score
                .cmp(&a.match_score)
                .then(a.price.total_cmp(&b.price))
        });
        matches.truncate(self.limit);

        let output = GraphQueryOutput {
            cypher: build_cypher(&request, self.limit),
            products: matches,
            candidates_considered: self.products.len(),
            hops: self.hops,
        };
        Ok(serde_json::to_value(output)?)
    }
}

fn build_cypher(request: &DiscoveryOutput, limit: usize) -> String {
    let mut query = format!(
        "MATCH (p:Product)-[:BELONGS_TO]->(c:Category {{name: '{}'}})\n\
         WHERE p.price <= {} AND {} IN p.sizes",
        request.category, request.constraints.max_price, request.constraints.size
    );
    if request.features.waterproof {
        query.push_str("\nMATCH (p)-[f1:HAS_FEATURE]->(:Feature {name: 'waterproof'})");
    }
    if request.features.cushioning.is_some() {
        query.push_str("\nMATCH (p)-[f2:HAS_FEATURE]->(:Feature {name: 'high_cushioning'})");
    }
    if let Some(season) = &request.season {
        query.push_str(&format!(
            "\nMATCH (p)-[:SUITABLE_FOR]->(:Season {{name: '{season}'}})"
        ));
    }
    query.push_str(&format!(
        "\nRETURN p ORDER BY p.match_score DESC, p.price ASC LIMIT {limit}"
    ));
    query
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    LowStock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockedProduct {
    pub product: Product,
    pub stock_status: StockStatus,
    pub stores_verified: usize,
    pub delivery_estimate: String,
    pub cross_store_transfer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryOutput {
    pub products: Vec<StockedProduct>,
    pub stores_checked: u32,
    pub total_inventory: u64,
}

struct Inventory {
    common: Common,
    stores_checked: u32,
    delivery_estimate: String,
    low_stock_threshold: u32,
}

impl Inventory {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let common = Common::take(&mut params)?;
        let stores_checked = take_u32(&mut params, "stores_checked")?.unwrap_or(12);
        let delivery_estimate =
            take_string(&mut params, "delivery_estimate").unwrap_or_else(|| "2-3 days".into());
        let low_stock_threshold = take_u32(&mut params, "low_stock_threshold")?.unwrap_or(3);
        reject_unknown("inventory", &params)?;
        Ok(Self {
            common,
            stores_checked,
            delivery_estimate,
            low_stock_threshold,
        })
    }
}

impl Agent for Inventory {
    fn process(&self, ctx: &RunContext) -> Result<Value> {
        self.common.check()?;
        let graph: GraphQueryOutput = ctx.upstream_as(self.common.source)?;

        let products: Vec<StockedProduct> = graph
            .products
            .into_iter()
            .filter(|product| product.stock > 0)
            .map(|product| StockedProduct {
                stock_status: if product.stock > self.low_stock_threshold {
                    StockStatus::InStock
                } else {
                    StockStatus::LowStock
                },
                stores_verified: product.stores.len(),
                delivery_estimate: self.delivery_estimate.clone(),
                cross_store_transfer: product.stock < 2,
                product,
            })
            .collect();
        if products.is_empty() {
            bail!("None of the matched products are in stock");
        }

        let output = InventoryOutput {
            total_inventory: products.iter().map(|p| u64::from(p.product.stock)).sum(),
            stores_checked: self.stores_checked,
            products,
        };
        Ok(serde_json::to_value(output)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedProduct {
    pub rank: usize,
    pub product_id: u32,
    pub name: String,
    pub brand: String,
    pub price: f64,
    pub rating: f64,
    pub match_score: u32,
    pub waterproof: Option<String>,
    pub cushioning: Option<String>,
    pub stock_status: StockStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub best_overall: String,
    pub budget_option: String,
    pub best_cushioning: Option<String>,
    pub best_waterproof: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonOutput {
    pub ranking: Vec<RankedProduct>,
    pub insights: Insights,
}

struct Comparison {
    common: Common,
}

impl Comparison {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let common = Common::take(&mut params)?;
        reject_unknown("comparison", &params)?;
        Ok(Self { common })
    }
}

impl Agent for Comparison {
    fn process(&self, ctx: &RunContext) -> Result<Value> {
        self.common.check()?;
        let inventory: InventoryOutput = ctx.upstream_as(self.common.source)?;

        let mut stocked = inventory.products;
        stocked.sort_by(|a, b| {
            b.product
                .match_score
                .cmp(&a.product.match_score)
                .then(a.product.price.total_cmp(&b.product.price))
        });
        let ranking: Vec<RankedProduct> = stocked
            .iter()
            .enumerate()
            .map(|(idx, item)| RankedProduct {
                rank: idx + 1,
                product_id: item.product.id,
                name: item.product.name.clone(),
                brand: item.product.brand.clone(),
                price: item.product.price,
                rating: item.product.rating,
                match_score: item.product.match_score,
                waterproof: item.product.feature("waterproof").map(str::to_string),
                cushioning: item.product.feature("cushioning").map(str::to_string),
                stock_status: item.stock_status,
            })
            .collect();

        let (Some(best), Some(budget)) = (
            ranking.first(),
            ranking.iter().min_by(|a, b| a.price.total_cmp(&b.price)),
        ) else {
            bail!("Nothing to compare: inventory returned no products");
        };

        let insights = Insights {
            best_overall: format!(
                "The {} offers the best overall value with a {}% match score.",
                best.name, best.match_score
            ),
            budget_option: format!(
                "The {} at ${:.0} is the pick for budget-conscious shoppers.",
                budget.name, budget.price
            ),
            best_cushioning: strongest(&ranking, |p| p.cushioning.as_deref()).map(|(p, pct)| {
                format!("For maximum cushioning, the {} leads at {pct}%.", p.name)
            }),
            best_waterproof: strongest(&ranking, |p| p.waterproof.as_deref()).map(|(p, pct)| {
                format!("The {} provides the strongest waterproofing at {pct}%.", p.name)
            }),
        };

        Ok(serde_json::to_value(ComparisonOutput { ranking, insights })?)
    }
}

fn strongest<'a>(
    ranking: &'a [RankedProduct],
    feature: impl Fn(&RankedProduct) -> Option<&str>,
) -> Option<(&'a RankedProduct, u32)> {
    ranking
        .iter()
        .filter_map(|p| feature(p).and_then(parse_percent).map(|pct| (p, pct)))
        .max_by_key(|(_, pct)| *pct)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationOutput {
    pub greeting: String,
    pub results_summary: String,
    pub top_recommendation: RankedProduct,
    pub insights: Insights,
    pub complementary_products: Vec<ComplementaryProduct>,
    pub upsell_message: Option<String>,
    pub next_steps: Vec<String>,
    pub conversation_stage: String,
}

struct ExperienceOrchestrator {
    common: Common,
    complementary: Vec<ComplementaryProduct>,
    min_purchase_frequency: u32,
}

impl ExperienceOrchestrator {
    fn from_params(mut params: StageParameters, catalog: &Catalog) -> Result<Self> {
        let common = Common::take(&mut params)?;
        let min_purchase_frequency =
            take_u32(&mut params, "min_purchase_frequency")?.unwrap_or(40);
        reject_unknown("orchestrator", &params)?;
        Ok(Self {
            common,
            complementary: catalog.complementary.clone(),
            min_purchase_frequency,
        })
    }
}

impl Agent for ExperienceOrchestrator {
    fn process(&self, ctx: &RunContext) -> Result<Value> {
        self.common.check()?;
        let input: RunInput = ctx.input_as()?;
        let comparison: ComparisonOutput = ctx.upstream_as(self.common.source)?;
        let Some(top) = comparison.ranking.first().cloned() else {
            bail!("Comparison produced an empty ranking");
        };

        let complementary: Vec<ComplementaryProduct> = self
            .complementary
            .iter()
            .filter(|item| item.purchase_frequency > self.min_purchase_frequency)
            .cloned()
            .collect();
        let upsell_message = (!complementary.is_empty()).then(|| {
            let names: Vec<&str> = complementary.iter().map(|c| c.name.as_str()).collect();
            format!("Customers who bought these often add: {}", names.join(", "))
        });

        let output = OrchestrationOutput {
            greeting: format!(
                "Hi {}! I compared every match in the catalog to find your best fit.",
                input.customer.name
            ),
            results_summary: format!(
                "Found {} options that match your requirements under ${:.0}.",
                comparison.ranking.len(),
                input.customer.budget
            ),
            top_recommendation: top,
            insights: comparison.insights,
            complementary_products: complementary,
            upsell_message,
            next_steps: vec![
                "View detailed product comparison".to_string(),
                "Check store availability".to_string(),
                "Add to cart and checkout".to_string(),
            ],
            conversation_stage: "recommendation".to_string(),
        };
        Ok(serde_json::to_value(output)?)
    }
}

fn parse_price(query: &str) -> Option<f64> {
    query
        .split_whitespace()
        .find_map(|token| token.strip_prefix('$'))
        .and_then(|amount| {
            amount
                .replace(',', "")
                .trim_end_matches(|c: char| !c.is_ascii_digit())
                .parse()
                .ok()
        })
}

fn parse_size(query: &str) -> Option<u32> {
    let tokens: Vec<&str> = query.split_whitespace().collect();
    tokens.windows(2).find_map(|pair| {
        (pair[0].trim_end_matches(':') == "size")
            .then(|| pair[1].trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())
            .flatten()
    })
}

fn parse_percent(value: &str) -> Option<u32> {
    value.trim().trim_end_matches('%').parse().ok()
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).map(|value| match value {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// Reads a non-negative integer parameter, accepting quoted numbers.
pub(crate) fn value_as_u32(key: &str, value: &Value) -> Result<u32> {
    let parsed = match value {
        Value::Number(num) => num.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| anyhow!("Parameter '{key}' must be a non-negative integer, got {value}"))
}

fn take_u32(params: &mut StageParameters, key: &str) -> Result<Option<u32>> {
    params
        .remove(key)
        .map(|value| value_as_u32(key, &value))
        .transpose()
}

fn take_f64(params: &mut StageParameters, key: &str) -> Result<Option<f64>> {
    params
        .remove(key)
        .map(|value| {
            let parsed = match &value {
                Value::Number(num) => num.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            parsed.ok_or_else(|| anyhow!("Parameter '{key}' must be a number, got {value}"))
        })
        .transpose()
}

fn reject_unknown(agent: &str, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<&str> = params.keys().map(String::as_str).collect();
    keys.sort_unstable();
    bail!("{agent} does not accept parameter(s): {}", keys.join(", "))
}
