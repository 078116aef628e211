// Metrics module - everything between a catalog entry and a single number
//
// A metric value is produced in three steps:
// 1. `api` fetches the raw JSON for one selector from the metrics API
// 2. `extract` pulls every `values` entry out of that JSON
// 3. `normalize` averages the numbers and rescales them by selector name
//
// The fetch step sits behind the `MetricSource` trait so the scheduler can be
// driven by an in-memory source in tests.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

pub mod api;
pub mod extract;
pub mod normalize;

pub use api::{ApiClient, FetchError};
pub use normalize::NormalizeError;

/// Key under which the metrics API reports data points
pub const VALUES_KEY: &str = "values";

/// Catalog sentinel meaning "do not scope the query to an entity"
pub const NO_ENTITY: &str = "empty";

/// Optional entity scoping for a metric query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityScope {
    /// Query the metric across all entities
    All,

    /// Restrict the query to one monitored entity
    Entity(String),
}

impl EntityScope {
    /// Parses the catalog's entity column, mapping the `empty` sentinel to `All`
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == NO_ENTITY {
            EntityScope::All
        } else {
            EntityScope::Entity(raw.to_string())
        }
    }

    /// Value for the `entitySelector` query parameter, if any
    ///
    /// # Returns
    /// * `None` - for `All`, the parameter is left out of the query
    /// * `Some("entityId(<id>)")` - for a single entity
    pub fn selector(&self) -> Option<String> {
        match self {
            EntityScope::All => None,
            EntityScope::Entity(id) => Some(format!("entityId({})", id)),
        }
    }
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityScope::All => f.write_str("all entities"),
            EntityScope::Entity(id) => write!(f, "entity {}", id),
        }
    }
}

/// One row of the metric catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricDefinition {
    /// Text of the sheet cell that labels this metric's row
    pub sheet_label: String,

    /// Metric selector sent to the API
    pub selector: String,

    pub entity: EntityScope,

    /// Name printed next to the computed value on the console
    pub display_label: String,
}

/// Source of raw metric responses
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Fetches the raw JSON response for one selector
    ///
    /// # Errors
    /// Any transport, status or decoding problem is a `FetchError`. Callers
    /// treat it as "no data" for this metric.
    async fn fetch(&self, selector: &str, entity: &EntityScope) -> Result<Value, FetchError>;
}

/// Why a metric produced no value
#[derive(Error, Debug)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),
}

/// Fetches, extracts and normalizes one catalog entry
///
/// # Returns
/// * `Ok(f64)` - the averaged, rescaled value
/// * `Err(CollectError)` - the metric should be skipped for this run
pub async fn collect_metric(
    source: &dyn MetricSource,
    definition: &MetricDefinition,
) -> Result<f64, CollectError> {
    let response = source.fetch(&definition.selector, &definition.entity).await?;

    let extracted = extract::extract_values(&response, VALUES_KEY);
    debug!(
        "Extracted {} '{}' entr(ies) for {}",
        extracted.len(),
        VALUES_KEY,
        definition.selector
    );

    Ok(normalize::normalize(&definition.selector, &extracted)?)
}
